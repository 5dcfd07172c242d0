//! JSON-lines host harness.
//!
//! Plays the application shell: each stdin line is `{"id", "method", "args"}`,
//! each answer is written as `{"id", "result"}`, and every bus event is
//! forwarded as `{"event", "data"}`. Logs go to stderr and the data directory.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use cactus_cap::config::default_data_dir;
use cactus_cap::{Backend, BridgeConfig, CactusPlugin};
use cactus_events::send_event;
use clap::Parser;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHUTDOWN_EVENT: &str = "cactusHarnessShutdown";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "cactus-cap")]
struct Cli {
    /// Where downloaded models live (default: <data dir>/models)
    #[arg(long, env = "CACTUS_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// JSON file replacing the built-in model catalog
    #[arg(long, env = "CACTUS_CATALOG")]
    catalog: Option<PathBuf>,

    #[arg(long, value_enum, env = "CACTUS_BACKEND", default_value_t = Backend::Scripted)]
    backend: Backend,

    /// Model download host
    #[arg(long, env = "CACTUS_DOWNLOAD_URL")]
    download_url: Option<String>,

    /// Directory for logs (default: platform data dir + /cactus)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Debug, Deserialize)]
struct HostRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    args: Value,
}

fn setup_logging(data_dir: &PathBuf, cli: &Cli) -> Result<WorkerGuard> {
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("cactus-cap")
        .filename_suffix("log")
        .max_log_files(5)
        .build(data_dir)?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let make_env_filter = || -> Result<EnvFilter> {
        let filter = EnvFilter::from_default_env()
            .add_directive("info".parse()?)
            .add_directive("reqwest=warn".parse()?)
            .add_directive("hyper=warn".parse()?);

        let filter = env::var("CACTUS_LOG")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .fold(filter, |filter, module_directive| {
                match module_directive.parse() {
                    Ok(directive) => filter.add_directive(directive),
                    Err(e) => {
                        eprintln!(
                            "warning: invalid log directive '{}': {}",
                            module_directive, e
                        );
                        filter
                    }
                }
            });

        if cli.debug {
            Ok(filter.add_directive("cactus_cap=debug".parse()?))
        } else {
            Ok(filter)
        }
    };

    let timer =
        tracing_subscriber::fmt::time::ChronoLocal::new("%Y-%m-%dT%H:%M:%S%.6fZ".to_string());

    // stdout carries the protocol, so the console layer writes to stderr
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(timer.clone())
                .with_filter(make_env_filter()?),
        )
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_timer(timer)
                .with_ansi(false)
                .with_filter(make_env_filter()?),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

fn build_config(cli: &Cli, data_dir: &PathBuf) -> Result<BridgeConfig> {
    let mut config = BridgeConfig::with_models_dir(
        cli.models_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("models")),
    );
    if let Some(url) = &cli.download_url {
        config.download_base_url = url.clone();
    }
    if let Some(catalog) = &cli.catalog {
        config.load_catalog(catalog)?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let _log_guard = setup_logging(&data_dir, &cli)?;

    let config = build_config(&cli, &data_dir)?;
    let capability = cli.backend.build(&config)?;
    let plugin = CactusPlugin::load(config, capability)?;
    info!(backend = ?cli.backend, "harness ready");

    // single writer so result and event lines never interleave mid-line
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = out_rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if let Err(err) = stdout.write_all(line.as_bytes()).await {
                error!(error = %err, "stdout closed");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // subscribed before the first call, so no event is missed
    let mut events = plugin.listen_all();
    let events_tx = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if event.name == SHUTDOWN_EVENT {
                break;
            }
            if events_tx
                .send(json!({ "event": event.name, "data": event.data }))
                .is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<HostRequest>(&line) {
            Ok(request) => {
                debug!(method = %request.method, "host call");
                let result = plugin.call(&request.method, &request.args).await;
                json!({ "id": request.id, "result": result })
            }
            Err(err) => {
                warn!(error = %err, "unreadable host request");
                json!({
                    "id": Value::Null,
                    "result": { "success": false, "error": format!("Invalid request: {err}") },
                })
            }
        };
        if out_tx.send(response).is_err() {
            break;
        }
    }

    // let in-flight streams finish, then flush everything published before the marker
    plugin.bridge().wait_for_streams().await;
    send_event(SHUTDOWN_EVENT, Value::Null)?;
    let _ = forwarder.await;
    drop(out_tx);
    let _ = writer.await;

    info!("stdin closed, harness exiting");
    Ok(())
}
