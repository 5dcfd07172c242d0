use std::env;
use std::io::Write;
use std::time::Duration;

use anyhow::{bail, Result};
use cactus_cap::{BridgeConfig, CactusPlugin, ScriptedCapability, SharedCapability};
use cactus_events::StreamEvent;
use futures::StreamExt;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    let prompt = env::args()
        .nth(1)
        .unwrap_or_else(|| "write a haiku about cacti".to_string());

    let models_dir = env::temp_dir().join("cactus-stream-chat");
    let capability: SharedCapability = std::sync::Arc::new(
        ScriptedCapability::new()
            .with_tokens(["spines ", "hold ", "the ", "morning ", "dew"])
            .with_token_delay(Duration::from_millis(120)),
    );
    let plugin = CactusPlugin::load(BridgeConfig::with_models_dir(&models_dir), capability)?;
    let mut events = plugin.listen_streaming();

    let loaded = plugin.call("initializeModel", &json!({})).await;
    println!("initialize: {loaded}");

    let ack = plugin
        .call(
            "generateStreamingCompletion",
            &json!({ "messages": [{ "role": "user", "content": prompt }] }),
        )
        .await;
    println!("ack: {ack}\n");

    while let Some(event) = events.next().await {
        match event.data {
            StreamEvent::Start => println!("--- start ---"),
            StreamEvent::Token { token } => {
                print!("{token}");
                std::io::stdout().flush()?;
            }
            StreamEvent::Done {
                generation_metrics, ..
            } => {
                println!(
                    "\n--- done: {} tokens, {:.1} tok/s ---",
                    generation_metrics.total_tokens, generation_metrics.tokens_per_second
                );
                break;
            }
            StreamEvent::Error { error } => bail!("stream failed: {error}"),
        }
    }

    plugin.call("unloadModel", &json!({})).await;
    Ok(())
}
