//! The model session bridge.
//!
//! Owns the single session record (`Unloaded -> Loading -> Ready -> Unloaded`)
//! and runs every operation against the capability on the blocking pool, so
//! the caller's thread never waits on the runtime. Streaming completions are
//! published as [`StreamEvent`]s on [`STREAMING_RESPONSE_EVENT`].
//!
//! At most one streaming completion per session is expected in flight. Two
//! concurrent streams interleave their events on the shared channel.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use cactus_events::{
    emit_download_finished, emit_download_progress, emit_stream_event, DownloadFinishedEvent,
    DownloadProgressEvent, StreamEvent,
};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::capability::SharedCapability;
use crate::error::BridgeError;
use crate::models_dir::ModelsDirectory;
use crate::types::{
    ChatTurn, CompletionRequest, CompletionResult, DownloadProgress, EmbeddingResult, InitParams,
    ModelInfo, TranscriptionRequest, TranscriptionResult,
};

pub use cactus_events::STREAMING_RESPONSE_EVENT;

pub type StreamEvents = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
}

/// Snapshot of the live binding to a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: SessionState,
    pub model_slug: Option<String>,
    pub model_path: Option<PathBuf>,
    pub context_size: Option<u32>,
}

impl Session {
    fn unloaded() -> Self {
        Self {
            state: SessionState::Unloaded,
            model_slug: None,
            model_path: None,
            context_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    pub model_path: PathBuf,
    pub download_time_ms: u64,
    pub model_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableModel {
    #[serde(flatten)]
    pub info: ModelInfo,
    pub is_downloaded: bool,
    pub path: String,
}

/// Fixed placeholder: the runtime exposes no download progress query.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgressSnapshot {
    pub progress: f64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub status: &'static str,
}

impl Default for DownloadProgressSnapshot {
    fn default() -> Self {
        Self {
            progress: 0.0,
            total_bytes: 0,
            downloaded_bytes: 0,
            status: "unknown",
        }
    }
}

/// Completion handle for a detached streaming completion.
#[derive(Clone)]
pub struct StreamTicket {
    done: watch::Receiver<bool>,
}

impl StreamTicket {
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the terminal event has been published.
    pub async fn finished(mut self) {
        // an Err means the publisher is gone, which is just as final
        let _ = self.done.wait_for(|done| *done).await;
    }
}

pub struct SessionBridge {
    capability: SharedCapability,
    models: ModelsDirectory,
    session: Arc<Mutex<Session>>,
    streams: Mutex<Vec<StreamTicket>>,
}

impl SessionBridge {
    pub fn new(capability: SharedCapability, models: ModelsDirectory) -> Self {
        Self {
            capability,
            models,
            session: Arc::new(Mutex::new(Session::unloaded())),
            streams: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    pub fn models(&self) -> &ModelsDirectory {
        &self.models
    }

    /// Fetch model assets unless they are already on disk.
    pub async fn download(&self, slug: &str) -> Result<DownloadOutcome, BridgeError> {
        const ACTION: &str = "downloading model";

        self.models
            .ensure()
            .map_err(|e| BridgeError::capability(ACTION, e))?;
        let target = self.models.model_path(slug);

        if self.models.has_model(slug) {
            info!(slug, path = %target.display(), "model already downloaded");
            return Ok(DownloadOutcome {
                model_path: target,
                download_time_ms: 0,
                model_exists: true,
            });
        }

        info!(slug, capability = self.capability.name(), "downloading model");
        let capability = Arc::clone(&self.capability);
        let slug_owned = slug.to_string();
        let target_dir = target.clone();
        let started = Instant::now();

        tokio::task::spawn_blocking(move || {
            let mut on_progress = |progress: DownloadProgress| {
                emit_download_progress(DownloadProgressEvent {
                    model_slug: slug_owned.clone(),
                    stage: progress.stage,
                    progress: progress.fraction,
                })
            };
            capability.download_model(&slug_owned, &target_dir, &mut on_progress)
        })
        .await
        .map_err(|source| BridgeError::Runtime {
            action: ACTION,
            source,
        })?
        .map_err(|e| BridgeError::capability(ACTION, e))?;

        let download_time_ms = started.elapsed().as_millis() as u64;
        info!(slug, download_time_ms, "model download completed");
        emit_download_finished(DownloadFinishedEvent {
            model_slug: slug.to_string(),
            model_path: target.display().to_string(),
        });

        Ok(DownloadOutcome {
            model_path: target,
            download_time_ms,
            model_exists: false,
        })
    }

    pub async fn available_models(&self) -> Result<Vec<AvailableModel>, BridgeError> {
        const ACTION: &str = "getting available models";

        let capability = Arc::clone(&self.capability);
        let models = tokio::task::spawn_blocking(move || capability.list_models())
            .await
            .map_err(|source| BridgeError::Runtime {
                action: ACTION,
                source,
            })?
            .map_err(|e| BridgeError::capability(ACTION, e))?;

        Ok(models
            .into_iter()
            .map(|info| AvailableModel {
                is_downloaded: self.models.has_model(&info.slug),
                path: self.models.model_path(&info.slug).display().to_string(),
                info,
            })
            .collect())
    }

    /// Bind the session to a model, by slug or by an explicit bundled path.
    ///
    /// A model already loaded is released first. On failure the session ends
    /// up `Unloaded` and may be retried.
    pub async fn initialize(
        &self,
        slug: &str,
        model_path: Option<PathBuf>,
        context_size: u32,
    ) -> Result<PathBuf, BridgeError> {
        const ACTION: &str = "initializing model";

        let was_ready = {
            let mut session = self.session.lock();
            if session.state == SessionState::Loading {
                return Err(BridgeError::AlreadyLoading);
            }
            let was_ready = session.state == SessionState::Ready;
            *session = Session {
                state: SessionState::Loading,
                ..Session::unloaded()
            };
            was_ready
        };

        info!(slug, context_size, "initializing model");

        let capability = Arc::clone(&self.capability);
        let params = InitParams {
            model_slug: slug.to_string(),
            model_path: model_path.clone(),
            context_size,
        };
        let joined = tokio::task::spawn_blocking(move || {
            if was_ready {
                if let Err(err) = capability.unload() {
                    warn!(error = %err, "failed to release previous model before loading");
                }
            }
            capability.initialize(&params)
        })
        .await;

        let resolved_path = model_path.unwrap_or_else(|| self.models.model_path(slug));
        let mut session = self.session.lock();
        match joined {
            Ok(Ok(())) => {
                *session = Session {
                    state: SessionState::Ready,
                    model_slug: Some(slug.to_string()),
                    model_path: Some(resolved_path.clone()),
                    context_size: Some(context_size),
                };
                info!(slug, path = %resolved_path.display(), "model ready");
                Ok(resolved_path)
            }
            Ok(Err(err)) => {
                *session = Session::unloaded();
                warn!(slug, error = %err, "model initialization failed");
                Err(BridgeError::capability(ACTION, err))
            }
            Err(source) => {
                *session = Session::unloaded();
                Err(BridgeError::Runtime {
                    action: ACTION,
                    source,
                })
            }
        }
    }

    /// Slug of the loaded model, or `NoModelInitialized`.
    fn ensure_ready(&self) -> Result<String, BridgeError> {
        let session = self.session.lock();
        match (&session.state, &session.model_slug) {
            (SessionState::Ready, Some(slug)) => Ok(slug.clone()),
            _ => Err(BridgeError::NoModelInitialized),
        }
    }

    /// Generate to completion and return the full result.
    pub async fn complete(
        &self,
        turns: Vec<ChatTurn>,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, BridgeError> {
        const ACTION: &str = "generating completion";

        self.ensure_ready()?;
        if !request.tools.is_empty() {
            debug!(
                tools = request.tools.len(),
                "tool definitions are not forwarded to the runtime"
            );
        }
        let params = request.to_params();
        debug!(turns = turns.len(), ?params, "generating completion");

        let capability = Arc::clone(&self.capability);
        tokio::task::spawn_blocking(move || capability.generate_completion(&turns, &params, None))
            .await
            .map_err(|source| BridgeError::Runtime {
                action: ACTION,
                source,
            })?
            .map_err(|e| BridgeError::capability(ACTION, e))
    }

    /// The event sequence for one streaming completion, not yet running.
    ///
    /// Yields `Start`, then a `Token` per decoded fragment, then exactly one of
    /// `Done` or `Error`. Generation begins when the stream is first polled;
    /// dropping the stream stops event delivery.
    pub fn completion_events(
        &self,
        turns: Vec<ChatTurn>,
        request: &CompletionRequest,
    ) -> Result<StreamEvents, BridgeError> {
        let model_slug = self.ensure_ready()?;
        let params = request.to_params();
        let capability = Arc::clone(&self.capability);

        Ok(Box::pin(stream! {
            yield StreamEvent::Start;

            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            let handle = tokio::task::spawn_blocking(move || {
                let mut on_token = |token: &str| {
                    let _ = tx.send(token.to_string());
                };
                capability.generate_completion(&turns, &params, Some(&mut on_token))
            });

            // the sender lives in the blocking task, so this drains every token
            // before the final result is inspected
            while let Some(token) = rx.recv().await {
                yield StreamEvent::Token { token };
            }

            match handle.await {
                Ok(Ok(result)) => {
                    yield StreamEvent::Done {
                        success: result.success,
                        response: result.response,
                        model_slug: Some(model_slug),
                        generation_metrics: result.metrics,
                        tool_calls: result.tool_calls,
                    };
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "streaming completion failed");
                    yield StreamEvent::Error {
                        error: BridgeError::capability("in streaming completion", err).to_string(),
                    };
                }
                Err(source) => {
                    yield StreamEvent::Error {
                        error: BridgeError::Runtime { action: "in streaming completion", source }
                            .to_string(),
                    };
                }
            }
        }))
    }

    /// Start a streaming completion and return as soon as it is scheduled.
    ///
    /// Events are published on [`STREAMING_RESPONSE_EVENT`]; failures during
    /// generation arrive as an `error` event, not through this result.
    pub fn stream_completion(
        &self,
        turns: Vec<ChatTurn>,
        request: &CompletionRequest,
    ) -> Result<StreamTicket, BridgeError> {
        let turn_count = turns.len();
        let mut events = self.completion_events(turns, request)?;

        let (done_tx, done_rx) = watch::channel(false);
        let span = info_span!("streaming_completion", turns = turn_count);
        tokio::spawn(
            async move {
                let mut published = 0usize;
                while let Some(event) = events.next().await {
                    let terminal = event.is_terminal();
                    emit_stream_event(event);
                    published += 1;
                    if terminal {
                        break;
                    }
                }
                debug!(published, "streaming completion finished");
                let _ = done_tx.send(true);
            }
            .instrument(span),
        );

        let ticket = StreamTicket { done: done_rx };
        let mut streams = self.streams.lock();
        streams.retain(|t| !t.is_finished());
        streams.push(ticket.clone());
        Ok(ticket)
    }

    /// Wait until every streaming completion started so far has published its
    /// terminal event.
    pub async fn wait_for_streams(&self) {
        let pending = std::mem::take(&mut *self.streams.lock());
        for ticket in pending {
            ticket.finished().await;
        }
    }

    pub async fn transcribe(
        &self,
        request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, BridgeError> {
        const ACTION: &str = "transcribing audio";

        self.ensure_ready()?;
        let prompt = request.resolved_prompt();
        let params = request.to_params();
        info!(path = %request.audio_path.display(), "transcribing audio");

        let capability = Arc::clone(&self.capability);
        tokio::task::spawn_blocking(move || {
            capability.transcribe(&request.audio_path, &prompt, &params)
        })
        .await
        .map_err(|source| BridgeError::Runtime {
            action: ACTION,
            source,
        })?
        .map_err(|e| BridgeError::capability(ACTION, e))
    }

    pub async fn embed(&self, text: &str) -> Result<EmbeddingResult, BridgeError> {
        const ACTION: &str = "generating embeddings";

        self.ensure_ready()?;
        debug!(chars = text.len(), "generating embeddings");

        let capability = Arc::clone(&self.capability);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || capability.generate_embedding(&text))
            .await
            .map_err(|source| BridgeError::Runtime {
                action: ACTION,
                source,
            })?
            .map_err(|e| BridgeError::capability(ACTION, e))
    }

    pub fn image_embeddings(&self, image_path: &str) -> Result<EmbeddingResult, BridgeError> {
        debug!(image_path, "image embeddings requested");
        Err(BridgeError::not_supported("Image embeddings"))
    }

    pub fn audio_embeddings(&self, audio_path: &str) -> Result<EmbeddingResult, BridgeError> {
        debug!(audio_path, "audio embeddings requested");
        Err(BridgeError::not_supported("Audio embeddings"))
    }

    /// Release the loaded model. Calling this with nothing loaded is a no-op
    /// that reports `"No model loaded"`.
    pub async fn unload(&self) -> Result<&'static str, BridgeError> {
        const ACTION: &str = "unloading model";

        {
            let session = self.session.lock();
            match session.state {
                SessionState::Unloaded => return Ok("No model loaded"),
                SessionState::Loading => return Err(BridgeError::AlreadyLoading),
                SessionState::Ready => {}
            }
        }

        info!("unloading model");
        let capability = Arc::clone(&self.capability);
        let joined = tokio::task::spawn_blocking(move || capability.unload()).await;

        // the binding is gone either way; a runtime that refused to release is reported, not retried
        *self.session.lock() = Session::unloaded();

        joined
            .map_err(|source| BridgeError::Runtime {
                action: ACTION,
                source,
            })?
            .map_err(|e| BridgeError::capability(ACTION, e))?;
        Ok("Model unloaded successfully")
    }

    pub fn pause_download(&self, slug: Option<&str>) -> Result<(), BridgeError> {
        debug!(?slug, "pause download requested");
        Err(BridgeError::not_supported("Pause download"))
    }

    pub fn resume_download(&self, slug: Option<&str>) -> Result<(), BridgeError> {
        debug!(?slug, "resume download requested");
        Err(BridgeError::not_supported("Resume download"))
    }

    pub fn cancel_download(&self, slug: Option<&str>) -> Result<(), BridgeError> {
        debug!(?slug, "cancel download requested");
        Err(BridgeError::not_supported("Cancel download"))
    }

    pub fn download_progress(&self, slug: Option<&str>) -> DownloadProgressSnapshot {
        debug!(?slug, "download progress requested");
        DownloadProgressSnapshot::default()
    }
}
