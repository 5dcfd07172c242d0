//! The call adapter: host method name + JSON arguments in, JSON result out.
//!
//! Arguments are validated and defaulted here before the session bridge is
//! touched. Every outcome, including failures, becomes an object carrying
//! `success`, so nothing escapes to the host as an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::{
    BridgeConfig, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P,
    DEFAULT_TRANSCRIBE_MAX_TOKENS, DEFAULT_TRANSCRIBE_TEMPERATURE,
};
use crate::error::BridgeError;
use crate::session::SessionBridge;
use crate::types::{ChatRole, ChatTurn, CompletionRequest, ToolDefinition, TranscriptionRequest};

/// A fully validated host invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCall {
    Echo {
        value: Value,
    },
    DownloadModel {
        slug: String,
    },
    GetAvailableModels,
    InitializeModel {
        slug: String,
        model_path: Option<PathBuf>,
        context_size: u32,
    },
    GenerateCompletion {
        turns: Vec<ChatTurn>,
        request: CompletionRequest,
    },
    GenerateStreamingCompletion {
        turns: Vec<ChatTurn>,
        request: CompletionRequest,
    },
    TranscribeAudio(TranscriptionRequest),
    UnloadModel,
    GetTextEmbeddings {
        text: String,
    },
    GetImageEmbeddings {
        image_path: String,
    },
    GetAudioEmbeddings {
        audio_path: String,
    },
    PauseDownload {
        slug: Option<String>,
    },
    ResumeDownload {
        slug: Option<String>,
    },
    CancelDownload {
        slug: Option<String>,
    },
    GetDownloadProgress {
        slug: Option<String>,
    },
}

impl BridgeCall {
    /// Validate `args` for `method`, applying per-operation defaults.
    pub fn parse(method: &str, args: &Value, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let args = Args::new(args);
        let default_slug = || config.default_model_slug.clone();
        let context_size = || args.context_size("contextSize", config.default_context_size);

        let call = match method {
            "echo" => BridgeCall::Echo {
                value: args.get("value").cloned().unwrap_or(Value::Null),
            },
            "downloadModel" => BridgeCall::DownloadModel {
                slug: args.slug()?.unwrap_or_else(default_slug),
            },
            "getAvailableModels" => BridgeCall::GetAvailableModels,
            "initializeModel" => BridgeCall::InitializeModel {
                slug: args.slug()?.unwrap_or_else(default_slug),
                model_path: args.string("modelPath").map(PathBuf::from),
                context_size: context_size(),
            },
            "loadModel" => BridgeCall::InitializeModel {
                slug: args.slug()?.ok_or_else(|| BridgeError::missing("modelSlug"))?,
                model_path: None,
                context_size: context_size(),
            },
            "loadLocalModel" => {
                let model_path = PathBuf::from(args.require_string("modelPath")?);
                BridgeCall::InitializeModel {
                    slug: args.slug()?.unwrap_or_else(default_slug),
                    model_path: Some(model_path),
                    context_size: context_size(),
                }
            }
            "generateCompletion" => BridgeCall::GenerateCompletion {
                turns: args.chat_turns()?,
                request: args.completion_request(),
            },
            "generateStreamingCompletion" => BridgeCall::GenerateStreamingCompletion {
                turns: args.chat_turns()?,
                request: args.completion_request(),
            },
            "transcribeAudio" => {
                let mut request = TranscriptionRequest::new(args.require_string("audioPath")?);
                request.prompt = args.string("prompt");
                request.language = args.string("language");
                request.temperature = args.f32_or("temperature", DEFAULT_TRANSCRIBE_TEMPERATURE);
                request.max_tokens = args.i64_or("maxTokens", DEFAULT_TRANSCRIBE_MAX_TOKENS);
                BridgeCall::TranscribeAudio(request)
            }
            "unloadModel" => BridgeCall::UnloadModel,
            "getTextEmbeddings" => BridgeCall::GetTextEmbeddings {
                text: args.require_string("text")?,
            },
            "getImageEmbeddings" => BridgeCall::GetImageEmbeddings {
                image_path: args.require_string("imagePath")?,
            },
            "getAudioEmbeddings" => BridgeCall::GetAudioEmbeddings {
                audio_path: args.require_string("audioPath")?,
            },
            // download controls: arguments are accepted but never required
            "pauseDownload" => BridgeCall::PauseDownload {
                slug: args.string("modelSlug"),
            },
            "resumeDownload" => BridgeCall::ResumeDownload {
                slug: args.string("modelSlug"),
            },
            "cancelDownload" => BridgeCall::CancelDownload {
                slug: args.string("modelSlug"),
            },
            "getDownloadProgress" => BridgeCall::GetDownloadProgress {
                slug: args.string("modelSlug"),
            },
            other => {
                return Err(BridgeError::Validation(format!(
                    "Unknown method: {other}"
                )))
            }
        };
        Ok(call)
    }
}

/// Read-only view over a host argument object. Anything other than an
/// object is treated as an empty argument list.
struct Args<'a> {
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Args<'a> {
    fn new(value: &'a Value) -> Self {
        Self {
            map: value.as_object(),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.and_then(|map| map.get(key))
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str).map(str::to_string)
    }

    fn require_string(&self, key: &str) -> Result<String, BridgeError> {
        self.string(key).ok_or_else(|| BridgeError::missing(key))
    }

    /// `modelSlug`, if present. A slug names one directory inside the models
    /// directory, so anything that could resolve elsewhere is rejected.
    fn slug(&self) -> Result<Option<String>, BridgeError> {
        let Some(slug) = self.string("modelSlug") else {
            return Ok(None);
        };
        let escapes = slug.is_empty()
            || slug == "."
            || slug.contains("..")
            || slug.contains(['/', '\\', '\0'])
            || Path::new(&slug).is_absolute();
        if escapes {
            return Err(BridgeError::Validation(format!("Invalid modelSlug: {slug:?}")));
        }
        Ok(Some(slug))
    }

    fn f32_or(&self, key: &str, default: f32) -> f32 {
        self.get(key)
            .and_then(Value::as_f64)
            .map(|v| v as f32)
            .unwrap_or(default)
    }

    fn i64_or(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(value) => value
                .as_i64()
                .or_else(|| value.as_f64().map(|v| v as i64))
                .unwrap_or(default),
            None => default,
        }
    }

    fn context_size(&self, key: &str, default: u32) -> u32 {
        let size = self.i64_or(key, default as i64);
        if size > 0 {
            size.min(u32::MAX as i64) as u32
        } else {
            default
        }
    }

    fn array(&self, key: &str) -> Option<&'a Vec<Value>> {
        self.get(key).and_then(Value::as_array)
    }

    fn chat_turns(&self) -> Result<Vec<ChatTurn>, BridgeError> {
        let messages = self
            .array("messages")
            .ok_or_else(|| BridgeError::Validation("Invalid messages format".to_string()))?;
        Ok(parse_chat_turns(messages))
    }

    fn completion_request(&self) -> CompletionRequest {
        CompletionRequest {
            temperature: self.f32_or("temperature", DEFAULT_TEMPERATURE),
            max_tokens: self.i64_or("maxTokens", DEFAULT_MAX_TOKENS),
            top_p: self.f32_or("topP", DEFAULT_TOP_P),
            top_k: self.i64_or("topK", DEFAULT_TOP_K),
            stop_sequences: self
                .array("stopSequences")
                .map(|s| parse_stop_sequences(s))
                .unwrap_or_default(),
            tools: self.array("tools").map(|t| parse_tools(t)).unwrap_or_default(),
        }
    }
}

/// Convert host chat turns, dropping malformed entries and keeping order.
///
/// A turn needs a string `role` naming a known role and a string `content`.
/// Non-string `images` entries are dropped individually.
pub fn parse_chat_turns(messages: &[Value]) -> Vec<ChatTurn> {
    messages
        .iter()
        .enumerate()
        .filter_map(|(index, message)| {
            let turn = parse_chat_turn(message);
            if turn.is_none() {
                debug!(index, "skipping malformed chat turn");
            }
            turn
        })
        .collect()
}

fn parse_chat_turn(message: &Value) -> Option<ChatTurn> {
    let object = message.as_object()?;
    let role = ChatRole::parse(object.get("role")?.as_str()?)?;
    let content = object.get("content")?.as_str()?;

    let mut turn = ChatTurn::new(role, content);
    if let Some(images) = object.get("images").and_then(Value::as_array) {
        turn.images = images
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    turn.tool_call_id = object
        .get("tool_call_id")
        .or_else(|| object.get("toolCallId"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(turn)
}

pub fn parse_stop_sequences(values: &[Value]) -> Vec<String> {
    values
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

/// Accepts both `{type: "function", function: {..}}` and the flat `{name, ..}` form.
pub fn parse_tools(values: &[Value]) -> Vec<ToolDefinition> {
    values
        .iter()
        .filter_map(|value| {
            let definition = value.get("function").unwrap_or(value);
            serde_json::from_value::<ToolDefinition>(definition.clone()).ok()
        })
        .collect()
}

fn failure(err: &BridgeError) -> Value {
    json!({ "success": false, "error": err.to_string() })
}

/// Dispatches host calls to a [`SessionBridge`].
pub struct CallAdapter {
    bridge: Arc<SessionBridge>,
    config: BridgeConfig,
}

impl CallAdapter {
    pub fn new(bridge: Arc<SessionBridge>, config: BridgeConfig) -> Self {
        Self { bridge, config }
    }

    pub fn bridge(&self) -> &Arc<SessionBridge> {
        &self.bridge
    }

    /// Run `method` and return its result object. Never fails.
    pub async fn call(&self, method: &str, args: &Value) -> Value {
        let call = match BridgeCall::parse(method, args, &self.config) {
            Ok(call) => call,
            Err(err) => {
                warn!(method, error = %err, "rejected call");
                return failure(&err);
            }
        };

        match self.dispatch(call).await {
            Ok(result) => result,
            Err(err) => {
                warn!(method, error = %err, "call failed");
                failure(&err)
            }
        }
    }

    pub async fn dispatch(&self, call: BridgeCall) -> Result<Value, BridgeError> {
        let bridge = &self.bridge;
        match call {
            BridgeCall::Echo { value } => Ok(json!({ "success": true, "value": value })),
            BridgeCall::DownloadModel { slug } => {
                let outcome = bridge.download(&slug).await?;
                Ok(json!({
                    "success": true,
                    "modelPath": outcome.model_path.display().to_string(),
                    "downloadTimeMs": outcome.download_time_ms,
                    "modelExists": outcome.model_exists,
                }))
            }
            BridgeCall::GetAvailableModels => {
                let models = bridge.available_models().await?;
                Ok(json!({ "success": true, "models": models }))
            }
            BridgeCall::InitializeModel {
                slug,
                model_path,
                context_size,
            } => {
                let path = bridge.initialize(&slug, model_path, context_size).await?;
                Ok(json!({ "success": true, "modelPath": path.display().to_string() }))
            }
            BridgeCall::GenerateCompletion { turns, request } => {
                let result = bridge.complete(turns, &request).await?;
                let metrics = &result.metrics;
                let mut body = json!({
                    "success": result.success,
                    "response": result.response,
                    "timeToFirstTokenMs": metrics.time_to_first_token_ms,
                    "totalTimeMs": metrics.total_time_ms,
                    "tokensPerSecond": metrics.tokens_per_second,
                    "prefillTokens": metrics.prefill_tokens,
                    "decodeTokens": metrics.decode_tokens,
                    "totalTokens": metrics.total_tokens,
                });
                if !result.tool_calls.is_empty() {
                    body["toolCalls"] = json!(result.tool_calls);
                }
                Ok(body)
            }
            BridgeCall::GenerateStreamingCompletion { turns, request } => {
                // the host learns the outcome from events, not from this result
                bridge.stream_completion(turns, &request)?;
                Ok(json!({ "success": true }))
            }
            BridgeCall::TranscribeAudio(request) => {
                let result = bridge.transcribe(request).await?;
                Ok(json!({ "success": result.success, "transcription": result.text }))
            }
            BridgeCall::UnloadModel => {
                let message = bridge.unload().await?;
                Ok(json!({ "success": true, "message": message }))
            }
            BridgeCall::GetTextEmbeddings { text } => {
                let result = bridge.embed(&text).await?;
                Ok(json!({ "success": result.success, "embeddings": result.embeddings }))
            }
            BridgeCall::GetImageEmbeddings { image_path } => {
                let result = bridge.image_embeddings(&image_path)?;
                Ok(json!({ "success": result.success, "embeddings": result.embeddings }))
            }
            BridgeCall::GetAudioEmbeddings { audio_path } => {
                let result = bridge.audio_embeddings(&audio_path)?;
                Ok(json!({ "success": result.success, "embeddings": result.embeddings }))
            }
            BridgeCall::PauseDownload { slug } => {
                bridge.pause_download(slug.as_deref())?;
                Ok(json!({ "success": true }))
            }
            BridgeCall::ResumeDownload { slug } => {
                bridge.resume_download(slug.as_deref())?;
                Ok(json!({ "success": true }))
            }
            BridgeCall::CancelDownload { slug } => {
                bridge.cancel_download(slug.as_deref())?;
                Ok(json!({ "success": true }))
            }
            BridgeCall::GetDownloadProgress { slug } => {
                let snapshot = bridge.download_progress(slug.as_deref());
                Ok(json!({
                    "success": true,
                    "progress": snapshot.progress,
                    "totalBytes": snapshot.total_bytes,
                    "downloadedBytes": snapshot.downloaded_bytes,
                    "status": snapshot.status,
                    "message": BridgeError::not_supported("Download progress").to_string(),
                }))
            }
        }
    }
}
