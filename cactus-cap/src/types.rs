//! Data model shared by the call adapter, the session bridge and capabilities.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{
    DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P,
    DEFAULT_TRANSCRIBE_MAX_TOKENS, DEFAULT_TRANSCRIBE_TEMPERATURE, FALLBACK_MAX_TOKENS,
};

pub use cactus_events::{DownloadStage, GenerationMetrics, ToolCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatRole {
    /// Parse a host role string. `function` is the legacy name for `tool`.
    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "system" => Some(ChatRole::System),
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            "tool" | "function" => Some(ChatRole::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatTurn {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }
}

/// A function the host offered to the model. Parsed, but never forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Generation arguments exactly as the host sent them, sentinels included.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub temperature: f32,
    pub max_tokens: i64,
    pub top_p: f32,
    pub top_k: i64,
    pub stop_sequences: Vec<String>,
    pub tools: Vec<ToolDefinition>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: DEFAULT_TOP_P,
            top_k: DEFAULT_TOP_K,
            stop_sequences: Vec::new(),
            tools: Vec::new(),
        }
    }
}

impl CompletionRequest {
    /// Resolve sentinels into the parameters handed to the capability.
    ///
    /// Non-positive temperature, top-p and top-k mean "unset" and are omitted.
    /// A non-positive token budget falls back to [`FALLBACK_MAX_TOKENS`].
    /// Tool definitions are dropped: the runtime is never sent tools.
    pub fn to_params(&self) -> CompletionParams {
        CompletionParams {
            temperature: (self.temperature > 0.0).then_some(self.temperature as f64),
            top_p: (self.top_p > 0.0).then_some(self.top_p as f64),
            top_k: (self.top_k > 0).then(|| self.top_k.min(u32::MAX as i64) as u32),
            max_tokens: if self.max_tokens > 0 {
                self.max_tokens.min(u32::MAX as i64) as u32
            } else {
                FALLBACK_MAX_TOKENS
            },
            stop_sequences: self.stop_sequences.clone(),
            tools: Vec::new(),
        }
    }
}

/// Parameters as forwarded to the capability. `None` leaves the choice to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub success: bool,
    pub response: String,
    pub metrics: GenerationMetrics,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionRequest {
    pub audio_path: PathBuf,
    pub prompt: Option<String>,
    pub language: Option<String>,
    pub temperature: f32,
    pub max_tokens: i64,
}

impl TranscriptionRequest {
    pub fn new(audio_path: impl Into<PathBuf>) -> Self {
        Self {
            audio_path: audio_path.into(),
            prompt: None,
            language: None,
            temperature: DEFAULT_TRANSCRIBE_TEMPERATURE,
            max_tokens: DEFAULT_TRANSCRIBE_MAX_TOKENS,
        }
    }

    /// The decoder prompt: the caller's, or the whisper template for `language` (default `en`).
    pub fn resolved_prompt(&self) -> String {
        match &self.prompt {
            Some(prompt) => prompt.clone(),
            None => {
                let language = self
                    .language
                    .as_deref()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .unwrap_or("en");
                format!("<|startoftranscript|><|{language}|><|transcribe|><|notimestamps|>")
            }
        }
    }

    pub fn to_params(&self) -> TranscriptionParams {
        TranscriptionParams {
            temperature: (self.temperature > 0.0).then_some(self.temperature as f64),
            max_tokens: (self.max_tokens > 0).then(|| self.max_tokens.min(u32::MAX as i64) as u32),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptionResult {
    pub success: bool,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingResult {
    pub success: bool,
    /// In the capability's dimension order.
    pub embeddings: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub slug: String,
    pub name: String,
    #[serde(rename = "sizeMB")]
    pub size_mb: u32,
    pub supports_tool_calling: bool,
    pub supports_vision: bool,
    pub quantization: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitParams {
    pub model_slug: String,
    /// Explicit bundled-asset location. `None` lets the capability resolve the slug.
    pub model_path: Option<PathBuf>,
    pub context_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub stage: DownloadStage,
    pub fraction: f64,
}
