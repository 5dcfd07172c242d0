use crate::send_event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Channel name every streaming completion publishes on.
pub const STREAMING_RESPONSE_EVENT: &str = "cactusStreamingResponse";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMetrics {
    pub time_to_first_token_ms: f64,
    pub total_time_ms: f64,
    pub tokens_per_second: f64,
    pub prefill_tokens: u64,
    pub decode_tokens: u64,
    pub total_tokens: u64,
}

/// A function call parsed out of model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// One unit of a streaming completion.
///
/// A request produces exactly one `Start`, any number of `Token`s, then exactly
/// one of `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start,
    Token {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    Done {
        success: bool,
        response: String,
        model_slug: Option<String>,
        generation_metrics: GenerationMetrics,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

pub fn emit_stream_event(event: StreamEvent) {
    if let Err(err) = send_event(STREAMING_RESPONSE_EVENT, event) {
        debug!(error = %err, "failed to emit streaming event");
    }
}
