//! A deterministic, in-process [`InferenceCapability`].
//!
//! Replays a fixed token script instead of running a model, records how it was
//! called, and can be told to fail any operation. Tests use it to observe what
//! the bridge forwards; the host harness uses it as a backend that works
//! without libcactus.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::capability::InferenceCapability;
use crate::config::{builtin_catalog, ModelDescriptor};
use crate::types::{
    ChatTurn, CompletionParams, CompletionResult, DownloadProgress, DownloadStage,
    EmbeddingResult, GenerationMetrics, InitParams, ModelInfo, ToolCall, TranscriptionParams,
    TranscriptionResult,
};

const EMBEDDING_DIMENSIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityCall {
    Download,
    ListModels,
    Initialize,
    Completion,
    Transcribe,
    Embed,
    Unload,
}

pub struct ScriptedCapability {
    tokens: Vec<String>,
    tool_calls: Vec<ToolCall>,
    transcript: String,
    catalog: Vec<ModelDescriptor>,
    token_delay: Option<Duration>,
    failures: Mutex<HashMap<CapabilityCall, String>>,
    calls: Mutex<HashMap<CapabilityCall, usize>>,
    last_completion: Mutex<Option<(Vec<ChatTurn>, CompletionParams)>>,
    last_transcription_prompt: Mutex<Option<String>>,
    loaded: Mutex<Option<InitParams>>,
}

impl Default for ScriptedCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self {
            tokens: ["Hello", ",", " world", "!"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            tool_calls: Vec::new(),
            transcript: "scripted transcript".to_string(),
            catalog: builtin_catalog(),
            token_delay: None,
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            last_completion: Mutex::new(None),
            last_transcription_prompt: Mutex::new(None),
            loaded: Mutex::new(None),
        }
    }

    pub fn with_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = transcript.into();
        self
    }

    /// Sleep between tokens, to make streaming observable in real time.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Make `call` fail with `message`. A failing completion still emits its
    /// first token, so streams see a mid-generation failure.
    pub fn failing(self, call: CapabilityCall, message: impl Into<String>) -> Self {
        self.set_failure(call, Some(message.into()));
        self
    }

    pub fn set_failure(&self, call: CapabilityCall, message: Option<String>) {
        let mut failures = self.failures.lock();
        match message {
            Some(message) => {
                failures.insert(call, message);
            }
            None => {
                failures.remove(&call);
            }
        }
    }

    pub fn calls(&self, call: CapabilityCall) -> usize {
        self.calls.lock().get(&call).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn last_completion_params(&self) -> Option<CompletionParams> {
        self.last_completion
            .lock()
            .as_ref()
            .map(|(_, params)| params.clone())
    }

    pub fn last_completion_turns(&self) -> Option<Vec<ChatTurn>> {
        self.last_completion
            .lock()
            .as_ref()
            .map(|(turns, _)| turns.clone())
    }

    pub fn last_transcription_prompt(&self) -> Option<String> {
        self.last_transcription_prompt.lock().clone()
    }

    pub fn loaded_model(&self) -> Option<InitParams> {
        self.loaded.lock().clone()
    }

    fn record(&self, call: CapabilityCall) -> Result<()> {
        *self.calls.lock().entry(call).or_insert(0) += 1;
        match self.failures.lock().get(&call) {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded.lock().is_none() {
            return Err(anyhow!("no model loaded in scripted runtime"));
        }
        Ok(())
    }
}

impl InferenceCapability for ScriptedCapability {
    fn name(&self) -> &str {
        "scripted"
    }

    fn download_model(
        &self,
        slug: &str,
        target_dir: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<()> {
        self.record(CapabilityCall::Download)?;

        fs::create_dir_all(target_dir)
            .with_context(|| format!("failed to create {}", target_dir.display()))?;
        on_progress(DownloadProgress {
            stage: DownloadStage::Downloading,
            fraction: 0.5,
        });
        fs::write(target_dir.join("model.weights"), slug.as_bytes())?;
        on_progress(DownloadProgress {
            stage: DownloadStage::Downloading,
            fraction: 1.0,
        });
        Ok(())
    }

    fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.record(CapabilityCall::ListModels)?;
        Ok(self.catalog.iter().map(ModelDescriptor::info).collect())
    }

    fn initialize(&self, params: &InitParams) -> Result<()> {
        self.record(CapabilityCall::Initialize)?;
        debug!(slug = %params.model_slug, "scripted model loaded");
        *self.loaded.lock() = Some(params.clone());
        Ok(())
    }

    fn generate_completion(
        &self,
        turns: &[ChatTurn],
        params: &CompletionParams,
        mut on_token: Option<&mut dyn FnMut(&str)>,
    ) -> Result<CompletionResult> {
        *self.last_completion.lock() = Some((turns.to_vec(), params.clone()));
        let mut failure = self.record(CapabilityCall::Completion).err();
        self.ensure_loaded()?;

        let mut response = String::new();
        let mut decoded = 0u64;
        for token in self.tokens.iter().take(params.max_tokens as usize) {
            if params.stop_sequences.iter().any(|stop| token.contains(stop.as_str())) {
                break;
            }
            if let Some(delay) = self.token_delay {
                thread::sleep(delay);
            }
            if let Some(callback) = on_token.as_deref_mut() {
                callback(token);
            }
            response.push_str(token);
            decoded += 1;

            if let Some(err) = failure.take() {
                return Err(err);
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let prefill = turns
            .iter()
            .map(|turn| turn.content.split_whitespace().count() as u64)
            .sum::<u64>();
        let total_time_ms = 1.0 + decoded as f64;

        Ok(CompletionResult {
            success: true,
            response,
            metrics: GenerationMetrics {
                time_to_first_token_ms: 1.0,
                total_time_ms,
                tokens_per_second: decoded as f64 * 1000.0 / total_time_ms,
                prefill_tokens: prefill,
                decode_tokens: decoded,
                total_tokens: prefill + decoded,
            },
            tool_calls: self.tool_calls.clone(),
        })
    }

    fn transcribe(
        &self,
        audio_path: &Path,
        prompt: &str,
        _params: &TranscriptionParams,
    ) -> Result<TranscriptionResult> {
        *self.last_transcription_prompt.lock() = Some(prompt.to_string());
        self.record(CapabilityCall::Transcribe)?;
        self.ensure_loaded()?;

        debug!(path = %audio_path.display(), "scripted transcription");
        Ok(TranscriptionResult {
            success: true,
            text: self.transcript.clone(),
        })
    }

    fn generate_embedding(&self, text: &str) -> Result<EmbeddingResult> {
        self.record(CapabilityCall::Embed)?;
        self.ensure_loaded()?;

        // byte-bucket histogram, L2 normalised
        let mut vector = vec![0f64; EMBEDDING_DIMENSIONS];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % EMBEDDING_DIMENSIONS] += byte as f64;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }

        Ok(EmbeddingResult {
            success: true,
            embeddings: vector,
        })
    }

    fn unload(&self) -> Result<()> {
        self.record(CapabilityCall::Unload)?;
        *self.loaded.lock() = None;
        Ok(())
    }
}
