//! The boundary to the on-device inference runtime.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::types::{
    ChatTurn, CompletionParams, CompletionResult, DownloadProgress, EmbeddingResult, InitParams,
    ModelInfo, TranscriptionParams, TranscriptionResult,
};

/// An opaque provider of download, inference, transcription and embeddings.
///
/// Every method may block for a long time (network, disk, decoding). The
/// session bridge only ever calls them from `tokio::task::spawn_blocking`.
/// Implementations hold their loaded-model state behind interior mutability.
pub trait InferenceCapability: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Fetch the assets for `slug` into `target_dir`.
    fn download_model(
        &self,
        slug: &str,
        target_dir: &Path,
        on_progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<()>;

    fn list_models(&self) -> Result<Vec<ModelInfo>>;

    fn initialize(&self, params: &InitParams) -> Result<()>;

    /// Run generation to completion. When `on_token` is given it is invoked
    /// with each decoded fragment, in order, before this returns.
    fn generate_completion(
        &self,
        turns: &[ChatTurn],
        params: &CompletionParams,
        on_token: Option<&mut dyn FnMut(&str)>,
    ) -> Result<CompletionResult>;

    fn transcribe(
        &self,
        audio_path: &Path,
        prompt: &str,
        params: &TranscriptionParams,
    ) -> Result<TranscriptionResult>;

    fn generate_embedding(&self, text: &str) -> Result<EmbeddingResult>;

    fn unload(&self) -> Result<()>;
}

pub type SharedCapability = Arc<dyn InferenceCapability>;
