use crate::send_event;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MODEL_DOWNLOAD_PROGRESS_EVENT: &str = "modelDownloadProgress";
pub const MODEL_DOWNLOAD_FINISHED_EVENT: &str = "modelDownloadFinished";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStage {
    Downloading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressEvent {
    pub model_slug: String,
    pub stage: DownloadStage,
    /// Fraction in `0.0..=1.0`.
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFinishedEvent {
    pub model_slug: String,
    pub model_path: String,
}

pub fn emit_download_progress(event: DownloadProgressEvent) {
    if let Err(err) = send_event(MODEL_DOWNLOAD_PROGRESS_EVENT, event) {
        debug!(error = %err, "failed to emit download progress event");
    }
}

pub fn emit_download_finished(event: DownloadFinishedEvent) {
    if let Err(err) = send_event(MODEL_DOWNLOAD_FINISHED_EVENT, event) {
        debug!(error = %err, "failed to emit download finished event");
    }
}
