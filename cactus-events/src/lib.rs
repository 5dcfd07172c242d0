mod events_manager;

pub use events_manager::*;

mod custom_events;

pub use custom_events::download::{
    emit_download_finished, emit_download_progress, DownloadFinishedEvent, DownloadProgressEvent,
    DownloadStage, MODEL_DOWNLOAD_FINISHED_EVENT, MODEL_DOWNLOAD_PROGRESS_EVENT,
};
pub use custom_events::streaming::{
    emit_stream_event, GenerationMetrics, StreamEvent, ToolCall, STREAMING_RESPONSE_EVENT,
};
