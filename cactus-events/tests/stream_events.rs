use cactus_events::{
    emit_download_progress, emit_stream_event, subscribe_to_event, DownloadProgressEvent,
    DownloadStage, GenerationMetrics, StreamEvent, ToolCall, MODEL_DOWNLOAD_PROGRESS_EVENT,
    STREAMING_RESPONSE_EVENT,
};
use futures::StreamExt;
use serde_json::json;
use serial_test::serial;
use tokio::time::{timeout, Duration};

#[test]
fn stream_events_use_host_wire_shape() {
    assert_eq!(
        serde_json::to_value(StreamEvent::Start).unwrap(),
        json!({ "type": "start" })
    );
    assert_eq!(
        serde_json::to_value(StreamEvent::Token {
            token: "hi".into()
        })
        .unwrap(),
        json!({ "type": "token", "token": "hi" })
    );

    let done = StreamEvent::Done {
        success: true,
        response: "hi there".into(),
        model_slug: Some("qwen3-0.6".into()),
        generation_metrics: GenerationMetrics {
            time_to_first_token_ms: 12.0,
            total_time_ms: 40.0,
            tokens_per_second: 50.0,
            prefill_tokens: 4,
            decode_tokens: 2,
            total_tokens: 6,
        },
        tool_calls: vec![],
    };
    let value = serde_json::to_value(&done).unwrap();
    assert_eq!(value["type"], "done");
    assert_eq!(value["modelSlug"], "qwen3-0.6");
    assert_eq!(value["generationMetrics"]["totalTokens"], 6);
    assert_eq!(value["generationMetrics"]["timeToFirstTokenMs"], 12.0);
    assert!(value.get("toolCalls").is_none());
    assert!(done.is_terminal());
}

#[test]
fn done_event_carries_tool_calls_when_present() {
    let mut arguments = serde_json::Map::new();
    arguments.insert("city".into(), json!("Lisbon"));
    let done = StreamEvent::Done {
        success: true,
        response: String::new(),
        model_slug: None,
        generation_metrics: GenerationMetrics::default(),
        tool_calls: vec![ToolCall {
            name: "get_weather".into(),
            arguments,
        }],
    };

    let value = serde_json::to_value(&done).unwrap();
    assert_eq!(value["toolCalls"][0]["name"], "get_weather");
    assert_eq!(value["toolCalls"][0]["arguments"]["city"], "Lisbon");

    let back: StreamEvent = serde_json::from_value(value).unwrap();
    assert_eq!(back, done);
}

#[tokio::test]
#[serial]
async fn stream_events_reach_subscribers() {
    let mut events = subscribe_to_event::<StreamEvent>(STREAMING_RESPONSE_EVENT);

    emit_stream_event(StreamEvent::Start);
    emit_stream_event(StreamEvent::Error {
        error: "boom".into(),
    });

    let first = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.data, StreamEvent::Start);
    assert!(!first.data.is_terminal());
    assert!(second.data.is_terminal());
}

#[tokio::test]
#[serial]
async fn download_progress_is_published_on_its_own_channel() {
    let mut progress = subscribe_to_event::<DownloadProgressEvent>(MODEL_DOWNLOAD_PROGRESS_EVENT);

    emit_download_progress(DownloadProgressEvent {
        model_slug: "qwen3-0.6".into(),
        stage: DownloadStage::Downloading,
        progress: 0.5,
    });

    let event = timeout(Duration::from_secs(1), progress.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.data.model_slug, "qwen3-0.6");
    assert_eq!(event.data.progress, 0.5);
}
