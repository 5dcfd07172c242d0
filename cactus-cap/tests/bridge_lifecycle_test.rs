use std::sync::Arc;

use cactus_cap::{
    BridgeConfig, CactusPlugin, CapabilityCall, InferenceCapability, ScriptedCapability,
    SessionState, SharedCapability,
};
use cactus_events::{ToolCall, MODEL_DOWNLOAD_FINISHED_EVENT, MODEL_DOWNLOAD_PROGRESS_EVENT};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use serial_test::serial;
use tempfile::TempDir;

fn plugin_with(capability: ScriptedCapability) -> (Arc<ScriptedCapability>, CactusPlugin, TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let capability = Arc::new(capability);
    let shared: SharedCapability = capability.clone();
    let plugin =
        CactusPlugin::load(BridgeConfig::with_models_dir(tmp.path().join("models")), shared)
            .unwrap();
    (capability, plugin, tmp)
}

async fn initialized() -> (Arc<ScriptedCapability>, CactusPlugin, TempDir) {
    let (capability, plugin, tmp) = plugin_with(ScriptedCapability::new());
    let result = plugin.call("initializeModel", &json!({})).await;
    assert_eq!(result["success"], json!(true), "initialize failed: {result}");
    (capability, plugin, tmp)
}

fn messages() -> Value {
    json!([
        { "role": "system", "content": "you are terse" },
        { "role": "user", "content": "say hello" },
    ])
}

#[tokio::test]
async fn test_inference_requires_initialized_model() {
    let (capability, plugin, _tmp) = plugin_with(ScriptedCapability::new());

    let calls = [
        ("generateCompletion", json!({ "messages": messages() })),
        ("generateStreamingCompletion", json!({ "messages": messages() })),
        ("transcribeAudio", json!({ "audioPath": "/tmp/clip.wav" })),
        ("getTextEmbeddings", json!({ "text": "hello" })),
    ];

    for (method, args) in calls {
        let result = plugin.call(method, &args).await;
        println!("{method} -> {result}");
        assert_eq!(result["success"], json!(false), "{method} should fail");
        assert_eq!(result["error"], json!("No model initialized"));
    }

    assert_eq!(capability.total_calls(), 0, "no capability work while unloaded");
    assert_eq!(plugin.bridge().state(), SessionState::Unloaded);
}

#[tokio::test]
async fn test_validation_happens_before_session_work() {
    let (capability, plugin, _tmp) = plugin_with(ScriptedCapability::new());

    let result = plugin.call("loadModel", &json!({})).await;
    assert_eq!(
        result,
        json!({ "success": false, "error": "modelSlug is required" })
    );

    let result = plugin.call("loadLocalModel", &json!({ "contextSize": 512 })).await;
    assert_eq!(result["error"], json!("modelPath is required"));

    let result = plugin.call("getTextEmbeddings", &json!({ "text": 42 })).await;
    assert_eq!(result["error"], json!("text is required"));

    assert_eq!(capability.total_calls(), 0);
}

#[tokio::test]
async fn test_unload_twice_is_harmless() {
    let (capability, plugin, _tmp) = initialized().await;

    let first = plugin.call("unloadModel", &json!({})).await;
    assert_eq!(
        first,
        json!({ "success": true, "message": "Model unloaded successfully" })
    );

    let second = plugin.call("unloadModel", &json!({})).await;
    assert_eq!(second, json!({ "success": true, "message": "No model loaded" }));

    assert_eq!(capability.calls(CapabilityCall::Unload), 1);
    assert_eq!(plugin.bridge().state(), SessionState::Unloaded);
    assert!(capability.loaded_model().is_none());
}

#[tokio::test]
async fn test_unload_without_any_model() {
    let (capability, plugin, _tmp) = plugin_with(ScriptedCapability::new());

    let result = plugin.call("unloadModel", &json!({})).await;
    assert_eq!(result["success"], json!(true));
    assert_eq!(capability.total_calls(), 0);
}

#[tokio::test]
async fn test_failed_initialize_can_be_retried() {
    let (capability, plugin, _tmp) = plugin_with(
        ScriptedCapability::new().failing(CapabilityCall::Initialize, "weights are corrupt"),
    );

    let result = plugin
        .call("loadModel", &json!({ "modelSlug": "qwen3-0.6" }))
        .await;
    assert_eq!(
        result,
        json!({ "success": false, "error": "Error initializing model: weights are corrupt" })
    );
    assert_eq!(plugin.bridge().state(), SessionState::Unloaded);

    let result = plugin
        .call("generateCompletion", &json!({ "messages": messages() }))
        .await;
    assert_eq!(result["error"], json!("No model initialized"));

    capability.set_failure(CapabilityCall::Initialize, None);
    let result = plugin
        .call("loadModel", &json!({ "modelSlug": "qwen3-0.6", "contextSize": 1024 }))
        .await;
    assert_eq!(result["success"], json!(true));
    assert_eq!(plugin.bridge().state(), SessionState::Ready);
    assert_eq!(capability.loaded_model().unwrap().context_size, 1024);
}

#[tokio::test]
async fn test_load_local_model_uses_bundled_path() {
    let (capability, plugin, _tmp) = plugin_with(ScriptedCapability::new());

    let result = plugin
        .call(
            "loadLocalModel",
            &json!({ "modelPath": "/app/bundle/qwen", "modelSlug": "bundled-qwen" }),
        )
        .await;

    assert_eq!(
        result,
        json!({ "success": true, "modelPath": "/app/bundle/qwen" })
    );
    let loaded = capability.loaded_model().unwrap();
    assert_eq!(loaded.model_slug, "bundled-qwen");
    assert_eq!(loaded.context_size, 2048);
    assert_eq!(
        loaded.model_path.as_deref(),
        Some(std::path::Path::new("/app/bundle/qwen"))
    );
}

#[tokio::test]
async fn test_completion_result_shape() {
    let mut arguments = Map::new();
    arguments.insert("city".into(), json!("Lisbon"));
    let (_capability, plugin, _tmp) = plugin_with(ScriptedCapability::new().with_tool_calls(vec![
        ToolCall {
            name: "get_weather".into(),
            arguments,
        },
    ]));
    plugin.call("initializeModel", &json!({})).await;

    let result = plugin
        .call("generateCompletion", &json!({ "messages": messages() }))
        .await;
    println!("completion: {result}");

    assert_eq!(result["success"], json!(true));
    assert_eq!(result["response"], json!("Hello, world!"));
    assert_eq!(result["decodeTokens"], json!(4));
    assert_eq!(result["prefillTokens"], json!(5));
    assert_eq!(result["totalTokens"], json!(9));
    for field in ["timeToFirstTokenMs", "totalTimeMs", "tokensPerSecond"] {
        assert!(result[field].is_number(), "missing {field}");
    }
    assert_eq!(
        result["toolCalls"],
        json!([{ "name": "get_weather", "arguments": { "city": "Lisbon" } }])
    );
}

#[tokio::test]
async fn test_malformed_turn_is_dropped() {
    let (capability, plugin, _tmp) = initialized().await;

    let result = plugin
        .call(
            "generateCompletion",
            &json!({
                "messages": [
                    { "role": "system", "content": "first" },
                    { "role": "user", "content": "second" },
                    { "role": "assistant" },
                    { "role": "user", "content": "fourth" },
                    { "role": "assistant", "content": "fifth" },
                ]
            }),
        )
        .await;
    assert_eq!(result["success"], json!(true));

    let turns = capability.last_completion_turns().unwrap();
    let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "fourth", "fifth"]);
}

#[tokio::test]
async fn test_sentinel_parameters_are_omitted() {
    let (capability, plugin, _tmp) = initialized().await;

    plugin
        .call(
            "generateCompletion",
            &json!({
                "messages": messages(),
                "temperature": 0,
                "topP": 0,
                "topK": 0,
                "maxTokens": 0,
                "stopSequences": ["</s>", null],
                "tools": [{ "type": "function", "function": { "name": "lookup" } }],
            }),
        )
        .await;

    let params = capability.last_completion_params().unwrap();
    assert_eq!(params.temperature, None);
    assert_eq!(params.top_p, None);
    assert_eq!(params.top_k, None);
    assert_eq!(params.max_tokens, 512);
    assert_eq!(params.stop_sequences, vec!["</s>".to_string()]);
    assert!(params.tools.is_empty(), "tools are never forwarded");

    let forwarded = serde_json::to_value(&params).unwrap();
    assert!(forwarded.get("temperature").is_none());
    assert!(forwarded.get("top_p").is_none());
    assert!(forwarded.get("top_k").is_none());
}

#[tokio::test]
async fn test_default_parameters_are_forwarded() {
    let (capability, plugin, _tmp) = initialized().await;

    plugin
        .call("generateCompletion", &json!({ "messages": messages() }))
        .await;

    let params = capability.last_completion_params().unwrap();
    assert_eq!(params.max_tokens, 100);
    assert!((params.temperature.unwrap() - 0.7).abs() < 1e-6);
    assert_eq!(params.top_p, None);
    assert_eq!(params.top_k, None);
}

#[tokio::test]
#[serial]
async fn test_download_is_idempotent() {
    let (capability, plugin, tmp) = plugin_with(ScriptedCapability::new());
    let mut progress = cactus_events::subscribe_to_event::<Value>(MODEL_DOWNLOAD_PROGRESS_EVENT);
    let mut finished = cactus_events::subscribe_to_event::<Value>(MODEL_DOWNLOAD_FINISHED_EVENT);

    let first = plugin
        .call("downloadModel", &json!({ "modelSlug": "modelX" }))
        .await;
    println!("first download: {first}");
    assert_eq!(first["success"], json!(true));
    assert_eq!(first["modelExists"], json!(false));
    let expected_path = tmp.path().join("models").join("modelX");
    assert_eq!(first["modelPath"], json!(expected_path.display().to_string()));

    let second = plugin
        .call("downloadModel", &json!({ "modelSlug": "modelX" }))
        .await;
    assert_eq!(second["success"], json!(true));
    assert_eq!(second["modelExists"], json!(true));
    assert_eq!(second["modelPath"], first["modelPath"]);

    assert_eq!(capability.calls(CapabilityCall::Download), 1);

    let event = progress.next().await.unwrap();
    assert_eq!(event.data["modelSlug"], json!("modelX"));
    assert_eq!(event.data["stage"], json!("downloading"));
    let event = finished.next().await.unwrap();
    assert_eq!(
        event.data["modelPath"],
        json!(expected_path.display().to_string())
    );
}

#[tokio::test]
async fn test_download_failure_keeps_message() {
    let (_capability, plugin, _tmp) = plugin_with(
        ScriptedCapability::new().failing(CapabilityCall::Download, "connection reset"),
    );

    let result = plugin.call("downloadModel", &json!({})).await;
    assert_eq!(
        result,
        json!({ "success": false, "error": "Error downloading model: connection reset" })
    );
}

#[tokio::test]
#[serial]
async fn test_available_models_reflect_disk() {
    let (_capability, plugin, _tmp) = plugin_with(ScriptedCapability::new());
    plugin
        .call("downloadModel", &json!({ "modelSlug": "qwen3-0.6" }))
        .await;

    let result = plugin.call("getAvailableModels", &json!({})).await;
    let models = result["models"].as_array().unwrap();
    assert_eq!(models.len(), 2);

    let qwen = models.iter().find(|m| m["slug"] == json!("qwen3-0.6")).unwrap();
    assert_eq!(qwen["isDownloaded"], json!(true));
    assert_eq!(qwen["supportsToolCalling"], json!(true));
    assert!(qwen["sizeMB"].is_number());

    let lfm = models
        .iter()
        .find(|m| m["slug"] == json!("lfm2-vl-450m"))
        .unwrap();
    assert_eq!(lfm["isDownloaded"], json!(false));
    assert_eq!(lfm["supportsVision"], json!(true));
}

#[tokio::test]
async fn test_unsupported_operations_report_not_supported() {
    let (capability, plugin, _tmp) = plugin_with(ScriptedCapability::new());

    for round in 0..2 {
        for method in ["pauseDownload", "resumeDownload", "cancelDownload"] {
            for args in [json!({ "modelSlug": "qwen3-0.6" }), json!({})] {
                let result = plugin.call(method, &args).await;
                assert_eq!(result["success"], json!(false), "{method} round {round}");
                assert!(
                    result["error"].as_str().unwrap().contains("not supported"),
                    "{method}: {result}"
                );
            }
        }
        let media = [
            ("getImageEmbeddings", json!({ "imagePath": "/tmp/cat.png" }), "Image embeddings"),
            ("getAudioEmbeddings", json!({ "audioPath": "/tmp/clip.wav" }), "Audio embeddings"),
        ];
        for (method, args, operation) in media {
            let result = plugin.call(method, &args).await;
            assert_eq!(
                result,
                json!({
                    "success": false,
                    "error": format!("{operation} is not supported in the current Cactus SDK version"),
                }),
                "{method} round {round}"
            );
        }
        if round == 0 {
            plugin.call("initializeModel", &json!({})).await;
        }
    }

    // the media paths are still validated
    let result = plugin.call("getImageEmbeddings", &json!({})).await;
    assert_eq!(result["error"], json!("imagePath is required"));

    let progress = plugin
        .call("getDownloadProgress", &json!({ "modelSlug": "qwen3-0.6" }))
        .await;
    assert_eq!(progress["progress"], json!(0.0));
    assert_eq!(progress["totalBytes"], json!(0));
    assert_eq!(progress["downloadedBytes"], json!(0));
    assert_eq!(progress["status"], json!("unknown"));
    assert!(progress["message"].as_str().unwrap().contains("not supported"));

    assert_eq!(capability.calls(CapabilityCall::Download), 0);
    assert_eq!(capability.calls(CapabilityCall::Embed), 0);
}

#[tokio::test]
async fn test_embeddings_preserve_dimension_order() {
    let (capability, plugin, _tmp) = initialized().await;

    let result = plugin
        .call("getTextEmbeddings", &json!({ "text": "the quick brown fox" }))
        .await;
    assert_eq!(result["success"], json!(true));

    let expected = capability
        .generate_embedding("the quick brown fox")
        .unwrap()
        .embeddings;
    let returned: Vec<f64> = result["embeddings"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_f64().unwrap())
        .collect();
    assert_eq!(returned, expected);
}

#[tokio::test]
async fn test_transcription_uses_language_prompt() {
    let (capability, plugin, _tmp) = plugin_with(ScriptedCapability::new().with_transcript("bonjour"));
    plugin.call("initializeModel", &json!({})).await;

    let result = plugin
        .call(
            "transcribeAudio",
            &json!({ "audioPath": "/tmp/clip.wav", "language": "fr" }),
        )
        .await;
    assert_eq!(result, json!({ "success": true, "transcription": "bonjour" }));
    assert_eq!(
        capability.last_transcription_prompt().as_deref(),
        Some("<|startoftranscript|><|fr|><|transcribe|><|notimestamps|>")
    );

    plugin
        .call("transcribeAudio", &json!({ "audioPath": "/tmp/clip.wav" }))
        .await;
    assert_eq!(
        capability.last_transcription_prompt().as_deref(),
        Some("<|startoftranscript|><|en|><|transcribe|><|notimestamps|>")
    );
}

#[tokio::test]
async fn test_echo_and_unknown_methods() {
    let (_capability, plugin, _tmp) = plugin_with(ScriptedCapability::new());

    assert_eq!(
        plugin.call("echo", &json!({ "value": "ping" })).await,
        json!({ "success": true, "value": "ping" })
    );
    assert_eq!(
        plugin.call("echo", &json!({})).await,
        json!({ "success": true, "value": null })
    );

    let result = plugin.call("summonModel", &json!({})).await;
    assert_eq!(result["success"], json!(false));
    assert_eq!(result["error"], json!("Unknown method: summonModel"));
}

#[tokio::test]
#[serial]
async fn test_slugs_cannot_escape_models_dir() {
    let (capability, plugin, tmp) = plugin_with(ScriptedCapability::new());

    for slug in ["../escaped", "..", "", "nested/model"] {
        for method in ["downloadModel", "loadModel"] {
            let result = plugin.call(method, &json!({ "modelSlug": slug })).await;
            println!("{method} {slug:?} -> {result}");
            assert_eq!(result["success"], json!(false), "{method} accepted {slug:?}");
            assert!(result.get("modelExists").is_none());
            assert!(result["error"]
                .as_str()
                .unwrap()
                .starts_with("Invalid modelSlug"));
        }
    }

    assert_eq!(capability.total_calls(), 0);
    assert!(!tmp.path().join("escaped").exists());
    assert_eq!(plugin.bridge().state(), SessionState::Unloaded);
}
