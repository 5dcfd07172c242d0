use std::sync::Arc;

use anyhow::{Context, Result};
use cactus_events::{
    subscribe_to_all_events, subscribe_to_event, EventSubscription, StreamEvent,
    STREAMING_RESPONSE_EVENT,
};
use serde_json::Value;
use tracing::info;

use crate::adapter::CallAdapter;
use crate::capability::SharedCapability;
use crate::config::BridgeConfig;
use crate::models_dir::ModelsDirectory;
use crate::scripted::ScriptedCapability;
use crate::session::SessionBridge;

/// Which capability implementation backs the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Deterministic in-process runtime, no model files needed.
    Scripted,
    /// libcactus, requires the `native` feature.
    Native,
}

impl Backend {
    pub fn build(self, config: &BridgeConfig) -> Result<SharedCapability> {
        match self {
            Backend::Scripted => Ok(Arc::new(ScriptedCapability::new())),
            #[cfg(feature = "native")]
            Backend::Native => Ok(Arc::new(crate::native::NativeCapability::new(config))),
            #[cfg(not(feature = "native"))]
            Backend::Native => {
                let _ = config;
                anyhow::bail!("cactus-cap was built without the `native` feature")
            }
        }
    }
}

/// The loaded plugin: one session bridge and the adapter in front of it.
pub struct CactusPlugin {
    adapter: CallAdapter,
}

impl CactusPlugin {
    /// Prepare the models directory and wire the bridge to `capability`.
    pub fn load(config: BridgeConfig, capability: SharedCapability) -> Result<Self> {
        let models = ModelsDirectory::new(config.models_dir.clone());
        models.ensure().context("failed to prepare models directory")?;

        info!(
            capability = capability.name(),
            models_dir = %models.root().display(),
            "cactus plugin loaded"
        );

        let bridge = Arc::new(SessionBridge::new(capability, models));
        Ok(Self {
            adapter: CallAdapter::new(bridge, config),
        })
    }

    pub async fn call(&self, method: &str, args: &Value) -> Value {
        self.adapter.call(method, args).await
    }

    pub fn bridge(&self) -> &Arc<SessionBridge> {
        self.adapter.bridge()
    }

    /// Every event the plugin publishes, undecoded. Subscribe before the first call.
    pub fn listen_all(&self) -> EventSubscription<Value> {
        subscribe_to_all_events()
    }

    pub fn listen_streaming(&self) -> EventSubscription<StreamEvent> {
        subscribe_to_event(STREAMING_RESPONSE_EVENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn load_creates_models_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BridgeConfig::with_models_dir(tmp.path().join("nested").join("models"));
        let capability = Backend::Scripted.build(&config).unwrap();

        let plugin = CactusPlugin::load(config, capability).unwrap();

        assert!(plugin.bridge().models().root().is_dir());
        assert_eq!(
            plugin.call("echo", &json!({ "value": "ping" })).await,
            json!({ "success": true, "value": "ping" })
        );
    }

    #[cfg(not(feature = "native"))]
    #[test]
    fn native_backend_needs_feature() {
        let err = Backend::Native
            .build(&BridgeConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("native"));
    }
}
