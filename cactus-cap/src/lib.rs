//! # cactus-cap
//!
//! Bridges an application shell to the Cactus on-device language model runtime:
//! model download, initialization, chat completion (blocking and streamed as
//! events), audio transcription and text embeddings.
//!
//! The shell talks to [`CactusPlugin::call`] with a method name and JSON
//! arguments and always gets a JSON object with `success` back. Streaming
//! output and download progress arrive on the process-wide event bus from
//! `cactus-events`.
//!
//! # Example
//! ```no_run
//! # use cactus_cap::{Backend, BridgeConfig, CactusPlugin};
//! # use futures::StreamExt;
//! # use serde_json::json;
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = BridgeConfig::default();
//! let capability = Backend::Scripted.build(&config)?;
//! let plugin = CactusPlugin::load(config, capability)?;
//! let mut events = plugin.listen_streaming();
//!
//! plugin.call("initializeModel", &json!({})).await;
//! plugin
//!     .call(
//!         "generateStreamingCompletion",
//!         &json!({ "messages": [{ "role": "user", "content": "hi" }] }),
//!     )
//!     .await;
//!
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event.data);
//!     if event.data.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod capability;
pub mod config;
pub mod error;
pub mod fetch;
pub mod models_dir;
#[cfg(feature = "native")]
pub mod native;
pub mod plugin;
pub mod scripted;
pub mod session;
pub mod types;

pub use adapter::{BridgeCall, CallAdapter};
pub use capability::{InferenceCapability, SharedCapability};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use models_dir::ModelsDirectory;
pub use plugin::{Backend, CactusPlugin};
pub use scripted::{CapabilityCall, ScriptedCapability};
pub use session::{SessionBridge, SessionState};
