use thiserror::Error;

/// Every way a bridge operation can fail. The call adapter turns these into
/// `{ success: false, error }` result objects.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A required argument was missing or unusable. Raised before any session work.
    #[error("{0}")]
    Validation(String),

    #[error("No model initialized")]
    NoModelInitialized,

    #[error("A model is already loading")]
    AlreadyLoading,

    /// The capability itself failed; its message is preserved.
    #[error("Error {action}: {source:#}")]
    Capability {
        action: &'static str,
        source: anyhow::Error,
    },

    #[error("{operation} is not supported in the current Cactus SDK version")]
    NotSupported { operation: &'static str },

    #[error("Error {action}: background task failed: {source}")]
    Runtime {
        action: &'static str,
        source: tokio::task::JoinError,
    },
}

impl BridgeError {
    pub fn missing(argument: &str) -> Self {
        BridgeError::Validation(format!("{argument} is required"))
    }

    pub fn capability(action: &'static str, source: anyhow::Error) -> Self {
        BridgeError::Capability { action, source }
    }

    pub fn not_supported(operation: &'static str) -> Self {
        BridgeError::NotSupported { operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn messages_match_host_expectations() {
        assert_eq!(
            BridgeError::missing("modelSlug").to_string(),
            "modelSlug is required"
        );
        assert_eq!(
            BridgeError::NoModelInitialized.to_string(),
            "No model initialized"
        );
        assert_eq!(
            BridgeError::not_supported("Pause download").to_string(),
            "Pause download is not supported in the current Cactus SDK version"
        );
    }

    #[test]
    fn capability_errors_keep_the_underlying_message() {
        let err = BridgeError::capability(
            "generating completion",
            anyhow!("kv cache exhausted").context("decode failed"),
        );
        assert_eq!(
            err.to_string(),
            "Error generating completion: decode failed: kv cache exhausted"
        );
    }
}
