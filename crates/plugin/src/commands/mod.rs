//! CNI verb implementations

pub mod add;
pub mod check;
pub mod del;

use crate::client::ClientError;
use cni_lib::networking::BindError;
use cni_lib::ErrorResult;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("failed to configure interface: {0}")]
    Bind(#[from] BindError),

    #[error("invalid network configuration: {0}")]
    InvalidConfig(#[from] serde_json::Error),

    #[error("daemon result has no {0}")]
    IncompleteResult(&'static str),
}

impl PluginError {
    /// CNI error document for this failure
    ///
    /// Errors reported by the daemon are passed through unchanged.
    pub fn to_error_result(&self, command: &str) -> ErrorResult {
        match self {
            PluginError::Client(ClientError::Daemon(result)) => result.clone(),
            other => ErrorResult::internal(format!("error during {}", command), other.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct NetConfVersion {
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
}

/// `cniVersion` of the network configuration on stdin
pub fn requested_version(stdin: &[u8]) -> Result<String, serde_json::Error> {
    serde_json::from_slice::<NetConfVersion>(stdin).map(|conf| conf.cni_version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_requested_version() {
        let version = requested_version(br#"{"cniVersion":"1.0.0","network":"netA"}"#).unwrap();
        assert_eq!(version, "1.0.0");

        assert_eq!(requested_version(b"{}").unwrap(), "");
        assert!(requested_version(b"not json").is_err());
    }

    #[test]
    fn test_daemon_error_passes_through() {
        let daemon = ErrorResult::internal("error during ADD", "quota exceeded");
        let err = PluginError::Client(ClientError::Daemon(daemon.clone()));

        assert_eq!(err.to_error_result("ADD"), daemon);
    }

    #[test]
    fn test_local_error_is_wrapped() {
        let err = PluginError::Client(ClientError::Status {
            status: StatusCode::BAD_REQUEST,
            body: "missing required field: netns".to_string(),
        });

        let result = err.to_error_result("CHECK");

        assert_eq!(result.code, 999);
        assert_eq!(result.msg, "error during CHECK");
        assert!(result.details.contains("missing required field: netns"));
    }
}
