//! Error types for edgeacl.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AclError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Firewall error: {0}")]
    Firewall(String),

    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("{program} timed out after {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("Backend not ready: {0}")]
    NotReady(String),
}

impl AclError {
    /// Whether this error (anywhere in an anyhow chain) means an executable is missing.
    pub fn is_tool_not_found(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<AclError>(),
                Some(AclError::ToolNotFound(_))
            )
        })
    }
}

/// Error returned while constructing an enforcement backend.
///
/// `Fatal` keeps the backend from ever being registered. Anything else is
/// logged and the backend is registered anyway, on the expectation that it
/// recovers on its own (a tool installed later, a daemon started later).
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("fatal action error: {0}")]
    Fatal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ActionError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        ActionError::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ActionError::Fatal(_))
    }
}
