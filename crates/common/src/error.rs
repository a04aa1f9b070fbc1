use thiserror::Error;

/// Errors that abort a whole pool run
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Directory listing failed: {0}")]
    Directory(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Control link error: {0}")]
    Control(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Run cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }

    pub fn subscription(msg: impl Into<String>) -> Self {
        Self::Subscription(msg.into())
    }

    pub fn control(msg: impl Into<String>) -> Self {
        Self::Control(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
