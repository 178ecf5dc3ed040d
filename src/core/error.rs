use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid metric: {0}")]
    InvalidMetric(String),

    #[error("Metric not found: {0}")]
    NotFound(String),

    #[error("Host statistics unavailable: {0}")]
    HostStats(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Batch rejected by collector with status {status}")]
    Rejected { status: u16 },

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for monitor operations
pub type Result<T> = std::result::Result<T, MonitorError>;

impl MonitorError {
    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new invalid metric error
    pub fn invalid_metric<S: Into<String>>(msg: S) -> Self {
        Self::InvalidMetric(msg.into())
    }

    /// Creates a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates a new host statistics error
    pub fn host_stats<S: Into<String>>(msg: S) -> Self {
        Self::HostStats(msg.into())
    }

    /// Returns true if the error reports an observed cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Storage(_) | Self::Database(_) => "storage",
            Self::Config(_) => "config",
            Self::InvalidMetric(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::HostStats(_) => "host",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Network(_) => "network",
            Self::Rejected { .. } => "rejected",
            Self::Join(_) => "async",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MonitorError::storage("disk gone");
        assert_eq!(err.to_string(), "Storage error: disk gone");
        assert_eq!(err.category(), "storage");
    }

    #[test]
    fn test_rejected_error() {
        let err = MonitorError::Rejected { status: 400 };
        assert_eq!(err.to_string(), "Batch rejected by collector with status 400");
        assert_eq!(err.category(), "rejected");
    }

    #[test]
    fn test_cancelled() {
        assert!(MonitorError::Cancelled.is_cancelled());
        assert!(!MonitorError::config("bad").is_cancelled());
    }
}
