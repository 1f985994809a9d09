//! Session configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a flush submits its planned operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommitMode {
    /// One atomic changeset; all or nothing.
    #[default]
    Batched,
    /// One request per operation; earlier operations stay committed if a
    /// later one fails.
    Sequential,
}

impl CommitMode {
    /// Returns the mode name.
    pub fn as_str(self) -> &'static str {
        match self {
            CommitMode::Batched => "batched",
            CommitMode::Sequential => "sequential",
        }
    }
}

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Root address of the service. Entity addresses are relative to it.
    pub service_root: String,
    /// Default commit strategy.
    pub commit_mode: CommitMode,
    /// Whether to send concurrency tokens as preconditions.
    pub use_etags: bool,
    /// Upper bound on operations in one atomic changeset.
    pub max_batch_operations: Option<usize>,
    /// Request timeout handed to HTTP clients.
    pub timeout: Duration,
}

impl SessionConfig {
    /// Creates a configuration for the given service root.
    pub fn new(service_root: impl Into<String>) -> Self {
        Self {
            service_root: service_root.into(),
            commit_mode: CommitMode::Batched,
            use_etags: true,
            max_batch_operations: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the default commit strategy.
    pub fn with_commit_mode(mut self, mode: CommitMode) -> Self {
        self.commit_mode = mode;
        self
    }

    /// Enables or disables concurrency preconditions.
    pub fn with_etags(mut self, enabled: bool) -> Self {
        self.use_etags = enabled;
        self
    }

    /// Caps the size of an atomic changeset.
    pub fn with_max_batch_operations(mut self, limit: usize) -> Self {
        self.max_batch_operations = Some(limit);
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.commit_mode, CommitMode::Batched);
        assert!(config.use_etags);
        assert!(config.max_batch_operations.is_none());
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn builder() {
        let config = SessionConfig::new("https://svc.example.com/odata")
            .with_commit_mode(CommitMode::Sequential)
            .with_etags(false)
            .with_max_batch_operations(50)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.service_root, "https://svc.example.com/odata");
        assert_eq!(config.commit_mode.as_str(), "sequential");
        assert!(!config.use_etags);
        assert_eq!(config.max_batch_operations, Some(50));
    }

    #[test]
    fn deserializes_from_json() {
        let config: SessionConfig = serde_json::from_value(serde_json::json!({
            "service_root": "svc",
            "commit_mode": "Sequential",
            "use_etags": true,
            "max_batch_operations": null,
            "timeout": {"secs": 10, "nanos": 0}
        }))
        .unwrap();
        assert_eq!(config.commit_mode, CommitMode::Sequential);
        assert_eq!(config.timeout, Duration::from_secs(10));
    }
}
