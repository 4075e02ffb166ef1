//! Error types for shardflow
//!
//! Error taxonomy covering configuration, source, processing, sink,
//! coordination and channel failures.

use thiserror::Error;

/// Boxed error returned by user transforms
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Primary error type for all shardflow operations
#[derive(Debug, Error)]
pub enum ShardflowError {
    // ========== Configuration Errors ==========

    /// Run configuration is inconsistent
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Processing mode name not recognized
    #[error("Unsupported mode: {mode}")]
    UnsupportedMode { mode: String },

    // ========== Source Errors ==========

    /// Source could not be opened
    #[error("Failed to open source {path}: {reason}")]
    SourceOpen { path: String, reason: String },

    /// Tag not present on a source
    #[error("Tag {tag} not found in {path}")]
    TagNotFound { path: String, tag: String },

    /// Key could not be resolved on a source
    #[error("Key {key} not found under tag {tag}")]
    KeyNotFound { tag: String, key: String },

    /// Stored array does not match its recorded checksum
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch { path: String, expected: u32, actual: u32 },

    // ========== Processing Errors ==========

    /// User transform failed for a key
    #[error("Transform failed for key {key}: {source}")]
    Transform {
        key: String,
        #[source]
        source: BoxError,
    },

    // ========== Sink Errors ==========

    /// Sink operation failed
    #[error("Sink operation failed on {path}: {reason}")]
    Sink { path: String, reason: String },

    /// Flush failed while holding the write token
    #[error("Flush failed on worker {rank}: {source}")]
    Flush {
        rank: u32,
        #[source]
        source: Box<ShardflowError>,
    },

    // ========== Coordination Errors ==========

    /// Manager identity could not be read from the lock marker
    #[error("Cannot determine write manager from {path} after {attempts} attempts: {reason}")]
    Election {
        path: String,
        attempts: u32,
        reason: String,
    },

    /// Protocol message out of place
    #[error("Protocol violation on worker {rank}: {reason}")]
    Protocol { rank: u32, reason: String },

    // ========== Channel Errors ==========

    /// Peer is unreachable or the channel was closed
    #[error("Channel to worker {peer} failed: {reason}")]
    Channel { peer: u32, reason: String },

    /// Frame or broadcast payload could not be decoded
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    // ========== Generic ==========

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ShardflowError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardflowError::Io(_) | ShardflowError::Channel { .. }
        )
    }

    /// Returns true if this error was captured while holding the write token
    /// and must only surface after the group barrier
    pub fn is_deferred(&self) -> bool {
        matches!(self, ShardflowError::Flush { .. })
    }

    /// Returns true if this error must stop the run before any I/O
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ShardflowError::InvalidConfig { .. } | ShardflowError::UnsupportedMode { .. }
        )
    }
}

/// Result type alias for shardflow operations
pub type Result<T> = std::result::Result<T, ShardflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let flush = ShardflowError::Flush {
            rank: 2,
            source: Box::new(ShardflowError::Sink {
                path: "out.json".into(),
                reason: "disk full".into(),
            }),
        };
        assert!(flush.is_deferred());
        assert!(!flush.is_retryable());
        assert!(flush.to_string().contains("worker 2"));

        let cfg = ShardflowError::InvalidConfig { reason: "x".into() };
        assert!(cfg.is_config());

        let channel = ShardflowError::Channel { peer: 1, reason: "reset".into() };
        assert!(channel.is_retryable());
    }
}
