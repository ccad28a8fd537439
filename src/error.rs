//! Error taxonomy for the detection pipeline.
//!
//! Transient upstream and store errors are retried by their owners and never
//! reach subscribers. Detector failures degrade to a zero score. Corrupt
//! events are counted and dropped. Only configuration errors are fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Upstream quota exhausted; retry after the advertised reset.
    #[error("upstream rate limited, resets at unix {reset_unix}")]
    RateLimited { reset_unix: u64 },

    /// Upstream returned a retryable status (5xx).
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    /// Transport-level failure talking to the upstream API.
    #[error("upstream transport: {0}")]
    UpstreamTransport(#[from] reqwest::Error),

    /// Permanent authentication failure; not retryable.
    #[error("upstream rejected credentials (status {status})")]
    UpstreamAuth { status: u16 },

    /// Cache, queue or profile store blip; retryable.
    #[error("store unavailable: {0}")]
    Store(String),

    /// The work queue has been closed; processors should shut down.
    #[error("event queue closed")]
    QueueClosed,

    /// Event failed structural validation on ingest.
    #[error("corrupt event: {reason}")]
    CorruptEvent { reason: &'static str },

    /// A detector failed internally; isolated to a degraded result.
    #[error("detector {name} failed: {reason}")]
    Detector { name: &'static str, reason: String },

    /// Publish-side failure; retried by the publisher.
    #[error("publish failed on channel {channel}: {reason}")]
    Publish { channel: String, reason: String },

    /// Startup-time configuration problem. Fatal.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the owner should retry rather than surface the error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. }
                | Error::UpstreamStatus { .. }
                | Error::UpstreamTransport(_)
                | Error::Store(_)
                | Error::Publish { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::UpstreamAuth { .. } | Error::QueueClosed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::RateLimited { reset_unix: 0 }.is_transient());
        assert!(Error::UpstreamStatus { status: 503 }.is_transient());
        assert!(Error::Store("redis gone".into()).is_transient());
        assert!(!Error::Config("bad".into()).is_transient());
        assert!(!Error::CorruptEvent { reason: "no id" }.is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Config("bad".into()).is_fatal());
        assert!(Error::UpstreamAuth { status: 401 }.is_fatal());
        assert!(!Error::UpstreamStatus { status: 500 }.is_fatal());
    }
}
