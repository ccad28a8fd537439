//! forgewatch: near real-time anomaly detection over the public activity
//! stream of a code-hosting platform.
//!
//! The pipeline: a rate-limit-aware poller feeds a bounded priority queue;
//! stream processors batch events, drive four detectors in parallel
//! (behavioral, temporal, content, contextual), fuse the component scores,
//! persist anomaly records idempotently, and fan them out over severity,
//! actor and repository channels. Per-actor baselines live in a profile
//! store with per-key read-modify-write and a bounded cache.

pub mod algo;
pub mod config;
pub mod detect;
pub mod error;
pub mod event;
pub mod fuse;
pub mod history;
pub mod limits;
pub mod metrics;
pub mod poller;
pub mod processor;
pub mod profile;
pub mod publish;
pub mod queue;
pub mod record;
pub mod sink;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventType, Priority};
pub use fuse::{FusedScore, Severity, fuse};
pub use processor::{ProcessorParts, StreamProcessor};
pub use profile::{RepoProfile, UserProfile};
pub use record::{AnomalyRecord, MemoryRecordStore, NoopSummarizer, RecordStore, Summarizer};
pub use store::{MemoryProfileStore, ProfileStore};
