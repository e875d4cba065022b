//! tender-sentinel - procurement-feed monitoring and notification core.
//!
//! Polls a public procurement feed on behalf of many subscribers, scores new
//! tenders against their saved filters through a staged cascade (pre-score,
//! enrichment, full score, semantic verification), and delivers each match
//! at most once under per-subscriber daily quotas and quiet hours.

pub mod config;
pub mod error;
pub mod matcher;
pub mod pipeline;
pub mod regions;
pub mod types;

// Re-export main types for convenience
pub use error::SentinelError;
pub use matcher::SmartMatcher;
pub use regions::RegionRegistry;
pub use types::{EnrichedTender, Filter, RawTender, ScoreReport, Subscriber};
