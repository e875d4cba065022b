//! Matching and delivery pipeline.
//!
//! The engine stitches together the feed, the deterministic matcher, the
//! relevance oracle, and the notification sink, with the delivery ledger and
//! quota gate enforcing at-most-once delivery under per-subscriber caps.

pub mod cache;
pub mod engine;
pub mod feed;
pub mod ledger;
pub mod oracle;
pub mod quota;
pub mod sink;
pub mod store;

// Re-export main types
pub use cache::{CacheKind, PersistentCache};
pub use engine::{CycleMetrics, EngineState, PipelineEngine, ShutdownHandle};
pub use feed::{FeedQuery, FeedSource, ZakupkiFeed};
pub use ledger::{AbandonCause, DeliveryLedger, Reservation, ReserveOutcome};
pub use oracle::{HttpRelevanceOracle, OracleAssessment, OracleDecision, RelevanceOracle};
pub use quota::{QuotaGate, QuotaResource};
pub use sink::{NotificationMessage, NotificationSink, SendOutcome, TelegramSink};
pub use store::Store;
