//! Domain-level error kinds. Transport errors are caught at the boundary of
//! the component that owns the external call and mapped into these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SentinelError {
    /// A filter or tender violates a documented constraint; it never enters
    /// the pipeline.
    #[error("input rejected: {0}")]
    InputRejected(String),

    /// HTTP 5xx, timeout, rate-limit. Recovered within the cycle only for
    /// enrichment; everything else waits for the next cycle.
    #[error("transient external failure: {0}")]
    Transient(String),

    /// The sink reported the recipient unreachable.
    #[error("permanent external failure: {0}")]
    Permanent(String),

    /// Loss of the persistent backend. The engine stops emitting
    /// notifications and waits for an operator.
    #[error("persistent backend failure: {0}")]
    Fatal(String),
}
