//! The execution fabric that drives passive subdomain sources: a per-source
//! daemon model, a bounded worker pool, a multi-keyed rate limiter, and the
//! task/subtask protocol that lets sources paginate or recurse while the
//! executor still knows when the fan-out has quiesced.

/// Passive agent: owns the source roster and fans input domains out.
pub mod agent;
/// `CancelHandle`, the one-shot cancellation signal used per source and
/// process-wide.
pub mod cancel;
/// Executor configuration.
pub mod config;
/// Worker pool consuming tasks and emitting results.
pub mod executor;
/// Per-domain memoized subdomain-matching patterns.
pub mod extractor;
/// Multi-keyed token buckets with per-source policies.
pub mod ratelimit;
/// HTTP transport wrapper: request construction, user-agent rotation and
/// the rate-limit decision point.
pub mod session;
/// The source contract and the daemon loop shared by all providers.
pub mod source;
/// `NamedTask` and associated helpers.
pub mod spawn;
/// The unit of work dispatched to workers.
pub mod task;
/// `WaitGroup` for tracking outstanding subtask promises.
pub mod waitgroup;

// Can save a `tokio` dependency declaration
pub use tokio;
