//! Broker-backed asynchronous task execution.
//!
//! taskmill lets a coordinator dispatch long-running computational jobs
//! (model-card generation, equation extraction, knowledge-graph operations
//! and the like) to a pool of worker subprocesses, wait for or subscribe
//! to results, cancel mid-flight, and reuse previously computed results
//! for identical requests.
//!
//! # Architecture
//!
//! - [`broker`] - the three-channel topology (shared request queue,
//!   broadcast response channel, per-task cancellation channels), with an
//!   in-process implementation.
//! - [`client`] - the coordinator: submit sync/async, cancel, live status
//!   subscriptions, script-keyed response hooks, and the single listener
//!   that resolves futures by id.
//! - [`worker`] - the dispatcher pool and the per-task subprocess manager
//!   communicating over single-use named pipes.
//! - [`cache`] / [`fingerprint`] - success-only result reuse keyed by a
//!   deterministic fingerprint of the work-defining request fields.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskmill::broker::InMemoryBroker;
//! use taskmill::cache::InMemoryResultCache;
//! use taskmill::client::TaskClient;
//! use taskmill::types::TaskRequest;
//! use taskmill::worker::{CommandTemplate, Dispatcher, ScriptRegistry};
//!
//! # async fn example() -> taskmill::Result<()> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let registry = Arc::new(ScriptRegistry::new().register(
//!     "echo",
//!     CommandTemplate::new("sh").with_args(["-c", r#"cat <"$1" >"$2""#]),
//! ));
//! let dispatcher = Dispatcher::new(broker.clone(), registry).spawn();
//!
//! let client = TaskClient::new(broker, Arc::new(InMemoryResultCache::new()));
//! let response = client
//!     .submit_sync(TaskRequest::new("echo", "echo", b"hello".to_vec()))
//!     .await?;
//! assert_eq!(response.output.as_deref(), Some(&b"hello"[..]));
//!
//! dispatcher.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - For one task id, `Running` (if observed) precedes the terminal
//!   status; exactly one terminal status is delivered, and duplicates are
//!   ignored.
//! - Only successes are cached; failed and cancelled work always
//!   re-dispatches on resubmission.
//! - Every stage of a task (input write, output read, exit wait) is
//!   bounded by the request timeout; a hung worker is killed before its
//!   terminal status is published.

pub mod broker;
pub mod cache;
pub mod client;
pub mod codec;
pub mod error;
pub mod fingerprint;
pub mod types;
pub mod worker;

pub use client::{ResponseHandler, TaskClient, TaskFuture, TaskSubscription};
pub use error::{Error, Result};
pub use types::{TaskRequest, TaskResponse, TaskStatus};

/// Installs a global `tracing` subscriber reading `RUST_LOG`.
///
/// Convenience for binaries and examples; returns quietly if a subscriber
/// is already set (e.g. by a test harness).
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
