//! Error types for the caller-facing task surface.
//!
//! Worker-internal failures (pipe faults, non-zero exits, stage timeouts)
//! never surface here; the dispatcher folds them into a terminal
//! [`TaskResponse`](crate::types::TaskResponse) with status `Failed` or
//! `Cancelled`. This enum covers only what a submitting caller can hit.

use uuid::Uuid;

/// Result type alias using the crate error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to task submitters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No terminal response arrived within the wait budget.
    ///
    /// The task itself may still complete later; the pending entry has been
    /// released, so the response will be discarded when it arrives.
    #[error("timed out waiting for task {id}")]
    Timeout {
        /// Id of the task that was being awaited.
        id: Uuid,
    },

    /// The broker rejected a publish because the channel is closed.
    #[error("broker channel closed")]
    BrokerClosed,

    /// A request or response could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The coordinator's listener shut down before the task resolved.
    #[error("coordinator stopped before task {id} resolved")]
    CoordinatorStopped {
        /// Id of the task whose future was abandoned.
        id: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_task_id() {
        let id = Uuid::new_v4();
        let err = Error::Timeout { id };
        assert!(err.to_string().contains(&id.to_string()));

        let err = Error::CoordinatorStopped { id };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
