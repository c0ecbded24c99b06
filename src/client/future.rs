//! Coordinator-side handle to a task's terminal response.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::TaskResponse;

use super::PendingTask;

/// Resolves to the task's single terminal response.
///
/// Fulfilled exactly once; a future that times out releases its pending
/// entry, so a terminal response arriving later is discarded rather than
/// delivered.
pub struct TaskFuture {
    id: Uuid,
    rx: oneshot::Receiver<TaskResponse>,
    pending: Arc<DashMap<Uuid, PendingTask>>,
}

impl TaskFuture {
    pub(crate) fn new(
        id: Uuid,
        rx: oneshot::Receiver<TaskResponse>,
        pending: Arc<DashMap<Uuid, PendingTask>>,
    ) -> Self {
        Self { id, rx, pending }
    }

    /// The id of the task this future tracks.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Waits up to `timeout` for the terminal response.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if no terminal response arrived in time (the
    /// pending entry is removed); [`Error::CoordinatorStopped`] if the
    /// coordinator released the task without resolving it.
    pub async fn wait(self, timeout: Duration) -> Result<TaskResponse> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::CoordinatorStopped { id: self.id }),
            Err(_) => {
                self.pending.remove(&self.id);
                Err(Error::Timeout { id: self.id })
            },
        }
    }
}
