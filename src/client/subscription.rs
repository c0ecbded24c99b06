//! Live status streams for individual tasks.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::types::TaskResponse;

/// A one-way stream of every observed response for one task.
///
/// Emits non-terminal transitions (Running, Cancelling) and the terminal
/// response, then closes. Dropping the subscription detaches it without
/// affecting the task; a subscriber that falls behind loses events rather
/// than stalling the coordinator.
pub struct TaskSubscription {
    id: Uuid,
    rx: mpsc::Receiver<TaskResponse>,
}

impl TaskSubscription {
    pub(crate) fn new(id: Uuid, rx: mpsc::Receiver<TaskResponse>) -> Self {
        Self { id, rx }
    }

    /// The id of the task this subscription follows.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The next observed response; `None` once the stream closes after the
    /// terminal status.
    pub async fn next(&mut self) -> Option<TaskResponse> {
        self.rx.recv().await
    }
}

impl Stream for TaskSubscription {
    type Item = TaskResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
