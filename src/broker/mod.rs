//! Broker topology: the three channel families task traffic travels on.
//!
//! - one shared **request** channel: many producers, competing consumers;
//! - one shared **response** channel: broadcast, every coordinator filters
//!   by task id;
//! - one **cancellation** channel per task id, opened at dispatch and torn
//!   down at completion.
//!
//! The [`TaskBroker`] trait is byte-oriented: frames are encoded with
//! [`codec`](crate::codec) at the edges, so an undecodable request frame
//! can be observed (and dropped) by the dispatcher exactly as a foreign
//! producer would cause on a real broker. [`memory::InMemoryBroker`]
//! realizes the topology over tokio channels for embedded use and tests.
//!
//! A cancellation published while no channel is open for that id is
//! dropped. This preserves the source system's cancel-before-subscribe
//! race; see DESIGN.md.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

pub mod memory;

pub use memory::InMemoryBroker;

/// Channel capacities a broker declares when binding its topology.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Depth of the shared request queue.
    pub request_depth: usize,
    /// Buffered frames per response subscriber before lag sets in.
    pub response_capacity: usize,
    /// Buffered signals per cancellation channel.
    pub cancellation_capacity: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            request_depth: 256,
            response_capacity: 256,
            cancellation_capacity: 8,
        }
    }
}

impl TopologyConfig {
    /// Sets the shared request queue depth.
    pub fn with_request_depth(mut self, depth: usize) -> Self {
        self.request_depth = depth;
        self
    }

    /// Sets the per-subscriber response buffer.
    pub fn with_response_capacity(mut self, capacity: usize) -> Self {
        self.response_capacity = capacity;
        self
    }
}

/// A subscription to the shared response channel.
///
/// Wraps a broadcast receiver: a subscriber that falls behind loses the
/// oldest frames (logged), never stalls the publisher.
pub struct ResponseStream {
    rx: broadcast::Receiver<Bytes>,
}

impl ResponseStream {
    pub(crate) fn new(rx: broadcast::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Receives the next response frame; `None` once the channel closes.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "response subscriber lagged; frames dropped");
                },
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A watch over one task's cancellation channel.
pub struct CancellationWatch {
    rx: broadcast::Receiver<()>,
}

impl CancellationWatch {
    pub(crate) fn new(rx: broadcast::Receiver<()>) -> Self {
        Self { rx }
    }

    /// Resolves once a cancellation signal is observed.
    ///
    /// If the channel closes without a signal, this pends forever; callers
    /// race it against task completion in a `select!`.
    pub async fn signalled(&mut self) {
        loop {
            match self.rx.recv().await {
                Ok(()) => return,
                // Lag still means at least one signal was published.
                Err(broadcast::error::RecvError::Lagged(_)) => return,
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                },
            }
        }
    }
}

/// Transport for task traffic.
///
/// Implementations bind the three-channel topology above. All methods are
/// frame-oriented; encoding lives in [`codec`](crate::codec).
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Publishes a request frame onto the shared work queue.
    async fn publish_request(&self, frame: Bytes) -> Result<()>;

    /// Claims the next request frame; `None` once the queue closes.
    ///
    /// Consumers compete: each frame is delivered to exactly one claimant.
    async fn next_request(&self) -> Option<Bytes>;

    /// Publishes a response frame to every subscriber.
    async fn publish_response(&self, frame: Bytes) -> Result<()>;

    /// Opens a subscription to the shared response channel.
    fn subscribe_responses(&self) -> ResponseStream;

    /// Opens (or joins) the cancellation channel scoped to `id`.
    fn open_cancellation(&self, id: Uuid) -> CancellationWatch;

    /// Publishes a cancellation signal for `id`.
    ///
    /// Best-effort: if no channel is open for the id, the signal is
    /// dropped.
    async fn publish_cancellation(&self, id: Uuid) -> Result<()>;

    /// Tears down the cancellation channel for `id`. Idempotent.
    fn close_cancellation(&self, id: Uuid);
}
