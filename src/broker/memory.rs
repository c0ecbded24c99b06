//! In-process broker over tokio channels.
//!
//! Binds the full topology at construction: an mpsc work queue for
//! requests (competing consumers share one receiver), a broadcast channel
//! for responses, and a registry of per-task broadcast channels for
//! cancellation signals.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{CancellationWatch, ResponseStream, TaskBroker, TopologyConfig};

/// [`TaskBroker`] implementation backed by in-process tokio channels.
///
/// Suitable for embedded deployments and tests; a networked broker
/// implements the same trait against its own transport.
///
/// # Examples
///
/// ```
/// use taskmill::broker::{InMemoryBroker, TaskBroker, TopologyConfig};
///
/// let broker = InMemoryBroker::with_topology(
///     TopologyConfig::default().with_request_depth(64),
/// );
/// let _responses = broker.subscribe_responses();
/// ```
pub struct InMemoryBroker {
    request_tx: mpsc::Sender<Bytes>,
    request_rx: Mutex<mpsc::Receiver<Bytes>>,
    response_tx: broadcast::Sender<Bytes>,
    cancellations: DashMap<Uuid, broadcast::Sender<()>>,
    topology: TopologyConfig,
}

impl InMemoryBroker {
    /// Creates a broker with the default topology.
    pub fn new() -> Self {
        Self::with_topology(TopologyConfig::default())
    }

    /// Creates a broker with explicit channel capacities.
    pub fn with_topology(topology: TopologyConfig) -> Self {
        let (request_tx, request_rx) = mpsc::channel(topology.request_depth);
        let (response_tx, _) = broadcast::channel(topology.response_capacity);
        Self {
            request_tx,
            request_rx: Mutex::new(request_rx),
            response_tx,
            cancellations: DashMap::new(),
            topology,
        }
    }

    /// Number of currently open cancellation channels.
    pub fn open_cancellation_channels(&self) -> usize {
        self.cancellations.len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBroker for InMemoryBroker {
    async fn publish_request(&self, frame: Bytes) -> Result<()> {
        self.request_tx
            .send(frame)
            .await
            .map_err(|_| Error::BrokerClosed)
    }

    async fn next_request(&self) -> Option<Bytes> {
        // Consumers serialize on the receiver; each frame goes to exactly
        // one claimant.
        self.request_rx.lock().await.recv().await
    }

    async fn publish_response(&self, frame: Bytes) -> Result<()> {
        // A send with no live subscriber is not an error: responses are
        // broadcast, and nobody may be listening for this task anymore.
        let _ = self.response_tx.send(frame);
        Ok(())
    }

    fn subscribe_responses(&self) -> ResponseStream {
        ResponseStream::new(self.response_tx.subscribe())
    }

    fn open_cancellation(&self, id: Uuid) -> CancellationWatch {
        let tx = self
            .cancellations
            .entry(id)
            .or_insert_with(|| broadcast::channel(self.topology.cancellation_capacity).0);
        CancellationWatch::new(tx.subscribe())
    }

    async fn publish_cancellation(&self, id: Uuid) -> Result<()> {
        match self.cancellations.get(&id) {
            Some(tx) => {
                let _ = tx.send(());
            },
            None => {
                // Published before the per-task channel exists: lost by
                // design (see DESIGN.md on the cancel-before-subscribe race).
                debug!(%id, "cancellation dropped; no open channel");
            },
        }
        Ok(())
    }

    fn close_cancellation(&self, id: Uuid) {
        self.cancellations.remove(&id);
    }
}
