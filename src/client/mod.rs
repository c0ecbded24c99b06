//! Caller-facing coordinator.
//!
//! A [`TaskClient`] submits work, consults the result cache before any
//! broker traffic, and runs one continuous listener that drains the shared
//! response channel: futures are resolved by id exactly once (removal of
//! the pending entry is the compare-and-set), subscribers are fanned out
//! to with bounded non-blocking sends, successes are stored in the cache,
//! and script-keyed hooks run on their own tasks.
//!
//! The pending table and cache are owned, injected components; independent
//! clients can coexist against the same or different brokers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{ResponseStream, TaskBroker};
use crate::cache::ResultCache;
use crate::codec;
use crate::error::Result;
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::types::{TaskRequest, TaskResponse, TaskStatus};

pub mod future;
pub mod handlers;
pub mod subscription;

pub use future::TaskFuture;
pub use handlers::ResponseHandler;
pub use subscription::TaskSubscription;

use handlers::HandlerRegistry;

/// Events buffered per subscriber before fan-out starts dropping.
const SUBSCRIPTION_BUFFER: usize = 32;

/// Coordinator state for one outstanding task.
pub(crate) struct PendingTask {
    script: String,
    fingerprint: Option<Fingerprint>,
    terminal_tx: Option<oneshot::Sender<TaskResponse>>,
    subscribers: Vec<mpsc::Sender<TaskResponse>>,
}

impl PendingTask {
    /// An entry created by `subscribe` before (or without) a submit.
    pub(crate) fn watch_only() -> Self {
        Self {
            script: String::new(),
            fingerprint: None,
            terminal_tx: None,
            subscribers: Vec::new(),
        }
    }

    /// Non-blocking fan-out: a full subscriber loses this event, a closed
    /// one is dropped, and neither stalls anyone else.
    fn forward(&mut self, response: &TaskResponse) {
        self.subscribers.retain(|tx| match tx.try_send(response.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(id = %response.id, "slow subscriber; event dropped");
                true
            },
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

struct ClientInner {
    broker: Arc<dyn TaskBroker>,
    cache: Arc<dyn ResultCache>,
    pending: Arc<DashMap<Uuid, PendingTask>>,
    handlers: HandlerRegistry,
}

impl ClientInner {
    fn run_handlers(&self, script: &str, response: &TaskResponse) {
        if script.is_empty() {
            return;
        }
        if let Some(handler) = self.handlers.get(script) {
            let response = response.clone();
            tokio::spawn(async move {
                if let Err(e) = handler.on_response(&response).await {
                    warn!(id = %response.id, error = %e, "response handler failed");
                }
            });
        }
    }

    async fn dispatch(&self, response: TaskResponse) {
        if !response.is_terminal() {
            if let Some(mut entry) = self.pending.get_mut(&response.id) {
                entry.forward(&response);
            }
            return;
        }

        // Exactly-once terminal delivery: whoever removes the entry wins,
        // so a duplicate terminal frame finds nothing to resolve.
        let Some((_, mut entry)) = self.pending.remove(&response.id) else {
            debug!(id = %response.id, "terminal response for unknown or resolved task; ignored");
            return;
        };

        if response.status == TaskStatus::Success {
            if let Some(fp) = entry.fingerprint.take() {
                self.cache.store(fp, response.clone()).await;
            }
        }

        self.run_handlers(&entry.script, &response);
        entry.forward(&response);
        if let Some(tx) = entry.terminal_tx.take() {
            // The caller may have stopped waiting; that is their business.
            let _ = tx.send(response);
        }
        // Dropping the entry closes every subscriber stream.
    }
}

async fn listen(inner: Arc<ClientInner>, mut responses: ResponseStream) {
    while let Some(frame) = responses.recv().await {
        match codec::decode_response(&frame) {
            Ok(response) => inner.dispatch(response).await,
            Err(e) => warn!(error = %e, "dropping undecodable response frame"),
        }
    }
    debug!("response channel closed; listener exiting");
}

/// Submits tasks and resolves their responses.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use taskmill::broker::InMemoryBroker;
/// use taskmill::cache::InMemoryResultCache;
/// use taskmill::client::TaskClient;
/// use taskmill::types::TaskRequest;
///
/// # async fn example() -> taskmill::Result<()> {
/// let broker = Arc::new(InMemoryBroker::new());
/// let client = TaskClient::new(broker, Arc::new(InMemoryResultCache::new()));
///
/// let request = TaskRequest::new("cards", "generate", b"{}".to_vec());
/// let response = client.submit_sync(request).await?;
/// println!("finished with {}", response.status);
/// # Ok(())
/// # }
/// ```
pub struct TaskClient {
    inner: Arc<ClientInner>,
    listener: JoinHandle<()>,
}

impl TaskClient {
    /// Creates a client over `broker`, consulting `cache` before dispatch.
    ///
    /// The response subscription is opened here, before the constructor
    /// returns, so no response published afterwards can be missed.
    pub fn new(broker: Arc<dyn TaskBroker>, cache: Arc<dyn ResultCache>) -> Self {
        let responses = broker.subscribe_responses();
        let inner = Arc::new(ClientInner {
            broker,
            cache,
            pending: Arc::new(DashMap::new()),
            handlers: HandlerRegistry::default(),
        });
        let listener = tokio::spawn(listen(Arc::clone(&inner), responses));
        Self { inner, listener }
    }

    /// Registers a hook for terminal responses of one script key.
    pub fn register_handler(&self, script: impl Into<String>, handler: Arc<dyn ResponseHandler>) {
        self.inner.handlers.register(script, handler);
    }

    /// Submits a task and returns a future over its terminal response.
    ///
    /// On a cache hit the future is already resolved: no broker traffic,
    /// no subprocess. The materialized response carries this request's id
    /// and additional-properties over the cached output.
    pub async fn submit_async(&self, request: TaskRequest) -> Result<TaskFuture> {
        let fp = fingerprint(&request);

        if let Some(hit) = self.inner.cache.lookup(&fp).await {
            debug!(id = %request.id, fingerprint = %fp, "cache hit; skipping dispatch");
            let response = materialize_hit(hit.response, &request);

            // A subscription opened before this submit still gets closure.
            if let Some((_, mut entry)) = self.inner.pending.remove(&request.id) {
                entry.forward(&response);
            }
            self.inner.run_handlers(&request.script, &response);

            let (tx, rx) = oneshot::channel();
            let _ = tx.send(response);
            return Ok(TaskFuture::new(
                request.id,
                rx,
                Arc::clone(&self.inner.pending),
            ));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut entry = self
                .inner
                .pending
                .entry(request.id)
                .or_insert_with(PendingTask::watch_only);
            entry.script = request.script.clone();
            entry.fingerprint = Some(fp);
            entry.terminal_tx = Some(tx);
        }

        let frame = match codec::encode_request(&request) {
            Ok(frame) => frame,
            Err(e) => {
                self.inner.pending.remove(&request.id);
                return Err(e.into());
            },
        };
        if let Err(e) = self.inner.broker.publish_request(frame).await {
            self.inner.pending.remove(&request.id);
            return Err(e);
        }
        debug!(id = %request.id, family = %request.family, script = %request.script, "task submitted");

        Ok(TaskFuture::new(
            request.id,
            rx,
            Arc::clone(&self.inner.pending),
        ))
    }

    /// Submits a task and blocks up to the request's timeout for the
    /// terminal response.
    pub async fn submit_sync(&self, request: TaskRequest) -> Result<TaskResponse> {
        let budget = request.timeout();
        self.submit_async(request).await?.wait(budget).await
    }

    /// Publishes a cancellation signal for `id`.
    ///
    /// Best-effort and asynchronous: the only acknowledgement is a later
    /// Cancelling/Cancelled transition, and the signal races natural
    /// completion.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        debug!(%id, "cancellation requested");
        self.inner.broker.publish_cancellation(id).await
    }

    /// Opens a live status stream for `id`.
    pub fn subscribe(&self, id: Uuid) -> TaskSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.inner
            .pending
            .entry(id)
            .or_insert_with(PendingTask::watch_only)
            .subscribers
            .push(tx);
        TaskSubscription::new(id, rx)
    }

    /// Number of tasks awaiting a terminal response.
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stops the response listener. Outstanding futures will time out.
    pub fn shutdown(&self) {
        self.listener.abort();
    }
}

impl Drop for TaskClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn materialize_hit(cached: TaskResponse, request: &TaskRequest) -> TaskResponse {
    TaskResponse {
        id: request.id,
        additional_properties: request.additional_properties.clone(),
        ..cached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::cache::InMemoryResultCache;
    use crate::error::Error;
    use serde_json::json;
    use std::time::Duration;

    fn harness() -> (Arc<InMemoryBroker>, Arc<InMemoryResultCache>, TaskClient) {
        let broker = Arc::new(InMemoryBroker::new());
        let cache = Arc::new(InMemoryResultCache::new());
        let client = TaskClient::new(broker.clone(), cache.clone());
        (broker, cache, client)
    }

    /// Publishes a response frame as a dispatcher would.
    async fn publish(broker: &InMemoryBroker, response: &TaskResponse) {
        broker
            .publish_response(codec::encode_response(response).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn async_submit_resolves_on_terminal_response() {
        let (broker, _cache, client) = harness();
        let request = TaskRequest::new("f", "s", b"in".to_vec());
        let future = client.submit_async(request.clone()).await.unwrap();
        assert_eq!(client.pending_tasks(), 1);

        // The request frame reached the work queue.
        let frame = broker.next_request().await.unwrap();
        let seen = codec::decode_request(&frame).unwrap();
        assert_eq!(seen.id, request.id);

        publish(&broker, &TaskResponse::success(&request, b"out".to_vec())).await;

        let response = future.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.output.as_deref(), Some(&b"out"[..]));
        assert_eq!(client.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn duplicate_terminal_is_ignored() {
        let (broker, _cache, client) = harness();
        let request = TaskRequest::new("f", "s", vec![]);
        let future = client.submit_async(request.clone()).await.unwrap();
        let _ = broker.next_request().await;

        publish(&broker, &TaskResponse::success(&request, b"first".to_vec())).await;
        publish(&broker, &TaskResponse::failed(&request, "late duplicate")).await;

        let response = future.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.status, TaskStatus::Success);
        assert_eq!(response.output.as_deref(), Some(&b"first"[..]));

        // Give the listener a beat; the duplicate must not resurrect state.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn success_is_cached_and_served_without_dispatch() {
        let (broker, cache, client) = harness();
        let first = TaskRequest::new("f", "s", b"same".to_vec());
        let future = client.submit_async(first.clone()).await.unwrap();
        let _ = broker.next_request().await;
        publish(&broker, &TaskResponse::success(&first, b"computed".to_vec())).await;
        future.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(cache.len(), 1);

        let second = TaskRequest::new("f", "s", b"same".to_vec())
            .with_properties(json!({"caller": "two"}));
        let response = client
            .submit_async(second.clone())
            .await
            .unwrap()
            .wait(Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(response.id, second.id, "hit carries the new request id");
        assert_eq!(response.additional_properties, json!({"caller": "two"}));
        assert_eq!(response.output.as_deref(), Some(&b"computed"[..]));

        // Nothing further reached the work queue.
        let extra =
            tokio::time::timeout(Duration::from_millis(100), broker.next_request()).await;
        assert!(extra.is_err(), "cache hit must not publish a request");
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (broker, cache, client) = harness();
        let request = TaskRequest::new("f", "s", b"x".to_vec());
        let future = client.submit_async(request.clone()).await.unwrap();
        let _ = broker.next_request().await;
        publish(&broker, &TaskResponse::failed(&request, "no luck")).await;

        let response = future.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.status, TaskStatus::Failed);
        assert!(cache.is_empty());

        // An identical resubmission dispatches again.
        let retry = TaskRequest::new("f", "s", b"x".to_vec());
        let _future = client.submit_async(retry).await.unwrap();
        assert!(broker.next_request().await.is_some());
    }

    #[tokio::test]
    async fn subscription_sees_running_then_terminal_then_closes() {
        let (broker, _cache, client) = harness();
        let request = TaskRequest::new("f", "s", vec![]);

        let mut subscription = client.subscribe(request.id);
        let future = client.submit_async(request.clone()).await.unwrap();
        let _ = broker.next_request().await;

        publish(&broker, &TaskResponse::running(&request)).await;
        publish(&broker, &TaskResponse::success(&request, vec![])).await;

        assert_eq!(
            subscription.next().await.unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            subscription.next().await.unwrap().status,
            TaskStatus::Success
        );
        assert!(subscription.next().await.is_none(), "closed after terminal");

        future.wait(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_subscription_does_not_affect_the_task() {
        let (broker, _cache, client) = harness();
        let request = TaskRequest::new("f", "s", vec![]);

        let subscription = client.subscribe(request.id);
        let future = client.submit_async(request.clone()).await.unwrap();
        drop(subscription);

        let _ = broker.next_request().await;
        publish(&broker, &TaskResponse::running(&request)).await;
        publish(&broker, &TaskResponse::success(&request, vec![])).await;

        let response = future.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn wait_timeout_releases_the_entry() {
        let (broker, _cache, client) = harness();
        let request = TaskRequest::new("f", "s", vec![]);
        let id = request.id;
        let future = client.submit_async(request.clone()).await.unwrap();
        let _ = broker.next_request().await;

        let result = future.wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(client.pending_tasks(), 0);

        // The late terminal is ignored without error.
        publish(&broker, &TaskResponse::success(&request, vec![])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = id;
    }

    #[tokio::test]
    async fn handlers_run_on_matching_terminal_responses() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Recorder(AtomicUsize);

        #[async_trait::async_trait]
        impl ResponseHandler for Recorder {
            async fn on_response(&self, response: &TaskResponse) -> anyhow::Result<()> {
                assert!(response.is_terminal());
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (broker, _cache, client) = harness();
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        client.register_handler("annotate", recorder.clone());

        let request = TaskRequest::new("f", "annotate", vec![]);
        let future = client.submit_async(request.clone()).await.unwrap();
        let _ = broker.next_request().await;
        publish(&broker, &TaskResponse::success(&request, vec![])).await;
        future.wait(Duration::from_secs(2)).await.unwrap();

        // Hook runs on its own task.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);

        // A cache hit for the same work also triggers the hook.
        let again = TaskRequest::new("f", "annotate", vec![]);
        client
            .submit_async(again)
            .await
            .unwrap()
            .wait(Duration::from_secs(2))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_handler_never_reaches_the_future() {
        struct Exploding;

        #[async_trait::async_trait]
        impl ResponseHandler for Exploding {
            async fn on_response(&self, _response: &TaskResponse) -> anyhow::Result<()> {
                anyhow::bail!("hook blew up")
            }
        }

        let (broker, _cache, client) = harness();
        client.register_handler("s", Arc::new(Exploding));

        let request = TaskRequest::new("f", "s", vec![]);
        let future = client.submit_async(request.clone()).await.unwrap();
        let _ = broker.next_request().await;
        publish(&broker, &TaskResponse::success(&request, vec![])).await;

        let response = future.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(response.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn cancel_reaches_an_open_channel() {
        let (broker, _cache, client) = harness();
        let id = Uuid::new_v4();
        let mut watch = broker.open_cancellation(id);

        client.cancel(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), watch.signalled())
            .await
            .expect("signal observed");
    }
}
