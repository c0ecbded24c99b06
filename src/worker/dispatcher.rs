//! Bounded pool of task consumers.
//!
//! Each consumer claims one request frame at a time and drives exactly one
//! [`WorkerProcess`] to completion, publishing status transitions as it
//! goes. Consumers share nothing but the broker and the script registry;
//! one task's fate never touches another's.
//!
//! Undecodable request frames are dropped silently (the submitter's future
//! times out by design). The cancellation subscription is opened before
//! the subprocess exists, so a cancel arriving during startup is not
//! missed; a cancel published before the frame was claimed at all is lost,
//! which is the preserved upstream race (see DESIGN.md).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::{CancellationWatch, TaskBroker};
use crate::codec;
use crate::types::{TaskRequest, TaskResponse};

use super::process::{ProcessError, WorkerProcess};
use super::scripts::ScriptRegistry;

/// Tuning for the dispatcher pool.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent consumers; each handles one task end-to-end.
    pub concurrency: usize,

    /// Directory where per-attempt channel endpoints are created.
    pub pipe_dir: PathBuf,

    /// Optional upper bound on the per-stage timeout, overriding larger
    /// request budgets. Absent by default.
    pub timeout_clamp: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            pipe_dir: std::env::temp_dir(),
            timeout_clamp: None,
        }
    }
}

impl DispatcherConfig {
    /// Sets the consumer count.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the directory for channel endpoints.
    pub fn with_pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipe_dir = dir.into();
        self
    }

    /// Caps the per-stage timeout regardless of what requests ask for.
    pub fn with_timeout_clamp(mut self, clamp: Duration) -> Self {
        self.timeout_clamp = Some(clamp);
        self
    }
}

enum DriveOutcome {
    Completed(Result<Vec<u8>, ProcessError>),
    CancelObserved,
}

/// Consumes task requests and runs worker subprocesses for them.
pub struct Dispatcher {
    broker: Arc<dyn TaskBroker>,
    registry: Arc<ScriptRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Creates a dispatcher with the default configuration.
    pub fn new(broker: Arc<dyn TaskBroker>, registry: Arc<ScriptRegistry>) -> Self {
        Self {
            broker,
            registry,
            config: DispatcherConfig::default(),
        }
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Starts the consumer pool and returns its handle.
    pub fn spawn(self) -> DispatcherHandle {
        let dispatcher = Arc::new(self);
        let handles = (0..dispatcher.config.concurrency)
            .map(|index| {
                let consumer = Arc::clone(&dispatcher);
                tokio::spawn(async move { consumer.run_consumer(index).await })
            })
            .collect();
        DispatcherHandle { handles }
    }

    async fn run_consumer(&self, index: usize) {
        while let Some(frame) = self.broker.next_request().await {
            self.handle_frame(frame).await;
        }
        debug!(consumer = index, "request channel closed; consumer exiting");
    }

    async fn handle_frame(&self, frame: Bytes) {
        let request = match codec::decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping undecodable request frame");
                return;
            },
        };

        // Open before the subprocess exists: a cancel during startup must
        // not slip past.
        let mut cancellation = self.broker.open_cancellation(request.id);
        let response = self.execute(&request, &mut cancellation).await;
        self.publish(&response).await;
        self.broker.close_cancellation(request.id);
    }

    fn effective_timeout(&self, request: &TaskRequest) -> Duration {
        let requested = request.timeout();
        self.config
            .timeout_clamp
            .map_or(requested, |clamp| requested.min(clamp))
    }

    async fn publish(&self, response: &TaskResponse) {
        match codec::encode_response(response) {
            Ok(frame) => {
                if let Err(e) = self.broker.publish_response(frame).await {
                    warn!(id = %response.id, error = %e, "failed to publish response");
                }
            },
            Err(e) => warn!(id = %response.id, error = %e, "failed to encode response"),
        }
    }

    async fn execute(
        &self,
        request: &TaskRequest,
        cancellation: &mut CancellationWatch,
    ) -> TaskResponse {
        let Some(template) = self.registry.resolve(&request.family) else {
            warn!(id = %request.id, family = %request.family, "no worker family registered");
            return TaskResponse::failed(
                request,
                format!("no worker registered for family '{}'", request.family),
            );
        };

        let mut process = match WorkerProcess::setup(template, request, &self.config.pipe_dir) {
            Ok(process) => process,
            Err(e) => return TaskResponse::failed(request, e.to_string()),
        };
        if let Err(e) = process.start() {
            process.teardown();
            return TaskResponse::failed(request, e.to_string());
        }
        self.publish(&TaskResponse::running(request)).await;

        let timeout = self.effective_timeout(request);
        let outcome = {
            let drive = Self::drive(&mut process, &request.input, timeout);
            tokio::pin!(drive);
            tokio::select! {
                result = &mut drive => DriveOutcome::Completed(result),
                () = cancellation.signalled() => DriveOutcome::CancelObserved,
            }
        };

        let response = match outcome {
            DriveOutcome::Completed(Ok(output)) => TaskResponse::success(request, output),
            DriveOutcome::Completed(Err(e)) => {
                // Timeout or fault: make sure nothing keeps running before
                // the terminal status goes out.
                process.cancel().await;
                let stderr = process.stderr_output().await;
                let mut detail = e.to_string();
                if !stderr.is_empty() {
                    detail.push_str(": ");
                    detail.push_str(stderr.trim_end());
                }
                debug!(id = %request.id, error = %e, "task failed");
                TaskResponse::failed(request, detail)
            },
            DriveOutcome::CancelObserved => {
                self.publish(&TaskResponse::cancelling(request)).await;
                process.cancel().await;
                let stderr = process.stderr_output().await;
                debug!(id = %request.id, "task cancelled");
                TaskResponse::cancelled(request, Some(stderr).filter(|s| !s.is_empty()))
            },
        };

        process.teardown();
        response
    }

    /// The happy path: one input record, one output record, a clean exit.
    /// Each stage is bounded by the same budget.
    async fn drive(
        process: &mut WorkerProcess,
        input: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ProcessError> {
        process.write_input(input, timeout).await?;
        let output = process.read_output(timeout).await?;
        process.wait(timeout).await?;
        Ok(output)
    }
}

/// Handle over a running consumer pool.
pub struct DispatcherHandle {
    handles: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stops all consumers. In-flight subprocesses are killed via their
    /// kill-on-drop guards.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// Returns `true` once every consumer has exited.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(JoinHandle::is_finished)
    }
}
