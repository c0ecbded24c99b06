//! One task's worker subprocess and its channel pair.
//!
//! A [`WorkerProcess`] isolates a single task in its own OS process. The
//! payload crosses only the two single-use byte channels allocated at
//! setup; the child's stdout is discarded and its stderr is captured for
//! diagnostics. Channel endpoints are unique per attempt (task id plus a
//! fresh attempt id) and torn down unconditionally when the task ends.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::types::TaskRequest;

use super::channel::{ByteChannel, ChannelError};
use super::scripts::CommandTemplate;

/// How long stderr collection may run on after the child is gone.
const STDERR_DRAIN_BUDGET: Duration = Duration::from_secs(2);

/// Errors raised while driving one worker subprocess.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Channel setup or transfer failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The subprocess could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// The subprocess exited with a non-zero code.
    #[error("worker exited with code {code}")]
    NonZeroExit {
        /// The exit code, or -1 if killed by a signal.
        code: i32,
    },

    /// The subprocess did not exit within the budget.
    #[error("timed out waiting for worker exit")]
    ExitTimeout,

    /// Waiting on the subprocess failed at the OS level.
    #[error("failed to await worker exit: {0}")]
    Wait(#[source] std::io::Error),
}

fn make_channel(path: PathBuf) -> Result<Box<dyn ByteChannel>, ChannelError> {
    #[cfg(unix)]
    {
        Ok(Box::new(super::channel::FifoChannel::create(path)?))
    }
    #[cfg(not(unix))]
    {
        Err(ChannelError::Create {
            path,
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "named-pipe channels require a unix target",
            ),
        })
    }
}

/// Lifecycle manager for one task's subprocess.
pub struct WorkerProcess {
    task_id: Uuid,
    command: Command,
    input: Box<dyn ByteChannel>,
    output: Box<dyn ByteChannel>,
    child: Option<Child>,
    stderr_task: Option<JoinHandle<String>>,
}

impl WorkerProcess {
    /// Allocates the channel pair and builds (without starting) the worker
    /// invocation: template program, fixed args and env, then the script
    /// key and the two channel paths as trailing arguments.
    pub fn setup(
        template: &CommandTemplate,
        request: &TaskRequest,
        pipe_dir: &Path,
    ) -> Result<Self, ProcessError> {
        let attempt = Uuid::new_v4();
        let input_path = pipe_dir.join(format!("{}-{attempt}.in.fifo", request.id));
        let output_path = pipe_dir.join(format!("{}-{attempt}.out.fifo", request.id));

        let input = make_channel(input_path.clone())?;
        let output = match make_channel(output_path.clone()) {
            Ok(channel) => channel,
            Err(e) => {
                input.cleanup();
                return Err(e.into());
            },
        };

        let mut command = Command::new(&template.program);
        command
            .args(&template.args)
            .envs(&template.env)
            .arg(&request.script)
            .arg(&input_path)
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(Self {
            task_id: request.id,
            command,
            input,
            output,
            child: None,
            stderr_task: None,
        })
    }

    /// Launches the subprocess and begins collecting its stderr.
    pub fn start(&mut self) -> Result<(), ProcessError> {
        let mut child = self.command.spawn().map_err(ProcessError::Spawn)?;
        debug!(task_id = %self.task_id, pid = child.id(), "worker started");

        if let Some(mut stderr) = child.stderr.take() {
            self.stderr_task = Some(tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            }));
        }
        self.child = Some(child);
        Ok(())
    }

    /// Writes the task input, bounded; blocks until the worker attaches as
    /// reader. A worker that dies before opening the channel fails here.
    pub async fn write_input(&self, payload: &[u8], timeout: Duration) -> Result<(), ProcessError> {
        Ok(self.input.send(payload, timeout).await?)
    }

    /// Reads the task output, bounded; blocks until the worker has written
    /// and closed its end.
    pub async fn read_output(&self, timeout: Duration) -> Result<Vec<u8>, ProcessError> {
        Ok(self.output.recv(timeout).await?)
    }

    /// Awaits subprocess exit, bounded. Non-zero exit is an error.
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), ProcessError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let status = tokio::time::timeout(timeout, child.wait())
            .await
            .map_err(|_| ProcessError::ExitTimeout)?
            .map_err(ProcessError::Wait)?;
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::NonZeroExit {
                code: status.code().unwrap_or(-1),
            })
        }
    }

    /// Forcefully terminates the subprocess if it is still alive and reaps
    /// it. Idempotent; safe to call after a normal exit.
    pub async fn cancel(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                // Already exited; nothing to deliver.
                debug!(task_id = %self.task_id, error = %e, "kill skipped");
            }
            let _ = child.wait().await;
        }
    }

    /// Consumes and returns whatever the worker wrote to stderr.
    ///
    /// Call after the process has exited or been killed; collection is
    /// bounded so a leaked descriptor cannot stall the dispatcher.
    pub async fn stderr_output(&mut self) -> String {
        let Some(task) = self.stderr_task.take() else {
            return String::new();
        };
        match tokio::time::timeout(STDERR_DRAIN_BUDGET, task).await {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => String::new(),
            Err(_) => String::new(),
        }
    }

    /// Best-effort removal of both channel endpoints; never errors.
    pub fn teardown(&self) {
        self.input.cleanup();
        self.output.cleanup();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell_template(body: &str) -> CommandTemplate {
        CommandTemplate::new("sh").with_args(["-c", body])
    }

    fn request() -> TaskRequest {
        TaskRequest::new("shell", "echo", b"ping".to_vec())
    }

    #[tokio::test]
    async fn echo_worker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let template = shell_template(r#"cat <"$1" >"$2""#);
        let req = request();

        let mut process = WorkerProcess::setup(&template, &req, dir.path()).unwrap();
        process.start().unwrap();

        process
            .write_input(b"ping", Duration::from_secs(5))
            .await
            .unwrap();
        let output = process.read_output(Duration::from_secs(5)).await.unwrap();
        process.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(output, b"ping");
        process.teardown();
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let template = shell_template(r#"cat <"$1" >/dev/null; echo boom >&2; exit 7"#);
        let req = request();

        let mut process = WorkerProcess::setup(&template, &req, dir.path()).unwrap();
        process.start().unwrap();
        process
            .write_input(b"x", Duration::from_secs(5))
            .await
            .unwrap();

        let result = process.wait(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ProcessError::NonZeroExit { code: 7 })));
        let stderr = process.stderr_output().await;
        assert!(stderr.contains("boom"));
        process.teardown();
    }

    #[tokio::test]
    async fn dead_worker_fails_the_input_write() {
        let dir = tempfile::tempdir().unwrap();
        // Exits immediately without touching either channel.
        let template = shell_template("exit 1");
        let req = request();

        let mut process = WorkerProcess::setup(&template, &req, dir.path()).unwrap();
        process.start().unwrap();

        let result = process
            .write_input(b"x", Duration::from_millis(200))
            .await;
        assert!(matches!(
            result,
            Err(ProcessError::Channel(
                crate::worker::channel::ChannelError::PeerTimeout { .. }
            ))
        ));
        process.cancel().await;
        process.teardown();
    }

    #[tokio::test]
    async fn cancel_kills_a_sleeping_worker_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let template = shell_template(r#"cat <"$1" >/dev/null; sleep 30"#);
        let req = request();

        let mut process = WorkerProcess::setup(&template, &req, dir.path()).unwrap();
        process.start().unwrap();
        process
            .write_input(b"x", Duration::from_secs(5))
            .await
            .unwrap();

        process.cancel().await;
        process.cancel().await;

        // The process is gone; a bounded wait reports the signal exit.
        let result = process.wait(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProcessError::NonZeroExit { .. })));
        process.teardown();
    }

    #[tokio::test]
    async fn teardown_removes_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let template = shell_template("exit 0");
        let req = request();

        let process = WorkerProcess::setup(&template, &req, dir.path()).unwrap();
        process.teardown();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let template = CommandTemplate::new("/nonexistent/worker-binary");
        let req = request();

        let mut process = WorkerProcess::setup(&template, &req, dir.path()).unwrap();
        let result = process.start();
        assert!(matches!(result, Err(ProcessError::Spawn(_))));
        process.teardown();
    }
}
