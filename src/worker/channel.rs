//! Byte channels between the dispatcher and a worker subprocess.
//!
//! Payload data never travels the worker's standard streams; each task gets
//! a pair of single-use channels, created before spawn and handed to the
//! subprocess as filesystem paths. The [`ByteChannel`] trait keeps the
//! transport swappable per platform; [`FifoChannel`] is the POSIX named
//! pipe implementation.
//!
//! The protocol is strictly one record per channel: the sender writes the
//! payload plus a trailing newline terminator and closes; the receiver
//! reads until the writer's end closes and strips the terminator. A
//! conforming writer therefore always produces at least one byte, which is
//! what lets the receiver tell "writer finished" from "writer not yet
//! attached".

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

/// Record terminator appended on send and stripped on recv.
pub const RECORD_TERMINATOR: u8 = b'\n';

/// Errors raised by channel setup and transfer.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel endpoint could not be created.
    #[error("failed to create channel at {path}: {source}")]
    Create {
        /// Endpoint path.
        path: std::path::PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The peer never attached (or never finished) within the budget.
    #[error("timed out waiting for peer on {path}")]
    PeerTimeout {
        /// Endpoint path.
        path: std::path::PathBuf,
    },

    /// Transfer failed mid-flight.
    #[error("i/o failure on {path}: {source}")]
    Io {
        /// Endpoint path.
        path: std::path::PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },
}

/// One single-use, directional byte channel to a worker subprocess.
///
/// `endpoint()` is the path the subprocess receives as an argument. Both
/// transfer operations are bounded: they resolve with
/// [`ChannelError::PeerTimeout`] if the peer does not attach (and finish)
/// in time.
#[async_trait]
pub trait ByteChannel: Send + Sync {
    /// Filesystem path handed to the subprocess.
    fn endpoint(&self) -> &Path;

    /// Writes exactly one payload record, blocking until a reader attaches.
    async fn send(&self, payload: &[u8], timeout: Duration) -> Result<(), ChannelError>;

    /// Reads exactly one payload record, blocking until the writer closes.
    async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError>;

    /// Best-effort removal of the endpoint; never errors.
    fn cleanup(&self);
}

#[cfg(unix)]
pub use fifo::FifoChannel;

#[cfg(unix)]
mod fifo {
    use std::fs::OpenOptions;
    use std::io::{ErrorKind, Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use async_trait::async_trait;
    use nix::sys::stat::Mode;
    use tokio::time::{sleep, Instant};

    use super::{ByteChannel, ChannelError, RECORD_TERMINATOR};

    /// Poll interval while waiting for the peer to attach or drain.
    const POLL_INTERVAL: Duration = Duration::from_millis(10);

    /// Named-pipe [`ByteChannel`].
    ///
    /// The FIFO is created at construction with owner-only permissions.
    /// All opens are non-blocking: the write side retries on `ENXIO` until
    /// a reader appears, the read side polls until the writer has attached,
    /// written and closed. No thread is ever parked in a blocking `open`,
    /// so a timed-out transfer leaks nothing.
    #[derive(Debug)]
    pub struct FifoChannel {
        path: PathBuf,
    }

    impl FifoChannel {
        /// Creates the FIFO at `path`.
        pub fn create(path: impl Into<PathBuf>) -> Result<Self, ChannelError> {
            let path = path.into();
            nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|errno| {
                ChannelError::Create {
                    path: path.clone(),
                    source: errno.into(),
                }
            })?;
            Ok(Self { path })
        }

        fn io_error(&self, source: std::io::Error) -> ChannelError {
            ChannelError::Io {
                path: self.path.clone(),
                source,
            }
        }

        fn peer_timeout(&self) -> ChannelError {
            ChannelError::PeerTimeout {
                path: self.path.clone(),
            }
        }
    }

    #[async_trait]
    impl ByteChannel for FifoChannel {
        fn endpoint(&self) -> &Path {
            &self.path
        }

        async fn send(&self, payload: &[u8], timeout: Duration) -> Result<(), ChannelError> {
            let deadline = Instant::now() + timeout;

            // ENXIO until some process has the FIFO open (or pending open)
            // for reading.
            let mut file = loop {
                match OpenOptions::new()
                    .write(true)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(&self.path)
                {
                    Ok(file) => break file,
                    Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                        if Instant::now() >= deadline {
                            return Err(self.peer_timeout());
                        }
                        sleep(POLL_INTERVAL).await;
                    },
                    Err(e) => return Err(self.io_error(e)),
                }
            };

            let mut record = Vec::with_capacity(payload.len() + 1);
            record.extend_from_slice(payload);
            record.push(RECORD_TERMINATOR);

            let mut written = 0;
            while written < record.len() {
                match file.write(&record[written..]) {
                    Ok(0) => {
                        return Err(self.io_error(ErrorKind::WriteZero.into()));
                    },
                    Ok(n) => written += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        // Pipe buffer full; wait for the reader to drain.
                        if Instant::now() >= deadline {
                            return Err(self.peer_timeout());
                        }
                        sleep(POLL_INTERVAL).await;
                    },
                    Err(e) if e.kind() == ErrorKind::Interrupted => {},
                    Err(e) => return Err(self.io_error(e)),
                }
            }
            Ok(())
        }

        async fn recv(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
            let deadline = Instant::now() + timeout;

            // A non-blocking read open succeeds with or without a writer.
            let mut file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path)
                .map_err(|e| self.io_error(e))?;

            let mut data = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                match file.read(&mut chunk) {
                    Ok(0) => {
                        // Zero reads both before a writer attaches and after
                        // it closes; data on hand disambiguates (the record
                        // terminator guarantees a non-empty record).
                        if !data.is_empty() {
                            break;
                        }
                        if Instant::now() >= deadline {
                            return Err(self.peer_timeout());
                        }
                        sleep(POLL_INTERVAL).await;
                    },
                    Ok(n) => data.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        // Writer attached but nothing buffered yet.
                        if Instant::now() >= deadline {
                            return Err(self.peer_timeout());
                        }
                        sleep(POLL_INTERVAL).await;
                    },
                    Err(e) if e.kind() == ErrorKind::Interrupted => {},
                    Err(e) => return Err(self.io_error(e)),
                }
            }

            if data.last() == Some(&RECORD_TERMINATOR) {
                data.pop();
            }
            Ok(data)
        }

        fn cleanup(&self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn fifo_in(dir: &tempfile::TempDir, name: &str) -> Arc<FifoChannel> {
        Arc::new(FifoChannel::create(dir.path().join(name)).expect("mkfifo"))
    }

    #[tokio::test]
    async fn one_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_in(&dir, "rt.fifo");

        let sender = Arc::clone(&channel);
        let writer =
            tokio::spawn(
                async move { sender.send(b"payload", Duration::from_secs(5)).await },
            );

        let received = channel.recv(Duration::from_secs(5)).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(received, b"payload");
    }

    #[tokio::test]
    async fn empty_payload_still_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_in(&dir, "empty.fifo");

        let sender = Arc::clone(&channel);
        let writer =
            tokio::spawn(async move { sender.send(b"", Duration::from_secs(5)).await });

        let received = channel.recv(Duration::from_secs(5)).await.unwrap();
        writer.await.unwrap().unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn large_payload_crosses_the_pipe_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_in(&dir, "large.fifo");
        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

        let sender = Arc::clone(&channel);
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            sender.send(&expected, Duration::from_secs(10)).await
        });

        let received = channel.recv(Duration::from_secs(10)).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn send_times_out_without_a_reader() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_in(&dir, "noreader.fifo");

        let result = channel.send(b"x", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ChannelError::PeerTimeout { .. })));
    }

    #[tokio::test]
    async fn recv_times_out_without_a_writer() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_in(&dir, "nowriter.fifo");

        let result = channel.recv(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ChannelError::PeerTimeout { .. })));
    }

    #[tokio::test]
    async fn cleanup_removes_the_endpoint_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let channel = fifo_in(&dir, "gone.fifo");
        assert!(channel.endpoint().exists());

        channel.cleanup();
        assert!(!channel.endpoint().exists());
        channel.cleanup();
    }

    #[test]
    fn create_fails_on_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.fifo");
        let _first = FifoChannel::create(&path).unwrap();
        let second = FifoChannel::create(&path);
        assert!(matches!(second, Err(ChannelError::Create { .. })));
    }
}
