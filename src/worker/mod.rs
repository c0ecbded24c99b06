//! Worker side of the engine.
//!
//! - [`dispatcher`] - bounded pool of request consumers
//! - [`process`] - one task's subprocess and channel pair
//! - [`channel`] - byte-channel abstraction + named-pipe implementation
//! - [`scripts`] - family → command routing, loadable from TOML

pub mod channel;
pub mod dispatcher;
pub mod process;
pub mod scripts;

pub use channel::{ByteChannel, ChannelError};
#[cfg(unix)]
pub use channel::FifoChannel;
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle};
pub use process::{ProcessError, WorkerProcess};
pub use scripts::{CommandTemplate, ScriptRegistry};
