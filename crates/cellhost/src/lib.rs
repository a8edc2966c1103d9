//! cellhost: a sandboxed multi-process host built on Linux namespaces.
//!
//! An ancestor process forks a [`Supervisor`] early, then asks it through a
//! [`SupervisorClient`] to clone workers into fresh namespaces. Every process
//! owns a [`Mailbox`]; messages are small NaN-boxed values that can carry
//! strings, file descriptors and other mailbox addresses.

#[cfg(not(target_os = "linux"))]
compile_error!("cellhost requires Linux (clone3, pidfd, SCM_RIGHTS)");

pub mod bridge;
pub mod config;
pub mod fd_lock;
mod fd_redirect;
pub mod logging;
pub mod mailbox;
pub mod spawn;
pub mod supervisor;
pub mod worker;

pub use bridge::codec::{EncodeError, MalformedMessage};
pub use bridge::protocol::{Message, StdioAction, Value};
pub use bridge::transport::{MailboxAddress, SendError, TransportError};
pub use config::HostConfig;
pub use fd_lock::{FdBox, FdError};
pub use logging::init_tracing;
pub use mailbox::{Delivery, Mailbox};
pub use spawn::{ExitStatus, SpawnError, SpawnRequest, SpawnedWorker, SupervisorClient};
pub use supervisor::{Supervisor, SupervisorError, SupervisorHandle};
pub use worker::hook::{HookArena, PreInitHook};
pub use worker::{BootstrapError, Worker, WorkerEntry};
