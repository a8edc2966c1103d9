//! Worker bootstrap - runs in the freshly cloned child.
//!
//! Order matters; each step assumes the previous ones:
//! 1. Lay out descriptors: stdio per request, inbox at fd 3, nothing else
//! 2. Reset every signal disposition and unblock the mask
//! 3. Ask for a parent-death signal (best effort)
//! 4. Block on the inbox for the init message (the sync point with the ancestor)
//! 5. Shut down the inbox's write side
//! 6. Run the pre-init hook, if requested
//! 7. As PID 1 of a new namespace, fork once more and stay behind as init
//!
//! Any failure exits the worker with status 1.

pub mod hook;
pub(crate) mod init;

use std::future::Future;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask};
use nix::sys::socket::{MsgFlags, Shutdown, shutdown};
use nix::unistd::{Pid, getpid};

use self::hook::{HookError, PreInitHook, run_pre_init_hook};
use crate::bridge::codec::MalformedMessage;
use crate::bridge::protocol::{Message, StartVmRequest};
use crate::bridge::transport::{TransportError, recv_datagram};
use crate::config::HostConfig;
use crate::fd_redirect::{FdSetupError, install_worker_fds};
use crate::mailbox::Mailbox;

pub use self::init::FORWARDED_SIGNALS;

/// Entry point run in every worker once bootstrap completed.
/// The return value becomes the worker's exit status.
pub type WorkerEntry = fn(Worker) -> i32;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("descriptor setup: {0}")]
    Descriptors(#[from] FdSetupError),
    #[error("{step} failed: {source}")]
    Sys { step: &'static str, source: Errno },
    #[error("waiting for init message: {0}")]
    SyncPoint(#[from] TransportError),
    #[error("init message is malformed: {0}")]
    InitMessage(#[from] MalformedMessage),
    #[error("pre-init hook requested but none is registered")]
    MissingHook,
    #[error(transparent)]
    Hook(#[from] HookError),
}

fn sys(step: &'static str) -> impl FnOnce(Errno) -> BootstrapError {
    move |source| BootstrapError::Sys { step, source }
}

/// Everything a cloned child needs, captured by the supervisor before clone.
pub struct SpawnContext<'a> {
    pub(crate) request: StartVmRequest,
    pub(crate) inbox: OwnedFd,
    pub(crate) stdio: [Option<OwnedFd>; 3],
    pub(crate) config: &'a HostConfig,
    pub(crate) hook: Option<&'a dyn PreInitHook>,
}

/// A bootstrapped worker, handed to the entry point.
#[derive(Debug)]
pub struct Worker {
    inbox: OwnedFd,
    init: Message,
    stderr_has_color: bool,
    config: HostConfig,
}

impl Worker {
    pub fn init_message(&self) -> &Message {
        &self.init
    }

    /// Whether the ancestor's stderr supports color.
    pub fn stderr_has_color(&self) -> bool {
        self.stderr_has_color
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The inbox socket and init message, for entry points that bring their own runtime.
    pub fn into_parts(self) -> (OwnedFd, Message) {
        (self.inbox, self.init)
    }

    /// Build a current-thread runtime, wrap the inbox in a [`Mailbox`] and
    /// run `f` to completion. Returns `f`'s exit status.
    ///
    /// The runtime has no signal driver: tokio keeps that one in
    /// process-global state, and the descriptors behind it were inherited
    /// from the supervisor and closed during bootstrap.
    pub fn run<F, Fut>(self, f: F) -> i32
    where
        F: FnOnce(Mailbox, Message) -> Fut,
        Fut: Future<Output = i32>,
    {
        let Worker {
            inbox,
            init,
            config,
            ..
        } = self;
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::error!(%error, "Failed to build worker runtime");
                return 1;
            }
        };
        runtime.block_on(async move {
            let mailbox = Mailbox::new(&config);
            if let Err(error) = mailbox.adopt(inbox) {
                tracing::error!(%error, "Failed to attach inbox");
                return 1;
            }
            f(mailbox, init).await
        })
    }
}

/// Bootstrap and run `entry`. Never fails; errors become exit status 1.
pub(crate) fn run(context: SpawnContext<'_>, entry: WorkerEntry) -> i32 {
    match bootstrap(context) {
        Ok(worker) => entry(worker),
        Err(error) => {
            tracing::error!(%error, "Worker bootstrap failed");
            1
        }
    }
}

pub(crate) fn bootstrap(context: SpawnContext<'_>) -> Result<Worker, BootstrapError> {
    let SpawnContext {
        request,
        inbox,
        stdio,
        config,
        hook,
    } = context;

    let inbox = install_worker_fds(request.stdio, stdio, inbox)?;
    reset_signals()?;

    if let Some(signal) = config.parent_death_signal
        && let Err(error) = nix::sys::prctl::set_pdeathsig(signal)
    {
        tracing::debug!(%error, "Parent-death signal unavailable");
    }

    let init = wait_for_init(&inbox, config.fd_limit())?;
    shutdown(inbox.as_raw_fd(), Shutdown::Write).map_err(sys("shutdown(SHUT_WR)"))?;

    if request.has_pre_init_hook {
        let hook = hook.ok_or(BootstrapError::MissingHook)?;
        run_pre_init_hook(hook, &init, config.hook_arena_limit)?;
    }

    if getpid() == Pid::from_raw(1) {
        tracing::debug!("Running as PID 1, splitting off init");
        init::become_init().map_err(sys("fork(init)"))?;
    }

    Ok(Worker {
        inbox,
        init,
        stderr_has_color: request.stderr_has_color,
        config: config.clone(),
    })
}

fn reset_signals() -> Result<(), BootstrapError> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in Signal::iterator() {
        if matches!(signal, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        // SAFETY: installing SIG_DFL runs no code in this process.
        unsafe { sigaction(signal, &default) }.map_err(sys("sigaction"))?;
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None).map_err(sys("sigprocmask"))?;
    Ok(())
}

/// Block for the first datagram on the inbox and decode it.
fn wait_for_init(inbox: &OwnedFd, max_fds: usize) -> Result<Message, BootstrapError> {
    let datagram = recv_datagram(inbox.as_fd(), max_fds, MsgFlags::empty())?;
    let (message, unclaimed) = datagram.decode();
    if unclaimed > 0 {
        tracing::debug!(unclaimed, "Closed descriptors the init message did not reference");
    }
    Ok(message?)
}
