//! Spawning workers from the ancestor.
//!
//! Flow, per spawn:
//! 1. Encode the init message, so an unsendable one fails before anything exists
//! 2. Create the worker's inbox socket pair and any stdio pipes
//! 3. Send a [`StartVmRequest`] with the worker-side descriptors to the supervisor
//! 4. Receive `{child_pid, errno}` and the child's pidfd
//! 5. Send the init message through the worker's address (the sync point)
//!
//! Once the request is written the spawn cannot be undone, so the exchange
//! runs in its own task. Dropping the future returned by
//! [`SupervisorClient::spawn`] only abandons the wait: the worker is still
//! created, and because its handles are dropped it fails at the sync point
//! and exits.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::{Pid, pipe2};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;

use crate::bridge::codec::encode;
use crate::bridge::protocol::{Message, StartVmReply, StartVmRequest, StdioAction};
use crate::bridge::transport::{MailboxAddress, SendError, TransportError, recv_ready, send_ready, seqpacket_pair};
use crate::supervisor::SupervisorHandle;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("clone failed: {0}")]
    Clone(Errno),
    #[error("supervisor channel failed: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("failed to deliver init message: {0}")]
    Init(#[from] SendError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("spawn task failed: {0}")]
    Task(String),
}

/// What to spawn. Built with `with_*` methods; defaults share stdio and
/// send a nil init message.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    clone_flags: u64,
    stdio: [StdioAction; 3],
    stderr_has_color: bool,
    pre_init_hook: bool,
    init_message: Message,
}

impl Default for SpawnRequest {
    fn default() -> Self {
        Self {
            clone_flags: 0,
            stdio: [StdioAction::ShareParent; 3],
            stderr_has_color: false,
            pre_init_hook: false,
            init_message: Message::nil(),
        }
    }
}

impl SpawnRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace and other `CLONE_*` flags. Include `CLONE_PARENT` to be
    /// able to [`SpawnedWorker::wait`] for the exit status.
    pub fn with_clone_flags(mut self, flags: CloneFlags) -> Self {
        self.clone_flags = flags.bits() as u32 as u64;
        self
    }

    /// Raw `clone3` flags, for those [`CloneFlags`] cannot express
    /// (`CLONE_NEWTIME`, `CLONE_CLEAR_SIGHAND`, `CLONE_INTO_CGROUP`).
    pub fn with_raw_clone_flags(mut self, flags: u64) -> Self {
        self.clone_flags = flags;
        self
    }

    pub fn with_stdin(mut self, action: StdioAction) -> Self {
        self.stdio[0] = action;
        self
    }

    pub fn with_stdout(mut self, action: StdioAction) -> Self {
        self.stdio[1] = action;
        self
    }

    pub fn with_stderr(mut self, action: StdioAction) -> Self {
        self.stdio[2] = action;
        self
    }

    pub fn with_stderr_color(mut self, color: bool) -> Self {
        self.stderr_has_color = color;
        self
    }

    pub fn with_pre_init_hook(mut self, enabled: bool) -> Self {
        self.pre_init_hook = enabled;
        self
    }

    pub fn with_init_message(mut self, message: impl Into<Message>) -> Self {
        self.init_message = message.into();
        self
    }

    fn header(&self) -> StartVmRequest {
        StartVmRequest {
            clone_flags: self.clone_flags,
            stdio: self.stdio,
            stderr_has_color: self.stderr_has_color,
            has_pre_init_hook: self.pre_init_hook,
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    /// Shell-style code: the exit status, or `128 + signal`.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + *signal as i32,
        }
    }

    pub fn success(&self) -> bool {
        *self == ExitStatus::Exited(0)
    }
}

fn exit_status(status: WaitStatus) -> Option<ExitStatus> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal)),
        _ => None,
    }
}

/// Handles to a freshly spawned worker.
#[derive(Debug)]
pub struct SpawnedWorker {
    pid: Pid,
    pidfd: OwnedFd,
    address: MailboxAddress,
    stdio: [Option<OwnedFd>; 3],
}

impl SpawnedWorker {
    /// PID as seen from the supervisor's namespace.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pidfd(&self) -> &OwnedFd {
        &self.pidfd
    }

    /// Address of the worker's inbox.
    pub fn address(&self) -> &MailboxAddress {
        &self.address
    }

    /// Our end of the stdin pipe, if one was requested.
    pub fn take_stdin(&mut self) -> Option<OwnedFd> {
        self.stdio[0].take()
    }

    pub fn take_stdout(&mut self) -> Option<OwnedFd> {
        self.stdio[1].take()
    }

    pub fn take_stderr(&mut self) -> Option<OwnedFd> {
        self.stdio[2].take()
    }

    pub fn kill(&self, signal: Signal) -> io::Result<()> {
        // SAFETY: pidfd_send_signal with a pidfd we own and no siginfo.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                self.pidfd.as_raw_fd(),
                signal as libc::c_int,
                std::ptr::null::<libc::siginfo_t>(),
                0 as libc::c_uint,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for the worker to exit.
    ///
    /// The status is only collectable by the worker's parent, so this needs
    /// the worker to have been spawned with `CLONE_PARENT`; otherwise the
    /// supervisor reaps it and this returns `ECHILD`.
    pub async fn wait(&self) -> io::Result<ExitStatus> {
        // SAFETY: the duplicate pidfd is owned by the AsyncFd.
        let pidfd = unsafe { AsyncFd::register_with_interest(self.pidfd.try_clone()?, Interest::READABLE) }?;
        // CLONE_PARENT children exit without a signal; only __WALL sees them.
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::__WALL;
        loop {
            let mut guard = pidfd.readable().await?;
            match waitid(Id::PIDFd(self.pidfd.as_fd()), flags) {
                Ok(status) => match exit_status(status) {
                    Some(status) => return Ok(status),
                    None => guard.clear_ready(),
                },
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }
}

struct ClientInner {
    ctrl: Mutex<AsyncFd<OwnedFd>>,
}

/// Ancestor-side client of a running supervisor. Cheap to clone.
#[derive(Clone)]
pub struct SupervisorClient {
    inner: Arc<ClientInner>,
    supervisor: Pid,
}

impl SupervisorClient {
    /// Wrap a started supervisor. Must be called inside a tokio runtime.
    pub fn new(handle: SupervisorHandle) -> io::Result<Self> {
        let SupervisorHandle { pid, ctrl } = handle;
        // SAFETY: the control socket is owned by the AsyncFd from here on.
        let ctrl = unsafe { AsyncFd::register(ctrl) }?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                ctrl: Mutex::new(ctrl),
            }),
            supervisor: pid,
        })
    }

    pub fn supervisor_pid(&self) -> Pid {
        self.supervisor
    }

    /// Spawn one worker and deliver its init message.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.exchange(request).await })
            .await
            .map_err(|e| SpawnError::Task(e.to_string()))?
    }

    /// Close the control socket and wait for the supervisor to exit.
    ///
    /// Other clones and in-flight spawns keep the socket open until they finish.
    pub async fn shutdown(self) -> io::Result<Option<ExitStatus>> {
        let SupervisorClient { inner, supervisor } = self;
        drop(inner);
        let status = tokio::task::spawn_blocking(move || loop {
            match waitpid(supervisor, None) {
                Err(Errno::EINTR) => continue,
                other => return other,
            }
        })
        .await
        .map_err(io::Error::other)??;
        tracing::info!(pid = supervisor.as_raw(), ?status, "Supervisor exited");
        Ok(exit_status(status))
    }
}

impl ClientInner {
    async fn exchange(&self, request: SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        let header = request.header();
        // Encoded before the request goes out: once cloned, a worker cannot be taken back.
        let init = encode(&request.init_message).map_err(SendError::from)?;
        let (local_inbox, worker_inbox) = seqpacket_pair()?;

        let mut ours: [Option<OwnedFd>; 3] = [None, None, None];
        let mut theirs = vec![worker_inbox];
        for (slot, action) in header.stdio.iter().enumerate() {
            if *action == StdioAction::Pipe {
                let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
                let (worker_end, our_end) = if slot == 0 { (read, write) } else { (write, read) };
                theirs.push(worker_end);
                ours[slot] = Some(our_end);
            }
        }

        let (reply, pidfd) = {
            let ctrl = self.ctrl.lock().await;
            let raw: Vec<RawFd> = theirs.iter().map(AsRawFd::as_raw_fd).collect();
            send_ready(&ctrl, &header.to_bytes(), &raw).await?;
            drop(theirs);

            let mut buf = [0u8; StartVmReply::SIZE];
            let (len, mut fds) = recv_ready(&ctrl, &mut buf, 1).await?;
            let reply = StartVmReply::from_bytes(&buf[..len])
                .ok_or_else(|| SpawnError::Protocol(format!("reply of {len} bytes")))?;
            (reply, fds.take_next())
        };

        if reply.errno != 0 {
            tracing::warn!(errno = reply.errno, "Supervisor could not clone worker");
            return Err(SpawnError::Clone(Errno::from_raw(reply.errno)));
        }
        let pidfd = pidfd.ok_or_else(|| SpawnError::Protocol("reply carried no pidfd".into()))?;

        let address = MailboxAddress::from_fd(local_inbox);
        address.send_encoded(init).await?;
        tracing::debug!(pid = reply.child_pid, "Worker spawned");

        Ok(SpawnedWorker {
            pid: Pid::from_raw(reply.child_pid),
            pidfd,
            address,
            stdio: ours,
        })
    }
}
