//! Supervisor process - clones sandboxed workers for the ancestor.
//!
//! The supervisor is forked from the ancestor early, while it is still
//! single-threaded, and serves spawn requests for the rest of its life:
//!
//! 1. Receive memory regions to zero (ancestor secrets), until a null entry
//! 2. Close every descriptor except stdio and the control socket
//! 3. Loop: receive a [`StartVmRequest`] plus descriptors, `clone3()`,
//!    reply `{child_pid, errno}` plus the child's pidfd
//! 4. When the ancestor closes the control socket, reap every child and exit
//!
//! A failed clone is reported as an errno and never ends the loop.

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::MsgFlags;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::fcntl::OFlag;
use nix::unistd::{ForkResult, Pid, dup3_raw, fork};

use crate::bridge::codec::ReceivedFds;
use crate::bridge::protocol::{ScrubRequest, StartVmReply, StartVmRequest, StdioAction};
use crate::bridge::transport::{TransportError, recv_with_fds, send_with_fds, seqpacket_pair};
use crate::config::HostConfig;
use crate::fd_redirect::close_from;
use crate::worker::hook::PreInitHook;
use crate::worker::{self, SpawnContext, WorkerEntry};

/// Control socket number inside the supervisor.
const CONTROL_FD: RawFd = 3;

/// Descriptors a spawn request may carry: inbox plus three stdio pipes.
const MAX_REQUEST_FDS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("creating control socket: {0}")]
    Socket(#[from] io::Error),
    #[error("fork failed: {0}")]
    Fork(Errno),
    #[error("sending scrub list: {0}")]
    Scrub(#[from] TransportError),
}

/// Ancestor-side handle to a running supervisor.
#[derive(Debug)]
pub struct SupervisorHandle {
    pub(crate) pid: Pid,
    pub(crate) ctrl: OwnedFd,
}

impl SupervisorHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

pub struct Supervisor {
    entry: WorkerEntry,
    config: HostConfig,
    hook: Option<Box<dyn PreInitHook>>,
}

impl Supervisor {
    pub fn new(entry: WorkerEntry) -> Self {
        Self {
            entry,
            config: HostConfig::default(),
            hook: None,
        }
    }

    pub fn with_config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// Hook run by workers spawned with the pre-init flag.
    pub fn with_pre_init_hook(mut self, hook: impl PreInitHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Fork the supervisor.
    ///
    /// Call this before the ancestor starts threads or a tokio runtime: the
    /// supervisor and every worker inherit the memory image at this point.
    /// `scrub` lists buffers the supervisor zeroes in its own copy before
    /// serving; the ancestor's buffers are untouched.
    pub fn start<'a>(
        self,
        scrub: impl IntoIterator<Item = &'a mut [u8]>,
    ) -> Result<SupervisorHandle, SupervisorError> {
        let (ctrl, ctrl_child) = seqpacket_pair()?;
        let (scrub_tx, scrub_rx) = seqpacket_pair()?;

        // SAFETY: the child only makes syscalls until it enters the serve loop,
        // and documented callers are still single-threaded here.
        match unsafe { fork() }.map_err(SupervisorError::Fork)? {
            ForkResult::Child => {
                drop(ctrl);
                drop(scrub_tx);
                let code = self.serve(ctrl_child, scrub_rx);
                std::process::exit(code)
            }
            ForkResult::Parent { child } => {
                drop(ctrl_child);
                drop(scrub_rx);
                for region in scrub {
                    let request = ScrubRequest {
                        ptr: region.as_mut_ptr() as usize,
                        len: region.len(),
                    };
                    if !request.is_end() {
                        send_with_fds(scrub_tx.as_fd(), &request.to_bytes(), &[], MsgFlags::empty())?;
                    }
                }
                send_with_fds(scrub_tx.as_fd(), &ScrubRequest::END.to_bytes(), &[], MsgFlags::empty())?;
                tracing::info!(pid = child.as_raw(), "Supervisor started");
                Ok(SupervisorHandle { pid: child, ctrl })
            }
        }
    }

    fn serve(self, ctrl: OwnedFd, scrub: OwnedFd) -> i32 {
        if let Err(error) = receive_scrub_list(&scrub) {
            tracing::error!(%error, "Scrub list incomplete");
            return 1;
        }
        drop(scrub);

        let ctrl = match isolate_control_socket(ctrl) {
            Ok(ctrl) => ctrl,
            Err(error) => {
                tracing::error!(%error, "Failed to isolate control socket");
                return 1;
            }
        };
        self.run(&ctrl);
        reap_all();
        0
    }

    fn run(&self, ctrl: &OwnedFd) {
        tracing::debug!("Supervisor serving spawn requests");
        loop {
            let incoming = match next_request(ctrl) {
                Ok(Some(incoming)) => incoming,
                Ok(None) => {
                    tracing::debug!("Ancestor closed control socket");
                    return;
                }
                Err(error) => {
                    tracing::error!(%error, "Control socket failed");
                    return;
                }
            };

            let (reply, pidfd) = match incoming {
                Incoming::Spawn(request, fds) => self.spawn_worker(request, fds),
                Incoming::Invalid => (
                    StartVmReply {
                        child_pid: 0,
                        errno: Errno::EINVAL as i32,
                    },
                    None,
                ),
            };

            let fds: Vec<RawFd> = pidfd.iter().map(AsRawFd::as_raw_fd).collect();
            if let Err(error) = send_with_fds(ctrl.as_fd(), &reply.to_bytes(), &fds, MsgFlags::empty()) {
                tracing::error!(%error, "Failed to reply to ancestor");
                return;
            }
            drop(pidfd);
            reap_exited();
        }
    }

    fn spawn_worker(&self, request: StartVmRequest, mut fds: ReceivedFds) -> (StartVmReply, Option<OwnedFd>) {
        let failed = |errno: Errno| StartVmReply {
            child_pid: 0,
            errno: errno as i32,
        };
        let Some(inbox) = fds.take_next() else {
            return (failed(Errno::EINVAL), None);
        };
        let mut stdio: [Option<OwnedFd>; 3] = [None, None, None];
        for (slot, action) in request.stdio.iter().enumerate() {
            if *action == StdioAction::Pipe {
                stdio[slot] = fds.take_next();
            }
        }
        let context = SpawnContext {
            request,
            inbox,
            stdio,
            config: &self.config,
            hook: self.hook.as_deref(),
        };

        match clone_with_pidfd(request.clone_flags) {
            Ok(Cloned::Child) => {
                let code = worker::run(context, self.entry);
                std::process::exit(code)
            }
            Ok(Cloned::Parent { pid, pidfd }) => {
                // Local copies of the inbox and pipe ends close here.
                drop(context);
                tracing::debug!(pid = pid.as_raw(), "Worker cloned");
                (
                    StartVmReply {
                        child_pid: pid.as_raw(),
                        errno: 0,
                    },
                    Some(pidfd),
                )
            }
            Err(errno) => {
                tracing::warn!(%errno, flags = request.clone_flags, "clone3 failed");
                (failed(errno), None)
            }
        }
    }
}

enum Incoming {
    Spawn(StartVmRequest, ReceivedFds),
    Invalid,
}

/// Read one request. `Ok(None)` means the ancestor is gone.
fn next_request(ctrl: &OwnedFd) -> Result<Option<Incoming>, TransportError> {
    let mut buf = [0u8; StartVmRequest::SIZE];
    match recv_with_fds(ctrl.as_fd(), &mut buf, MAX_REQUEST_FDS, MsgFlags::empty()) {
        Ok((len, fds)) => {
            let request = StartVmRequest::from_bytes(&buf[..len]).filter(|r| r.expected_fds() == fds.len());
            Ok(Some(match request {
                Some(request) => Incoming::Spawn(request, fds),
                None => {
                    tracing::warn!(len, fds = fds.len(), "Rejecting malformed spawn request");
                    Incoming::Invalid
                }
            }))
        }
        Err(TransportError::Closed) => Ok(None),
        Err(TransportError::Truncated | TransportError::TooManyDescriptors { .. }) => Ok(Some(Incoming::Invalid)),
        Err(error) => Err(error),
    }
}

fn receive_scrub_list(scrub: &OwnedFd) -> Result<(), TransportError> {
    let mut buf = [0u8; ScrubRequest::SIZE];
    let mut regions = 0usize;
    loop {
        let (len, _) = recv_with_fds(scrub.as_fd(), &mut buf, 0, MsgFlags::empty())?;
        let Some(request) = ScrubRequest::from_bytes(&buf[..len]) else {
            return Err(TransportError::Truncated);
        };
        if request.is_end() {
            tracing::debug!(regions, "Scrubbed ancestor memory");
            return Ok(());
        }
        // SAFETY: the ancestor sent these from `&mut [u8]` borrows taken just
        // before fork, so this process holds a private, writable copy.
        unsafe { zero_region(request.ptr as *mut u8, request.len) };
        regions += 1;
    }
}

unsafe fn zero_region(ptr: *mut u8, len: usize) {
    for i in 0..len {
        // SAFETY: forwarded from the caller.
        unsafe { ptr.add(i).write_volatile(0) };
    }
}

/// Move the control socket to [`CONTROL_FD`] and close everything above it.
fn isolate_control_socket(ctrl: OwnedFd) -> io::Result<OwnedFd> {
    let ctrl = if ctrl.as_raw_fd() == CONTROL_FD {
        ctrl
    } else {
        // SAFETY: whatever sat at CONTROL_FD is not owned by anything in the
        // supervisor; the old number closes when `ctrl` drops.
        unsafe { dup3_raw(&ctrl, CONTROL_FD, OFlag::O_CLOEXEC) }?
    };
    close_from(CONTROL_FD + 1).map_err(io::Error::other)?;
    Ok(ctrl)
}

/// `struct clone_args` from linux/sched.h.
#[repr(C)]
#[derive(Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

enum Cloned {
    Child,
    Parent { pid: Pid, pidfd: OwnedFd },
}

/// Caller flags as passed to `clone3()`: the legacy exit-signal byte is
/// dropped (except `CLONE_NEWTIME`, which lives there) and a pidfd requested.
fn clone3_flags(flags: u64) -> u64 {
    let signal_bits = (libc::CSIGNAL & !libc::CLONE_NEWTIME) as u64;
    (flags & !signal_bits) | libc::CLONE_PIDFD as u64
}

/// SIGCHLD, except where the kernel requires none: a `CLONE_PARENT` or
/// `CLONE_THREAD` child reports to someone else.
fn exit_signal(flags: u64) -> u64 {
    if flags & (libc::CLONE_PARENT | libc::CLONE_THREAD) as u64 != 0 {
        0
    } else {
        libc::SIGCHLD as u64
    }
}

/// `clone3()` with a pidfd, fork-style (no new stack).
fn clone_with_pidfd(flags: u64) -> Result<Cloned, Errno> {
    let mut pidfd: RawFd = -1;
    let mut args = CloneArgs {
        flags: clone3_flags(flags),
        pidfd: &mut pidfd as *mut RawFd as u64,
        exit_signal: exit_signal(flags),
        ..Default::default()
    };
    // SAFETY: args outlives the call; without CLONE_VM the child gets its own
    // copy of this stack frame and continues like after fork().
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut args as *mut CloneArgs,
            size_of::<CloneArgs>(),
        )
    };
    match ret {
        -1 => Err(Errno::last()),
        0 => Ok(Cloned::Child),
        pid => Ok(Cloned::Parent {
            pid: Pid::from_raw(pid as i32),
            // SAFETY: CLONE_PIDFD stored a fresh descriptor owned by us.
            pidfd: unsafe { OwnedFd::from_raw_fd(pidfd) },
        }),
    }
}

/// Collect already-exited children without blocking.
fn reap_exited() {
    loop {
        match waitid(Id::All, WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return,
            Ok(status) => tracing::debug!(?status, "Reaped worker"),
            Err(Errno::EINTR) => continue,
            Err(error) => {
                tracing::warn!(%error, "waitid failed");
                return;
            }
        }
    }
}

/// Wait for every remaining child.
fn reap_all() {
    loop {
        match waitid(Id::All, WaitPidFlag::WEXITED) {
            Ok(status) => tracing::debug!(?status, "Reaped worker"),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return,
            Err(error) => {
                tracing::warn!(%error, "waitid failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_args_match_kernel_layout() {
        // CLONE_ARGS_SIZE_VER2
        assert_eq!(size_of::<CloneArgs>(), 88);
    }

    #[test]
    fn caller_flags_are_relayed() {
        let newtime = libc::CLONE_NEWTIME as u64;
        let ns = (libc::CLONE_NEWPID | libc::CLONE_NEWNS) as u64;
        let pidfd = libc::CLONE_PIDFD as u64;
        assert_eq!(clone3_flags(ns | newtime), ns | newtime | pidfd);
        // Legacy exit-signal numbers in the low byte are not flags.
        assert_eq!(clone3_flags(ns | libc::SIGUSR1 as u64), ns | pidfd);
        assert_eq!(clone3_flags(1 << 32), (1 << 32) | pidfd);
    }

    #[test]
    fn exit_signal_follows_parentage() {
        assert_eq!(exit_signal(libc::CLONE_NEWPID as u64), libc::SIGCHLD as u64);
        assert_eq!(exit_signal(libc::CLONE_PARENT as u64), 0);
        assert_eq!(exit_signal(libc::CLONE_THREAD as u64), 0);
    }

    #[test]
    fn clone_parent_child_reports_to_grandparent() {
        // Runs in a throwaway process so the clone is that process's child,
        // not one of the test harness.
        let code = match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = (|| {
                    let relay = match unsafe { fork() } {
                        Ok(ForkResult::Child) => {
                            let code = match clone_with_pidfd(libc::CLONE_PARENT as u64) {
                                Ok(Cloned::Child) => 7,
                                Ok(Cloned::Parent { .. }) => 0,
                                Err(_) => 20,
                            };
                            unsafe { libc::_exit(code) }
                        }
                        Ok(ForkResult::Parent { child }) => child,
                        Err(_) => return 21,
                    };
                    if !matches!(nix::sys::wait::waitpid(relay, None), Ok(WaitStatus::Exited(_, 0))) {
                        return 22;
                    }
                    // The clone exits without a signal; only __WALL finds it.
                    match waitid(Id::All, WaitPidFlag::WEXITED | WaitPidFlag::__WALL) {
                        Ok(WaitStatus::Exited(_, 7)) => 0,
                        _ => 23,
                    }
                })();
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => match nix::sys::wait::waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, code) => code,
                other => panic!("helper ended unexpectedly: {other:?}"),
            },
        };
        assert_eq!(code, 0);
    }

    #[test]
    fn scrub_zeroes_regions() {
        let mut secret = *b"swordfish";
        unsafe { zero_region(secret.as_mut_ptr(), secret.len()) };
        assert_eq!(secret, [0u8; 9]);
    }

    #[test]
    fn malformed_requests_are_invalid_not_fatal() {
        let (ctrl, peer) = seqpacket_pair().unwrap();

        // Short record.
        send_with_fds(peer.as_fd(), &[1, 2, 3], &[], MsgFlags::empty()).unwrap();
        assert!(matches!(next_request(&ctrl), Ok(Some(Incoming::Invalid))));

        // Valid record but missing the inbox descriptor.
        let request = StartVmRequest {
            clone_flags: 0,
            stdio: [StdioAction::ShareParent; 3],
            stderr_has_color: false,
            has_pre_init_hook: false,
        };
        send_with_fds(peer.as_fd(), &request.to_bytes(), &[], MsgFlags::empty()).unwrap();
        assert!(matches!(next_request(&ctrl), Ok(Some(Incoming::Invalid))));

        // Correct record and descriptor count.
        let (inbox, _keep) = seqpacket_pair().unwrap();
        send_with_fds(peer.as_fd(), &request.to_bytes(), &[inbox.as_raw_fd()], MsgFlags::empty()).unwrap();
        match next_request(&ctrl) {
            Ok(Some(Incoming::Spawn(got, fds))) => {
                assert_eq!(got, request);
                assert_eq!(fds.len(), 1);
            }
            _ => panic!("expected a spawn request"),
        }

        drop(peer);
        assert!(matches!(next_request(&ctrl), Ok(None)));
    }
}
