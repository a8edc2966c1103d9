//! Descriptor layout for a freshly cloned worker.
//!
//! The worker starts with a copy of the supervisor's table plus the
//! descriptors from its spawn request, at arbitrary numbers. Afterwards the
//! table holds exactly:
//! - 0/1/2: the requested stdio (pipe end, inherited, or closed)
//! - 3: the inbox socket, close-on-exec
//!
//! ## Safety contracts
//!
//! The `unsafe` blocks here rely on:
//! 1. Running in a single-threaded process right after clone, before any
//!    runtime or library opens descriptors of its own
//! 2. Every parked descriptor being owned by this module until it is either
//!    installed or closed by [`close_from`]

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::unistd::{close, dup2_stderr, dup2_stdin, dup2_stdout, dup3_raw};

use crate::bridge::protocol::StdioAction;
use crate::config::INBOX_FD;

/// Descriptors are parked at or above this number while slots 0..=3 are rebuilt.
const PARKING_FLOOR: RawFd = 10;

#[derive(Debug, thiserror::Error)]
#[error("{step} failed: {source}")]
pub struct FdSetupError {
    step: &'static str,
    source: Errno,
}

fn step(step: &'static str) -> impl FnOnce(Errno) -> FdSetupError {
    move |source| FdSetupError { step, source }
}

/// Move `fd` to a free number >= [`PARKING_FLOOR`], closing the original.
fn park(fd: OwnedFd) -> Result<OwnedFd, FdSetupError> {
    let raw = fcntl(fd.as_fd(), FcntlArg::F_DUPFD_CLOEXEC(PARKING_FLOOR)).map_err(step("fcntl(F_DUPFD_CLOEXEC)"))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor nobody else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn io_errno(error: &std::io::Error) -> Errno {
    error.raw_os_error().map_or(Errno::EIO, Errno::from_raw)
}

/// Close every descriptor numbered `first` or higher.
pub(crate) fn close_from(first: RawFd) -> Result<(), FdSetupError> {
    // SAFETY: close_range only closes descriptors; callers own everything >= first.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            libc::c_uint::MAX,
            0 as libc::c_uint,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    match Errno::last() {
        Errno::ENOSYS => {}
        errno => return Err(step("close_range")(errno)),
    }

    // Pre-5.9 kernels: walk /proc/self/fd instead.
    let entries = std::fs::read_dir("/proc/self/fd")
        .map_err(|e| step("read_dir(/proc/self/fd)")(io_errno(&e)))?;
    let open: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .filter(|fd| *fd >= first)
        .collect();
    for fd in open {
        // EBADF for the read_dir handle itself is expected.
        let _ = close(fd);
    }
    Ok(())
}

/// Lay out stdio and the inbox. `pipes[i]` must be `Some` exactly when
/// `actions[i]` is [`StdioAction::Pipe`].
///
/// Returns the inbox, now at [`INBOX_FD`]. Everything above it is closed.
pub(crate) fn install_worker_fds(
    actions: [StdioAction; 3],
    pipes: [Option<OwnedFd>; 3],
    inbox: OwnedFd,
) -> Result<OwnedFd, FdSetupError> {
    // Park first so nothing we need sits in 0..=3 while we overwrite them.
    let parked_inbox = park(inbox)?;
    let mut parked: [Option<OwnedFd>; 3] = [None, None, None];
    for (slot, pipe) in pipes.into_iter().enumerate() {
        if let Some(fd) = pipe {
            parked[slot] = Some(park(fd)?);
        }
    }

    for (slot, action) in actions.iter().enumerate() {
        match (action, &parked[slot]) {
            (StdioAction::Pipe, Some(fd)) => {
                let installed = match slot {
                    0 => dup2_stdin(fd),
                    1 => dup2_stdout(fd),
                    _ => dup2_stderr(fd),
                };
                installed.map_err(step("dup2(stdio)"))?;
            }
            (StdioAction::Pipe, None) => return Err(step("stdio pipe")(Errno::EBADF)),
            (StdioAction::Close, _) => {
                // EBADF when the slot was already closed is fine.
                let _ = close(slot as RawFd);
            }
            (StdioAction::ShareParent, _) => {}
        }
    }

    // SAFETY: nothing in a freshly cloned worker owns the fixed inbox slot.
    let inbox = unsafe { dup3_raw(&parked_inbox, INBOX_FD, OFlag::O_CLOEXEC) }.map_err(step("dup3(inbox)"))?;
    drop(parked);
    drop(parked_inbox);
    close_from(INBOX_FD + 1)?;

    tracing::trace!(?actions, fd = inbox.as_raw_fd(), "Worker descriptors installed");
    Ok(inbox)
}
