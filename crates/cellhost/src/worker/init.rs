//! Minimal init for workers that land as PID 1 in a new PID namespace.
//!
//! PID 1 gets no default signal handling from the kernel and inherits every
//! orphan in the namespace. Instead of running the entry point there, the
//! worker forks once more:
//! - the child returns from [`become_init`] and runs the entry point
//! - the parent stays behind as init: forwards a fixed set of signals to the
//!   child, reaps everything, and exits with the child's status
//!   (`128 + signal` when it was killed)

use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::fd_redirect::close_from;

/// Signals init relays to the worker.
pub const FORWARDED_SIGNALS: [Signal; 7] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
];

static WORKER_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(signo: libc::c_int) {
    let pid = WORKER_PID.load(Ordering::Relaxed);
    if pid > 0 {
        // SAFETY: kill is async-signal-safe.
        unsafe { libc::kill(pid, signo) };
    }
}

fn forwarded_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in FORWARDED_SIGNALS {
        set.add(signal);
    }
    set
}

/// Split into init and worker. Returns only in the worker.
///
/// Must be called while the process is single-threaded.
pub(crate) fn become_init() -> Result<(), Errno> {
    // Blocked across fork so nothing sent in between hits a default disposition.
    let forwarded = forwarded_set();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&forwarded), None)?;

    // SAFETY: single-threaded; both sides only make syscalls before settling.
    match unsafe { fork() }? {
        ForkResult::Child => {
            sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&forwarded), None)?;
            Ok(())
        }
        ForkResult::Parent { child } => {
            let code = supervise(child, &forwarded);
            // SAFETY: init holds nothing that needs flushing.
            unsafe { libc::_exit(code) }
        }
    }
}

fn supervise(worker: Pid, forwarded: &SigSet) -> i32 {
    WORKER_PID.store(worker.as_raw(), Ordering::Relaxed);
    // Init must not keep the inbox or pipes alive on the worker's behalf.
    let _ = close_from(3);

    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in FORWARDED_SIGNALS {
        // SAFETY: the handler only touches an atomic and calls kill.
        let _ = unsafe { sigaction(signal, &action) };
    }
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(forwarded), None);

    reap_until_exit(worker)
}

/// Reap every child until `worker` exits; return its shell-style status.
pub(crate) fn reap_until_exit(worker: Pid) -> i32 {
    loop {
        match waitid(Id::All, WaitPidFlag::WEXITED) {
            Ok(WaitStatus::Exited(pid, code)) if pid == worker => return code,
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == worker => return 128 + signal as i32,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::sched::{CloneFlags, unshare};
    use nix::sys::wait::waitpid;
    use nix::unistd::getpid;

    use super::*;

    const SKIPPED: i32 = 77;

    /// Fork a helper that enters fresh user+PID namespaces and forks PID 1.
    /// PID 1 runs `become_init`; the worker side runs `worker` and exits with
    /// its return value. Returns what the helper saw as PID 1's exit code.
    fn run_as_pid1(worker: fn() -> i32) -> Option<i32> {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = (|| {
                    if unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWPID).is_err() {
                        return SKIPPED;
                    }
                    match unsafe { fork() } {
                        Ok(ForkResult::Child) => {
                            if getpid().as_raw() != 1 || become_init().is_err() {
                                unsafe { libc::_exit(100) }
                            }
                            unsafe { libc::_exit(worker()) }
                        }
                        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
                            Ok(WaitStatus::Exited(_, code)) => code,
                            _ => 101,
                        },
                        Err(_) => 102,
                    }
                })();
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, SKIPPED) => None,
                WaitStatus::Exited(_, code) => Some(code),
                other => panic!("helper ended unexpectedly: {other:?}"),
            },
        }
    }

    #[test]
    fn init_exits_with_worker_status() {
        let Some(code) = run_as_pid1(|| 7) else {
            eprintln!("user namespaces unavailable, skipping");
            return;
        };
        assert_eq!(code, 7);
    }

    #[test]
    fn init_reports_worker_signal() {
        let Some(code) = run_as_pid1(|| {
            unsafe { libc::kill(libc::getpid(), libc::SIGKILL) };
            0
        }) else {
            eprintln!("user namespaces unavailable, skipping");
            return;
        };
        assert_eq!(code, 128 + libc::SIGKILL);
    }

    #[test]
    fn init_forwards_termination() {
        // The worker signals its parent (init) with SIGTERM; init relays it back.
        let Some(code) = run_as_pid1(|| {
            unsafe { libc::kill(libc::getppid(), libc::SIGTERM) };
            loop {
                unsafe { libc::pause() };
            }
        }) else {
            eprintln!("user namespaces unavailable, skipping");
            return;
        };
        assert_eq!(code, 128 + libc::SIGTERM);
    }
}
