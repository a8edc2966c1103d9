//! FdBox - shared ownership of one descriptor that can be moved to a peer.
//!
//! Every clone of an [`FdBox`] refers to the same cell. The descriptor closes
//! when the last clone drops, or earlier when it is sent: the encoder checks
//! the descriptor out with an [`FdLock`], and
//! - `commit()` after the kernel accepted the datagram closes the local copy
//! - dropping the lock (send failed or never happened) puts it back

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FdError {
    #[error("descriptor was already sent or closed")]
    Closed,
    #[error("descriptor is checked out by an in-flight send")]
    Busy,
}

enum FdCell {
    Open(OwnedFd),
    CheckedOut,
    Closed,
}

/// Shared handle to a descriptor.
#[derive(Clone)]
pub struct FdBox {
    cell: Arc<Mutex<FdCell>>,
}

impl FdBox {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            cell: Arc::new(Mutex::new(FdCell::Open(fd))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FdCell> {
        // A panic while holding the lock cannot leave the cell half-updated.
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.lock(), FdCell::Open(_))
    }

    /// Whether both handles share one cell.
    pub fn same_box(&self, other: &FdBox) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Run `f` with the descriptor borrowed.
    pub fn with_fd<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> Result<R, FdError> {
        match &*self.lock() {
            FdCell::Open(fd) => Ok(f(fd.as_fd())),
            FdCell::CheckedOut => Err(FdError::Busy),
            FdCell::Closed => Err(FdError::Closed),
        }
    }

    /// Detach the descriptor; every clone sees the box as closed afterwards.
    pub fn take(&self) -> Result<OwnedFd, FdError> {
        let mut cell = self.lock();
        match std::mem::replace(&mut *cell, FdCell::Closed) {
            FdCell::Open(fd) => Ok(fd),
            FdCell::CheckedOut => {
                *cell = FdCell::CheckedOut;
                Err(FdError::Busy)
            }
            FdCell::Closed => Err(FdError::Closed),
        }
    }

    /// Close the descriptor now instead of on last drop.
    pub fn close(&self) -> Result<(), FdError> {
        self.take().map(drop)
    }
}

impl fmt::Debug for FdBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.lock() {
            FdCell::Open(fd) => write!(f, "FdBox({})", fd.as_raw_fd()),
            FdCell::CheckedOut => f.write_str("FdBox(<in flight>)"),
            FdCell::Closed => f.write_str("FdBox(<closed>)"),
        }
    }
}

/// A descriptor checked out of its [`FdBox`] for the duration of one send.
pub struct FdLock<'a> {
    owner: &'a FdBox,
    fd: Option<OwnedFd>,
}

impl<'a> FdLock<'a> {
    pub fn checkout(owner: &'a FdBox) -> Result<Self, FdError> {
        let mut cell = owner.lock();
        match std::mem::replace(&mut *cell, FdCell::CheckedOut) {
            FdCell::Open(fd) => Ok(Self {
                owner,
                fd: Some(fd),
            }),
            other => {
                let err = match other {
                    FdCell::Closed => FdError::Closed,
                    _ => FdError::Busy,
                };
                *cell = other;
                Err(err)
            }
        }
    }

    /// The kernel owns a copy now; close ours and mark the box closed.
    pub fn commit(mut self) {
        drop(self.fd.take());
        *self.owner.lock() = FdCell::Closed;
    }

    /// Return the descriptor to its box unchanged.
    pub fn release(self) {}
}

impl AsRawFd for FdLock<'_> {
    fn as_raw_fd(&self) -> RawFd {
        // `fd` is only `None` inside commit()/drop(), which consume the lock.
        self.fd.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }
}

impl Drop for FdLock<'_> {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            *self.owner.lock() = FdCell::Open(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn pipe() -> (std::fs::File, OwnedFd) {
        let (read, write) = nix::unistd::pipe().unwrap();
        (std::fs::File::from(read), write)
    }

    #[test]
    fn dropped_lock_rolls_back() {
        let (_read, write) = pipe();
        let fd = FdBox::new(write);
        {
            let lock = FdLock::checkout(&fd).unwrap();
            assert!(lock.as_raw_fd() >= 0);
            assert!(!fd.is_open());
        }
        assert!(fd.is_open());
    }

    #[test]
    fn commit_closes_every_clone() {
        let (_read, write) = pipe();
        let fd = FdBox::new(write);
        let other = fd.clone();
        FdLock::checkout(&fd).unwrap().commit();
        assert!(!other.is_open());
        assert_eq!(FdLock::checkout(&other).err(), Some(FdError::Closed));
    }

    #[test]
    fn second_checkout_is_busy() {
        let (_read, write) = pipe();
        let fd = FdBox::new(write);
        let _held = FdLock::checkout(&fd).unwrap();
        assert_eq!(FdLock::checkout(&fd).err(), Some(FdError::Busy));
        assert_eq!(fd.close(), Err(FdError::Busy));
    }

    #[test]
    fn last_clone_closes_descriptor() {
        let (mut read, write) = pipe();
        let fd = FdBox::new(write);
        let other = fd.clone();
        drop(fd);
        assert!(other.is_open());
        drop(other);

        let mut buf = Vec::new();
        // EOF proves the write end is gone.
        assert_eq!(read.read_to_end(&mut buf).unwrap(), 0);
    }

    #[test]
    fn identity_is_shared_across_clones() {
        let (_r1, w1) = pipe();
        let (_r2, w2) = pipe();
        let a = FdBox::new(w1);
        let b = FdBox::new(w2);
        assert!(a.same_box(&a.clone()));
        assert!(!a.same_box(&b));
    }
}
