//! SEQPACKET transport with descriptor passing.
//!
//! Every channel in a host tree is an `AF_UNIX` `SOCK_SEQPACKET` pair: one
//! `sendmsg` is one datagram, and descriptors ride along as SCM_RIGHTS.
//! The blocking helpers serve the supervisor and worker bootstrap; the
//! `*_ready` variants drive the same calls through tokio's [`AsyncFd`].

use std::fmt;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::codec::{ContainerMessage, EncodeError, Encoded, MalformedMessage, ReceivedFds, encode};
use super::protocol::Message;
use crate::config::SCM_MAX_FD;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    Closed,
    #[error("datagram or its control data was truncated")]
    Truncated,
    #[error("datagram carried {received} descriptors, limit is {max}")]
    TooManyDescriptors { received: usize, max: usize },
    #[error(transparent)]
    Os(#[from] Errno),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::Os(Errno::EAGAIN))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("cannot encode message: {0}")]
    Encode(#[from] EncodeError),
    #[error("send failed: {0}")]
    Transport(#[from] TransportError),
}

/// A connected, close-on-exec SEQPACKET pair.
pub fn seqpacket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    Ok(socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?)
}

/// One `sendmsg` of `bytes` plus `fds`. Never raises SIGPIPE.
pub fn send_with_fds(
    fd: BorrowedFd<'_>,
    bytes: &[u8],
    fds: &[RawFd],
    flags: MsgFlags,
) -> Result<usize, TransportError> {
    let iov = [IoSlice::new(bytes)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
    loop {
        match sendmsg::<()>(fd.as_raw_fd(), &iov, cmsgs, flags | MsgFlags::MSG_NOSIGNAL, None) {
            Err(Errno::EINTR) => continue,
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(TransportError::Closed),
            other => return Ok(other?),
        }
    }
}

/// One `recvmsg` into `buf`. Received descriptors are close-on-exec.
///
/// The control buffer is sized for the kernel maximum so descriptors are
/// never silently dropped; anything over `max_fds` is closed and reported.
pub fn recv_with_fds(
    fd: BorrowedFd<'_>,
    buf: &mut [u8],
    max_fds: usize,
    flags: MsgFlags,
) -> Result<(usize, ReceivedFds), TransportError> {
    let mut cmsg_buf = cmsg_space!([RawFd; SCM_MAX_FD]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = loop {
        match recvmsg::<()>(
            fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            flags | MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Err(Errno::EINTR) => continue,
            other => break other?,
        }
    };

    let mut received = ReceivedFds::new();
    for cmsg in msg.cmsgs().map_err(|_| TransportError::Truncated)? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            for fd in raw {
                // SAFETY: SCM_RIGHTS installed a fresh descriptor we now own.
                received.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    if msg.flags.intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC) {
        return Err(TransportError::Truncated);
    }
    if received.len() > max_fds {
        return Err(TransportError::TooManyDescriptors {
            received: received.len(),
            max: max_fds,
        });
    }
    if msg.bytes == 0 {
        return Err(TransportError::Closed);
    }
    Ok((msg.bytes, received))
}

/// A datagram read into a message record.
#[derive(Debug)]
pub struct Datagram {
    pub message: ContainerMessage,
    pub len: usize,
    pub fds: ReceivedFds,
}

impl Datagram {
    /// Decode, then close every descriptor the message did not claim.
    /// Returns the result and the number of descriptors closed.
    pub fn decode(mut self) -> (Result<Message, MalformedMessage>, usize) {
        let result = self.message.decode(self.len, &mut self.fds);
        let closed = self.fds.close_remaining();
        (result, closed)
    }
}

pub fn recv_datagram(
    fd: BorrowedFd<'_>,
    max_fds: usize,
    flags: MsgFlags,
) -> Result<Datagram, TransportError> {
    let mut message = ContainerMessage::zeroed();
    let (len, fds) = recv_with_fds(fd, message.as_mut_bytes(), max_fds, flags)?;
    Ok(Datagram { message, len, fds })
}

// try_io() wants WouldBlock as an io::Error; everything else passes through.
fn lift<T>(result: Result<T, TransportError>) -> io::Result<Result<T, TransportError>> {
    match result {
        Err(e) if e.is_would_block() => Err(io::ErrorKind::WouldBlock.into()),
        other => Ok(other),
    }
}

/// Send once the socket is writable.
pub async fn send_ready(
    socket: &AsyncFd<OwnedFd>,
    bytes: &[u8],
    fds: &[RawFd],
) -> Result<usize, TransportError> {
    loop {
        let mut guard = socket.writable().await?;
        let attempt = guard.try_io(|inner| {
            lift(send_with_fds(inner.get_ref().as_fd(), bytes, fds, MsgFlags::MSG_DONTWAIT))
        });
        if let Ok(result) = attempt {
            return result?;
        }
    }
}

/// Receive once the socket is readable.
pub async fn recv_ready(
    socket: &AsyncFd<OwnedFd>,
    buf: &mut [u8],
    max_fds: usize,
) -> Result<(usize, ReceivedFds), TransportError> {
    loop {
        let mut guard = socket.readable().await?;
        let attempt = guard.try_io(|inner| {
            lift(recv_with_fds(inner.get_ref().as_fd(), buf, max_fds, MsgFlags::MSG_DONTWAIT))
        });
        if let Ok(result) = attempt {
            return result?;
        }
    }
}

pub async fn recv_datagram_ready(
    socket: &AsyncFd<OwnedFd>,
    max_fds: usize,
) -> Result<Datagram, TransportError> {
    let mut message = ContainerMessage::zeroed();
    let (len, fds) = recv_ready(socket, message.as_mut_bytes(), max_fds).await?;
    Ok(Datagram { message, len, fds })
}

/// Send side of a mailbox connection.
///
/// Clones share the socket. Sending an address duplicates this descriptor
/// into the receiver, so one mailbox connection can have senders in many
/// processes.
#[derive(Clone)]
pub struct MailboxAddress {
    fd: Arc<OwnedFd>,
}

impl MailboxAddress {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd: Arc::new(fd) }
    }

    pub fn same_address(&self, other: &MailboxAddress) -> bool {
        Arc::ptr_eq(&self.fd, &other.fd)
    }

    /// Send without waiting; a full socket buffer is reported as `EAGAIN`.
    pub fn try_send(&self, message: &Message) -> Result<(), SendError> {
        let encoded = encode(message)?;
        send_with_fds(
            self.fd.as_fd(),
            encoded.as_bytes(),
            &encoded.raw_fds(),
            MsgFlags::MSG_DONTWAIT,
        )?;
        encoded.commit();
        Ok(())
    }

    /// Send `message`, waiting for buffer space if the receiver is behind.
    ///
    /// `Fd` values are moved: on success they are closed locally; on any
    /// failure (including cancellation of this future) they stay usable.
    pub async fn send(&self, message: &Message) -> Result<(), SendError> {
        self.send_encoded(encode(message)?).await
    }

    /// [`send`](Self::send) for a message the caller already encoded.
    pub(crate) async fn send_encoded(&self, encoded: Encoded<'_>) -> Result<(), SendError> {
        let fds = encoded.raw_fds();
        match send_with_fds(self.fd.as_fd(), encoded.as_bytes(), &fds, MsgFlags::MSG_DONTWAIT) {
            Ok(_) => {}
            Err(e) if e.is_would_block() => {
                // Register a duplicate so the shared descriptor is never owned by a reactor.
                let dup = self.fd.try_clone().map_err(TransportError::from)?;
                // SAFETY: `dup` is an owned, open socket that lives inside the AsyncFd.
                let socket = unsafe { AsyncFd::register_with_interest(dup, Interest::WRITABLE) }
                    .map_err(|e| TransportError::from(io::Error::from(e)))?;
                send_ready(&socket, encoded.as_bytes(), &fds).await?;
            }
            Err(e) => return Err(e.into()),
        }
        tracing::trace!(fds = fds.len(), "Message sent");
        encoded.commit();
        Ok(())
    }
}

impl AsFd for MailboxAddress {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Debug for MailboxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MailboxAddress({})", self.fd.as_raw_fd())
    }
}
