//! Per-sender receive operation.
//!
//! Each connection runs one receive at a time: wait for readability, read one
//! datagram, hand it to the inbox, re-arm. A connection that fails is
//! dropped on its own; the inbox and every other sender keep running.

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

use super::inbox::{Shared, Step};
use crate::bridge::protocol::ConnId;
use crate::bridge::transport::{TransportError, recv_datagram_ready};

pub(crate) struct SenderConnection {
    id: ConnId,
    socket: AsyncFd<OwnedFd>,
    max_fds: usize,
}

impl SenderConnection {
    pub fn new(fd: OwnedFd, max_fds: usize) -> io::Result<Self> {
        // SAFETY: the socket is owned by the AsyncFd for as long as it is registered.
        let socket = unsafe { AsyncFd::register_with_interest(fd, Interest::READABLE) }?;
        Ok(Self {
            id: ConnId::new(),
            socket,
            max_fds,
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub async fn run(self, inbox: Arc<Shared>, shutdown: CancellationToken) {
        tracing::trace!(conn = %self.id, "Receive armed");
        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::trace!(conn = %self.id, "Mailbox closed, receive abandoned");
                    return;
                }
                received = recv_datagram_ready(&self.socket, self.max_fds) => received,
            };

            let step = match received {
                Ok(datagram) => inbox.deliver(self.id, datagram),
                Err(TransportError::Closed) => inbox.sender_failed(self.id),
                Err(error) => {
                    tracing::debug!(conn = %self.id, %error, "Receive failed");
                    inbox.sender_failed(self.id)
                }
            };
            if step == Step::Drop {
                return;
            }
        }
    }
}
