//! Mailbox - one receiver, many senders.
//!
//! A mailbox owns the receiving ends of any number of SEQPACKET connections.
//! Each connection gets its own receive task; decoded messages land in the
//! inbox queue, or go straight to a suspended [`Mailbox::take`].
//!
//! # Failure isolation
//!
//! A connection that sends garbage, closes, or errors is dropped alone. The
//! receiver learns about it only when the last sender is gone, as
//! [`Delivery::NoSendersLeft`].
//!
//! # Cancellation
//!
//! Dropping a pending `take()` detaches the receiver. A message that was
//! already handed to it goes back to the front of the queue, so it is never
//! lost and the next `take()` sees it first.

mod inbox;
mod receive;

use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use self::inbox::{Shared, Waiter};
use self::receive::SenderConnection;
use crate::bridge::protocol::Message;
use crate::bridge::transport::{MailboxAddress, seqpacket_pair};
use crate::config::HostConfig;

/// Result of [`Mailbox::take`].
#[derive(Debug, PartialEq)]
pub enum Delivery {
    Message(Message),
    /// Every sender is gone (or the mailbox was closed) and the queue is empty.
    NoSendersLeft,
}

impl Delivery {
    pub fn into_message(self) -> Option<Message> {
        match self {
            Delivery::Message(message) => Some(message),
            Delivery::NoSendersLeft => None,
        }
    }
}

pub struct Mailbox {
    shared: Arc<Shared>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    max_fds: usize,
}

impl Mailbox {
    /// Create an empty mailbox. Must be called inside a tokio runtime.
    pub fn new(config: &HostConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            max_fds: config.fd_limit(),
        }
    }

    /// Open a new connection and return its send side.
    pub fn new_address(&self) -> io::Result<MailboxAddress> {
        let (local, remote) = seqpacket_pair()?;
        self.adopt(local)?;
        Ok(MailboxAddress::from_fd(remote))
    }

    /// Start receiving on an existing SEQPACKET socket.
    pub fn adopt(&self, fd: OwnedFd) -> io::Result<()> {
        let conn = SenderConnection::new(fd, self.max_fds)?;
        {
            let mut state = self.shared.lock();
            if !state.open {
                return Err(io::Error::other("mailbox is closed"));
            }
            state.senders += 1;
        }
        tracing::debug!(conn = %conn.id(), "Sender connection adopted");
        self.tracker
            .spawn(conn.run(Arc::clone(&self.shared), self.shutdown.child_token()));
        Ok(())
    }

    /// Next message, in arrival order per sender.
    ///
    /// Returns [`Delivery::NoSendersLeft`] once the queue is empty and no
    /// sender remains. Cancel-safe: see the module docs.
    pub async fn take(&mut self) -> Delivery {
        let pending = {
            let mut state = self.shared.lock();
            if let Some(message) = state.queue.pop_front() {
                return Delivery::Message(message);
            }
            if !state.open || state.senders == 0 {
                return Delivery::NoSendersLeft;
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiter = Some(Waiter {
                id,
                tx,
                _keep_alive: self.tracker.token(),
            });
            PendingTake {
                shared: &self.shared,
                id,
                rx,
                finished: false,
            }
        };
        pending.wait().await
    }

    /// Connections still able to deliver.
    pub fn sender_count(&self) -> usize {
        self.shared.lock().senders
    }

    /// Messages waiting for `take()`.
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Stop every receive. Queued messages can still be taken.
    pub fn close(&mut self) {
        self.shared.lock().open = false;
        self.shutdown.cancel();
        self.tracker.close();
    }

    /// Wait until every receive task has exited. Only completes after `close()`.
    pub async fn closed(&self) {
        self.tracker.wait().await;
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.shared.lock().is_consistent()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.tracker.close();
    }
}

/// A suspended take. Dropping it before completion detaches the receiver.
struct PendingTake<'a> {
    shared: &'a Shared,
    id: u64,
    rx: oneshot::Receiver<Delivery>,
    finished: bool,
}

impl PendingTake<'_> {
    async fn wait(mut self) -> Delivery {
        let delivery = (&mut self.rx).await.unwrap_or(Delivery::NoSendersLeft);
        self.finished = true;
        delivery
    }
}

impl Drop for PendingTake<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.shared.lock();
        if state.waiter.as_ref().is_some_and(|w| w.id == self.id) {
            state.waiter = None;
        }
        if let Ok(Delivery::Message(message)) = self.rx.try_recv() {
            tracing::trace!("Receiver cancelled, message returned to queue");
            state.queue.push_front(message);
        }
    }
}
