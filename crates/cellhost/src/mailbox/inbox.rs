//! Inbox state shared between the receiver and the sender connections.
//!
//! At most one of these is non-empty at any time:
//! - `queue`: messages that arrived while nobody was taking
//! - `waiter`: the suspended `take()`
//!
//! All transitions happen under one mutex, and the receiver only ever
//! observes a message after the connection finished decoding it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::task::task_tracker::TaskTrackerToken;

use super::Delivery;
use crate::bridge::protocol::{ConnId, Message};
use crate::bridge::transport::Datagram;

/// What a connection does after handing off one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Rearm,
    Drop,
}

pub(crate) struct Waiter {
    pub id: u64,
    pub tx: oneshot::Sender<Delivery>,
    // Keeps the mailbox's tracker busy while a receiver is suspended.
    pub _keep_alive: TaskTrackerToken,
}

impl Waiter {
    fn resume(self, delivery: Delivery) -> Result<(), Delivery> {
        self.tx.send(delivery)
    }
}

pub(crate) struct State {
    pub open: bool,
    pub senders: usize,
    pub queue: VecDeque<Message>,
    pub waiter: Option<Waiter>,
    pub next_waiter: u64,
}

impl State {
    pub fn is_consistent(&self) -> bool {
        self.queue.is_empty() || self.waiter.is_none()
    }

    fn sender_gone(&mut self) {
        self.senders = self.senders.saturating_sub(1);
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
}

impl Shared {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                open: true,
                senders: 0,
                queue: VecDeque::new(),
                waiter: None,
                next_waiter: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a received datagram to the receiver.
    pub fn deliver(&self, conn: ConnId, datagram: Datagram) -> Step {
        let (decoded, unclaimed) = datagram.decode();
        if unclaimed > 0 {
            tracing::debug!(%conn, unclaimed, "Closed descriptors the message did not reference");
        }

        let mut state = self.lock();
        let step = match (state.waiter.take(), decoded) {
            (None, Ok(message)) => {
                state.queue.push_back(message);
                tracing::trace!(%conn, queued = state.queue.len(), "Message queued");
                Step::Rearm
            }
            (Some(waiter), Ok(message)) => {
                if let Err(Delivery::Message(message)) = waiter.resume(Delivery::Message(message)) {
                    state.queue.push_back(message);
                }
                tracing::trace!(%conn, "Message handed to waiting receiver");
                Step::Rearm
            }
            (waiter, Err(error)) => {
                tracing::warn!(%conn, %error, "Dropping sender after malformed message");
                state.sender_gone();
                match waiter {
                    Some(waiter) if state.senders == 0 => {
                        let _ = waiter.resume(Delivery::NoSendersLeft);
                    }
                    other => state.waiter = other,
                }
                Step::Drop
            }
        };
        debug_assert!(state.is_consistent());
        step
    }

    /// A connection hit EOF or a transport error.
    pub fn sender_failed(&self, conn: ConnId) -> Step {
        let mut state = self.lock();
        state.sender_gone();
        tracing::debug!(%conn, senders = state.senders, "Sender connection closed");
        if state.senders == 0
            && let Some(waiter) = state.waiter.take()
        {
            let _ = waiter.resume(Delivery::NoSendersLeft);
        }
        Step::Drop
    }
}
