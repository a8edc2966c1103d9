//! Wire protocol types.
//!
//! Two channels:
//! - **Mailboxes** (SEQPACKET, one datagram per message): [`Message`] values,
//!   encoded by [`super::codec`]
//! - **Supervisor control socket**: fixed-layout records ([`StartVmRequest`],
//!   [`StartVmReply`], [`ScrubRequest`]) in native byte order

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::transport::MailboxAddress;
use crate::fd_lock::FdBox;

/// Identifier for one sender connection of a mailbox.
///
/// UUID v4 so log lines from different mailboxes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(uuid::Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single value carried by a message.
///
/// `Fd` and `Address` wrap kernel objects. Cloning them shares the handle;
/// sending an `Fd` moves the descriptor out of every clone.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    String(Bytes),
    Fd(FdBox),
    Address(MailboxAddress),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Fd(_) => "fd",
            Value::Address(_) => "address",
        }
    }

    pub fn as_str(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<&MailboxAddress> {
        match self {
            Value::Address(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn as_fd(&self) -> Option<&FdBox> {
        match self {
            Value::Fd(fd) => Some(fd),
            _ => None,
        }
    }
}

// Kernel-object values compare by identity of the shared handle.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Fd(a), Value::Fd(b)) => a.same_box(b),
            (Value::Address(a), Value::Address(b)) => a.same_address(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Bytes::from(s))
    }
}

impl From<Bytes> for Value {
    fn from(s: Bytes) -> Self {
        Value::String(s)
    }
}

impl From<FdBox> for Value {
    fn from(fd: FdBox) -> Self {
        Value::Fd(fd)
    }
}

impl From<MailboxAddress> for Value {
    fn from(addr: MailboxAddress) -> Self {
        Value::Address(addr)
    }
}

/// What travels through a mailbox: one scalar, or a small string-keyed map.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Value(Value),
    Dict(BTreeMap<Bytes, Value>),
}

impl Message {
    pub fn nil() -> Self {
        Message::Value(Value::Nil)
    }

    pub fn dict<K, V, I>(entries: I) -> Self
    where
        K: Into<Bytes>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Message::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Dictionary lookup; `None` for scalars and missing keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Message::Dict(entries) => entries.get(key.as_bytes()),
            Message::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Message::Value(v) => Some(v),
            Message::Dict(_) => None,
        }
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Value(value)
    }
}

impl From<bool> for Message {
    fn from(b: bool) -> Self {
        Message::Value(Value::Bool(b))
    }
}

impl From<f64> for Message {
    fn from(n: f64) -> Self {
        Message::Value(Value::Number(n))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Value(Value::from(s))
    }
}

/// What happens to one of a worker's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum StdioAction {
    /// Descriptor is closed before the entry point runs.
    Close = 0,
    /// Inherit whatever the supervisor has in that slot.
    #[default]
    ShareParent = 1,
    /// A fresh pipe; the ancestor keeps the other end.
    Pipe = 2,
}

impl StdioAction {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Close),
            1 => Some(Self::ShareParent),
            2 => Some(Self::Pipe),
            _ => None,
        }
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    i32::from_ne_bytes(raw)
}

fn read_bool(raw: u8) -> Option<bool> {
    match raw {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

/// Spawn request sent from the ancestor to the supervisor.
///
/// Travels with the inbox descriptor first, then one pipe end for each
/// `Pipe` stdio slot in stdin/stdout/stderr order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartVmRequest {
    pub clone_flags: u64,
    pub stdio: [StdioAction; 3],
    pub stderr_has_color: bool,
    pub has_pre_init_hook: bool,
}

impl StartVmRequest {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..8].copy_from_slice(&self.clone_flags.to_ne_bytes());
        for (i, action) in self.stdio.iter().enumerate() {
            out[8 + i] = *action as u8;
        }
        out[11] = self.stderr_has_color as u8;
        out[12] = self.has_pre_init_hook as u8;
        out
    }

    /// Parse an untrusted record. Rejects wrong sizes and unknown enum values.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE || bytes[13..].iter().any(|b| *b != 0) {
            return None;
        }
        Some(Self {
            clone_flags: read_u64(bytes, 0),
            stdio: [
                StdioAction::from_u8(bytes[8])?,
                StdioAction::from_u8(bytes[9])?,
                StdioAction::from_u8(bytes[10])?,
            ],
            stderr_has_color: read_bool(bytes[11])?,
            has_pre_init_hook: read_bool(bytes[12])?,
        })
    }

    /// Descriptors that must accompany this request.
    pub fn expected_fds(&self) -> usize {
        1 + self
            .stdio
            .iter()
            .filter(|a| **a == StdioAction::Pipe)
            .count()
    }
}

/// Supervisor's answer to a [`StartVmRequest`].
///
/// On success `errno` is zero and the datagram carries the child's pidfd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartVmReply {
    pub child_pid: i32,
    pub errno: i32,
}

impl StartVmReply {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.child_pid.to_ne_bytes());
        out[4..].copy_from_slice(&self.errno.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            child_pid: read_i32(bytes, 0),
            errno: read_i32(bytes, 4),
        })
    }
}

/// A memory region the supervisor zeroes before serving requests.
/// A null `ptr` ends the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrubRequest {
    pub ptr: usize,
    pub len: usize,
}

impl ScrubRequest {
    pub const SIZE: usize = 2 * size_of::<usize>();
    pub const END: Self = Self { ptr: 0, len: 0 };

    pub fn is_end(&self) -> bool {
        self.ptr == 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let half = Self::SIZE / 2;
        out[..half].copy_from_slice(&self.ptr.to_ne_bytes());
        out[half..].copy_from_slice(&self.len.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        const HALF: usize = ScrubRequest::SIZE / 2;
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut ptr = [0u8; HALF];
        let mut len = [0u8; HALF];
        ptr.copy_from_slice(&bytes[..HALF]);
        len.copy_from_slice(&bytes[HALF..]);
        Some(Self {
            ptr: usize::from_ne_bytes(ptr),
            len: usize::from_ne_bytes(len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdio_action_serializes_snake_case() {
        let actions = [StdioAction::Close, StdioAction::ShareParent, StdioAction::Pipe];
        insta::assert_json_snapshot!(actions, @r#"
        [
          "close",
          "share_parent",
          "pipe"
        ]
        "#);
    }

    #[test]
    fn start_request_counts_pipe_descriptors() {
        let req = StartVmRequest {
            clone_flags: 0,
            stdio: [StdioAction::Pipe, StdioAction::Close, StdioAction::Pipe],
            stderr_has_color: false,
            has_pre_init_hook: false,
        };
        assert_eq!(req.expected_fds(), 3);
    }

    #[test]
    fn start_request_survives_the_wire() {
        let req = StartVmRequest {
            clone_flags: libc::CLONE_NEWPID as u64 | libc::CLONE_NEWUSER as u64,
            stdio: [StdioAction::Close, StdioAction::ShareParent, StdioAction::Pipe],
            stderr_has_color: true,
            has_pre_init_hook: false,
        };
        assert_eq!(StartVmRequest::from_bytes(&req.to_bytes()), Some(req));
    }

    #[test]
    fn start_request_rejects_garbage() {
        let mut raw = StartVmRequest {
            clone_flags: 0,
            stdio: [StdioAction::ShareParent; 3],
            stderr_has_color: false,
            has_pre_init_hook: false,
        }
        .to_bytes();
        assert!(StartVmRequest::from_bytes(&raw[..15]).is_none());

        raw[9] = 7;
        assert!(StartVmRequest::from_bytes(&raw).is_none());

        raw[9] = 1;
        raw[12] = 2;
        assert!(StartVmRequest::from_bytes(&raw).is_none());
    }

    #[test]
    fn scrub_list_terminator() {
        assert!(ScrubRequest::END.is_end());
        let region = ScrubRequest { ptr: 0x1000, len: 64 };
        assert!(!region.is_end());
        assert_eq!(ScrubRequest::from_bytes(&region.to_bytes()), Some(region));
    }

    #[test]
    fn dict_lookup() {
        let msg = Message::dict([("name", Value::from("worker")), ("n", Value::from(2.0))]);
        assert_eq!(msg.get("n").and_then(Value::as_number), Some(2.0));
        assert_eq!(msg.get("name").and_then(Value::as_str), Some(&b"worker"[..]));
        assert!(msg.get("missing").is_none());
        assert!(Message::from(true).get("n").is_none());
    }
}
