//! Fixed-layout codec for mailbox messages.
//!
//! A message is a [`MESSAGE_SIZE`]-byte record: [`MESSAGE_MAX_MEMBERS`]
//! 8-byte slots followed by a string buffer. A slot holds either a plain
//! double or a tag NaN-boxed as `0x7FF8_0000_0000_000T`:
//!
//! | T | meaning |
//! |---|---------|
//! | 1 | nil / terminator |
//! | 2 | true |
//! | 3 | false |
//! | 4 | string (length-prefixed in the buffer) |
//! | 5 | descriptor (next SCM_RIGHTS entry) |
//! | 6 | mailbox address (next SCM_RIGHTS entry) |
//!
//! Layouts:
//! - scalar: slot 0 is nil, slot 1 is the value
//! - dictionary: slots `0..k` are values, slot `k` is nil; each value's key
//!   is read from the buffer right before the value's own string (if any)
//!
//! Decoding treats input as untrusted. Every read is bounded by the bytes
//! actually received, and descriptors are only claimed after the whole
//! message validated, so a rejected message leaves all of them in
//! [`ReceivedFds`] for the caller to close.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use bytes::Bytes;

use super::protocol::{Message, Value};
use super::transport::MailboxAddress;
use crate::config::{MESSAGE_MAX_MEMBERS, MESSAGE_SIZE};
use crate::fd_lock::{FdBox, FdError, FdLock};

const SLOT_SIZE: usize = 8;
const MEMBERS_SIZE: usize = MESSAGE_MAX_MEMBERS * SLOT_SIZE;
const SCALAR_HEADER_SIZE: usize = 2 * SLOT_SIZE;

/// Capacity of the string buffer that follows the slots.
pub const STRBUF_SIZE: usize = MESSAGE_SIZE - MEMBERS_SIZE;

/// Longest string a one-byte length prefix can describe.
pub const MAX_STRING_LEN: usize = u8::MAX as usize;

const EXPONENT_MASK: u64 = 0x7FF0_0000_0000_0000;
const MANTISSA_MASK: u64 = 0x000F_FFFF_FFFF_FFFF;
const BOX_BASE: u64 = 0x7FF8_0000_0000_0000;
const TAG_MASK: u64 = 0xF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Tag {
    Nil = 1,
    True = 2,
    False = 3,
    String = 4,
    Fd = 5,
    Address = 6,
}

const TERMINATOR: u64 = BOX_BASE | Tag::Nil as u64;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Number(f64),
    Tag(Tag),
}

impl Slot {
    fn to_bits(self) -> u64 {
        match self {
            Slot::Number(n) => n.to_bits(),
            Slot::Tag(tag) => BOX_BASE | tag as u64,
        }
    }

    fn from_bits(bits: u64) -> Result<Self, MalformedMessage> {
        let is_nan = bits & EXPONENT_MASK == EXPONENT_MASK && bits & MANTISSA_MASK != 0;
        if !is_nan {
            return Ok(Slot::Number(f64::from_bits(bits)));
        }
        if bits & !TAG_MASK != BOX_BASE {
            return Err(MalformedMessage::UnknownTag { bits });
        }
        let tag = match bits & TAG_MASK {
            1 => Tag::Nil,
            2 => Tag::True,
            3 => Tag::False,
            4 => Tag::String,
            5 => Tag::Fd,
            6 => Tag::Address,
            _ => return Err(MalformedMessage::UnknownTag { bits }),
        };
        Ok(Slot::Tag(tag))
    }
}

/// Why a received datagram was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("datagram of {received} bytes is shorter than the 16-byte scalar header")]
    ShortDatagram { received: usize },
    #[error("slot {index} lies past the {received} received bytes")]
    TruncatedSlots { index: usize, received: usize },
    #[error("string at offset {offset} overruns the {received} received bytes")]
    StringOutOfBounds { offset: usize, received: usize },
    #[error("message needs {needed} descriptors but {available} arrived")]
    MissingDescriptors { needed: usize, available: usize },
    #[error("unrecognized slot pattern {bits:#018x}")]
    UnknownTag { bits: u64 },
    #[error("dictionary has no terminator")]
    Unterminated,
    #[error("duplicate dictionary key")]
    DuplicateKey,
}

/// Why a message could not be encoded. Nothing was sent.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("dictionary has {count} entries, at most {max} fit in one message")]
    TooManyMembers { count: usize, max: usize },
    #[error("dictionary is empty")]
    EmptyDictionary,
    #[error("dictionary value for key {key:?} is nil")]
    NilInDictionary { key: String },
    #[error("string of {len} bytes exceeds the {max}-byte limit")]
    StringTooLong { len: usize, max: usize },
    #[error("strings overflow the {capacity}-byte message buffer")]
    BufferOverflow { capacity: usize },
    #[error("NaN is not a sendable number")]
    NotANumber,
    #[error(transparent)]
    Descriptor(#[from] FdError),
}

/// The raw message record.
#[derive(Clone)]
pub struct ContainerMessage {
    bytes: [u8; MESSAGE_SIZE],
}

impl ContainerMessage {
    pub fn zeroed() -> Self {
        Self {
            bytes: [0; MESSAGE_SIZE],
        }
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_SIZE] {
        &self.bytes
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8; MESSAGE_SIZE] {
        &mut self.bytes
    }

    fn set_slot(&mut self, index: usize, slot: Slot) {
        let at = index * SLOT_SIZE;
        self.bytes[at..at + SLOT_SIZE].copy_from_slice(&slot.to_bits().to_ne_bytes());
    }

    /// Decode the first `received` bytes.
    pub fn decode(&self, received: usize, fds: &mut ReceivedFds) -> Result<Message, MalformedMessage> {
        decode(&self.bytes[..received.min(MESSAGE_SIZE)], fds)
    }
}

impl Default for ContainerMessage {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for ContainerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerMessage").finish_non_exhaustive()
    }
}

/// Descriptors that arrived with a datagram, in SCM_RIGHTS order.
#[derive(Debug, Default)]
pub struct ReceivedFds {
    fds: VecDeque<OwnedFd>,
}

impl ReceivedFds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fd: OwnedFd) {
        self.fds.push_back(fd);
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Claim the next descriptor in order.
    pub fn take_next(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front()
    }

    /// Close everything not claimed; returns how many were closed.
    pub fn close_remaining(&mut self) -> usize {
        let n = self.fds.len();
        self.fds.clear();
        n
    }
}

impl From<Vec<OwnedFd>> for ReceivedFds {
    fn from(fds: Vec<OwnedFd>) -> Self {
        Self { fds: fds.into() }
    }
}

/// A descriptor queued for SCM_RIGHTS by the encoder.
pub enum OutgoingFd<'a> {
    /// Moved to the peer; closes locally on commit.
    Transfer(FdLock<'a>),
    /// Duplicated by the kernel; the local handle stays usable.
    Share(BorrowedFd<'a>),
}

impl AsRawFd for OutgoingFd<'_> {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            OutgoingFd::Transfer(lock) => lock.as_raw_fd(),
            OutgoingFd::Share(fd) => fd.as_raw_fd(),
        }
    }
}

/// An encoded message ready for one `sendmsg`.
///
/// Dropping it without [`Encoded::commit`] returns every transferred
/// descriptor to its box.
pub struct Encoded<'a> {
    message: ContainerMessage,
    len: usize,
    fds: Vec<OutgoingFd<'a>>,
}

impl<'a> Encoded<'a> {
    /// The bytes to send: the slots plus the used part of the buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.message.bytes[..self.len]
    }

    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.fds.iter().map(AsRawFd::as_raw_fd).collect()
    }

    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Call once the kernel accepted the datagram.
    pub fn commit(self) {
        for fd in self.fds {
            if let OutgoingFd::Transfer(lock) = fd {
                lock.commit();
            }
        }
    }
}

struct Writer<'a> {
    message: ContainerMessage,
    cursor: usize,
    fds: Vec<OutgoingFd<'a>>,
}

impl<'a> Writer<'a> {
    fn new() -> Self {
        Self {
            message: ContainerMessage::zeroed(),
            cursor: MEMBERS_SIZE,
            fds: Vec::new(),
        }
    }

    fn put_string(&mut self, s: &[u8]) -> Result<(), EncodeError> {
        if s.len() > MAX_STRING_LEN {
            return Err(EncodeError::StringTooLong {
                len: s.len(),
                max: MAX_STRING_LEN,
            });
        }
        let end = self.cursor + 1 + s.len();
        if end > MESSAGE_SIZE {
            return Err(EncodeError::BufferOverflow {
                capacity: STRBUF_SIZE,
            });
        }
        self.message.bytes[self.cursor] = s.len() as u8;
        self.message.bytes[self.cursor + 1..end].copy_from_slice(s);
        self.cursor = end;
        Ok(())
    }

    fn put_value(&mut self, index: usize, value: &'a Value) -> Result<(), EncodeError> {
        let slot = match value {
            Value::Nil => Slot::Tag(Tag::Nil),
            Value::Bool(true) => Slot::Tag(Tag::True),
            Value::Bool(false) => Slot::Tag(Tag::False),
            Value::Number(n) if n.is_nan() => return Err(EncodeError::NotANumber),
            Value::Number(n) => Slot::Number(*n),
            Value::String(s) => {
                self.put_string(s)?;
                Slot::Tag(Tag::String)
            }
            Value::Fd(fd) => {
                self.fds.push(OutgoingFd::Transfer(FdLock::checkout(fd)?));
                Slot::Tag(Tag::Fd)
            }
            Value::Address(addr) => {
                self.fds.push(OutgoingFd::Share(addr.as_fd()));
                Slot::Tag(Tag::Address)
            }
        };
        self.message.set_slot(index, slot);
        Ok(())
    }

    fn finish(self) -> Encoded<'a> {
        Encoded {
            message: self.message,
            len: self.cursor,
            fds: self.fds,
        }
    }
}

/// Encode `message`, checking out any descriptors it carries.
pub fn encode(message: &Message) -> Result<Encoded<'_>, EncodeError> {
    let mut writer = Writer::new();
    match message {
        Message::Value(value) => {
            writer.message.set_slot(0, Slot::Tag(Tag::Nil));
            writer.put_value(1, value)?;
        }
        Message::Dict(entries) => {
            if entries.is_empty() {
                return Err(EncodeError::EmptyDictionary);
            }
            let max = MESSAGE_MAX_MEMBERS - 1;
            if entries.len() > max {
                return Err(EncodeError::TooManyMembers {
                    count: entries.len(),
                    max,
                });
            }
            for (index, (key, value)) in entries.iter().enumerate() {
                if matches!(value, Value::Nil) {
                    return Err(EncodeError::NilInDictionary {
                        key: String::from_utf8_lossy(key).into_owned(),
                    });
                }
                writer.put_string(key)?;
                writer.put_value(index, value)?;
            }
            writer.message.set_slot(entries.len(), Slot::Tag(Tag::Nil));
        }
    }
    Ok(writer.finish())
}

/// A decoded value whose descriptor, if any, is not claimed yet.
enum Pending {
    Ready(Value),
    Fd,
    Address,
}

impl Pending {
    fn needs_fd(&self) -> bool {
        !matches!(self, Pending::Ready(_))
    }

    fn claim(self, fds: &mut ReceivedFds) -> Option<Value> {
        Some(match self {
            Pending::Ready(value) => value,
            Pending::Fd => Value::Fd(FdBox::new(fds.take_next()?)),
            Pending::Address => Value::Address(MailboxAddress::from_fd(fds.take_next()?)),
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn slot(&self, index: usize) -> Result<u64, MalformedMessage> {
        let at = index * SLOT_SIZE;
        let raw = self
            .bytes
            .get(at..at + SLOT_SIZE)
            .ok_or(MalformedMessage::TruncatedSlots {
                index,
                received: self.bytes.len(),
            })?;
        let mut bits = [0u8; SLOT_SIZE];
        bits.copy_from_slice(raw);
        Ok(u64::from_ne_bytes(bits))
    }

    fn string(&mut self) -> Result<Bytes, MalformedMessage> {
        let out_of_bounds = MalformedMessage::StringOutOfBounds {
            offset: self.cursor,
            received: self.bytes.len(),
        };
        let len = *self.bytes.get(self.cursor).ok_or(out_of_bounds.clone())? as usize;
        let start = self.cursor + 1;
        let raw = self.bytes.get(start..start + len).ok_or(out_of_bounds)?;
        self.cursor = start + len;
        Ok(Bytes::copy_from_slice(raw))
    }

    fn value(&mut self, slot: Slot) -> Result<Pending, MalformedMessage> {
        Ok(match slot {
            Slot::Number(n) => Pending::Ready(Value::Number(n)),
            Slot::Tag(Tag::Nil) => Pending::Ready(Value::Nil),
            Slot::Tag(Tag::True) => Pending::Ready(Value::Bool(true)),
            Slot::Tag(Tag::False) => Pending::Ready(Value::Bool(false)),
            Slot::Tag(Tag::String) => Pending::Ready(Value::String(self.string()?)),
            Slot::Tag(Tag::Fd) => Pending::Fd,
            Slot::Tag(Tag::Address) => Pending::Address,
        })
    }
}

fn ensure_fds(needed: usize, fds: &ReceivedFds) -> Result<(), MalformedMessage> {
    if needed > fds.len() {
        return Err(MalformedMessage::MissingDescriptors {
            needed,
            available: fds.len(),
        });
    }
    Ok(())
}

fn missing(fds: &ReceivedFds) -> MalformedMessage {
    MalformedMessage::MissingDescriptors {
        needed: fds.len() + 1,
        available: fds.len(),
    }
}

/// Decode an untrusted datagram.
///
/// On success the message's descriptors have been claimed from `fds` in
/// slot order; on failure `fds` is untouched.
pub fn decode(bytes: &[u8], fds: &mut ReceivedFds) -> Result<Message, MalformedMessage> {
    if bytes.len() < SCALAR_HEADER_SIZE {
        return Err(MalformedMessage::ShortDatagram {
            received: bytes.len(),
        });
    }
    let mut reader = Reader {
        bytes,
        cursor: MEMBERS_SIZE,
    };

    if reader.slot(0)? == TERMINATOR {
        let pending = reader.value(Slot::from_bits(reader.slot(1)?)?)?;
        ensure_fds(pending.needs_fd() as usize, fds)?;
        return pending.claim(fds).map(Message::Value).ok_or_else(|| missing(fds));
    }

    let mut entries: Vec<(Bytes, Pending)> = Vec::new();
    let mut terminated = false;
    for index in 0..MESSAGE_MAX_MEMBERS {
        let bits = reader.slot(index)?;
        if bits == TERMINATOR {
            terminated = true;
            break;
        }
        let slot = Slot::from_bits(bits)?;
        let key = reader.string()?;
        if entries.iter().any(|(k, _)| *k == key) {
            return Err(MalformedMessage::DuplicateKey);
        }
        let pending = reader.value(slot)?;
        entries.push((key, pending));
    }
    if !terminated {
        return Err(MalformedMessage::Unterminated);
    }

    ensure_fds(entries.iter().filter(|(_, p)| p.needs_fd()).count(), fds)?;
    let mut dict = BTreeMap::new();
    for (key, pending) in entries {
        let value = pending.claim(fds).ok_or_else(|| missing(fds))?;
        dict.insert(key, value);
    }
    Ok(Message::Dict(dict))
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::os::fd::FromRawFd;
    use std::os::unix::fs::MetadataExt;

    use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, mprotect, munmap};

    use super::*;

    /// In-process stand-in for the socket: duplicate what would be sent.
    fn deliver(encoded: Encoded<'_>) -> (ContainerMessage, usize, ReceivedFds) {
        let mut fds = ReceivedFds::new();
        for raw in encoded.raw_fds() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
            fds.push(borrowed.try_clone_to_owned().unwrap());
        }
        let mut message = ContainerMessage::zeroed();
        let len = encoded.as_bytes().len();
        message.as_mut_bytes()[..len].copy_from_slice(encoded.as_bytes());
        encoded.commit();
        (message, len, fds)
    }

    fn roundtrip(message: &Message) -> Message {
        let (container, len, mut fds) = deliver(encode(message).unwrap());
        let decoded = container.decode(len, &mut fds).unwrap();
        assert_eq!(fds.close_remaining(), 0);
        decoded
    }

    fn slot_hex(encoded: &Encoded<'_>, index: usize) -> String {
        let reader = Reader {
            bytes: encoded.as_bytes(),
            cursor: MEMBERS_SIZE,
        };
        format!("{:016x}", reader.slot(index).unwrap())
    }

    fn raw_message(slots: &[u64], strbuf: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; MEMBERS_SIZE];
        for (i, bits) in slots.iter().enumerate() {
            bytes[i * SLOT_SIZE..(i + 1) * SLOT_SIZE].copy_from_slice(&bits.to_ne_bytes());
        }
        bytes.extend_from_slice(strbuf);
        bytes
    }

    fn tag(t: Tag) -> u64 {
        Slot::Tag(t).to_bits()
    }

    #[test]
    fn boxed_tags_have_stable_bit_patterns() {
        let msg = Message::from(true);
        let encoded = encode(&msg).unwrap();
        let slots = format!("{} {}", slot_hex(&encoded, 0), slot_hex(&encoded, 1));
        insta::assert_snapshot!(slots, @"7ff8000000000001 7ff8000000000002");
    }

    #[test]
    fn scalars_roundtrip() {
        for value in [
            Value::Nil,
            Value::Bool(true),
            Value::Bool(false),
            Value::Number(0.0),
            Value::Number(-12.5),
            Value::Number(f64::INFINITY),
            Value::Number(f64::NEG_INFINITY),
            Value::from("hello"),
            Value::from(""),
        ] {
            let msg = Message::Value(value);
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn scalar_string_sits_at_start_of_buffer() {
        let msg = Message::from("abc");
        let encoded = encode(&msg).unwrap();
        assert_eq!(encoded.as_bytes().len(), MEMBERS_SIZE + 4);
        assert_eq!(&encoded.as_bytes()[MEMBERS_SIZE..], b"\x03abc");
    }

    #[test]
    fn dictionary_roundtrips_with_mixed_values() {
        let msg = Message::dict([
            ("a", Value::from(1.5)),
            ("b", Value::from("two")),
            ("c", Value::from(false)),
        ]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn full_dictionary_fits() {
        let msg = Message::dict((0..MESSAGE_MAX_MEMBERS - 1).map(|i| (format!("k{i}"), Value::from(i as f64))));
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn descriptor_moves_to_receiver() {
        let file = tempfile::tempfile().unwrap();
        let inode = file.metadata().unwrap().ino();
        let fd = FdBox::new(OwnedFd::from(file));
        let msg = Message::dict([("file", Value::Fd(fd.clone())), ("n", Value::from(1.0))]);

        let decoded = roundtrip(&msg);
        assert!(!fd.is_open(), "sent descriptor must close locally");

        let received = decoded.get("file").and_then(Value::as_fd).unwrap();
        let received_inode = received
            .with_fd(|fd| std::fs::File::from(fd.try_clone_to_owned().unwrap()).metadata().unwrap().ino())
            .unwrap();
        assert_eq!(received_inode, inode);
    }

    #[test]
    fn encode_failure_keeps_descriptor() {
        let file = tempfile::tempfile().unwrap();
        let fd = FdBox::new(OwnedFd::from(file));
        let msg = Message::dict([("f", Value::Fd(fd.clone())), ("x", Value::from(f64::NAN))]);
        assert!(matches!(encode(&msg), Err(EncodeError::NotANumber)));
        assert!(fd.is_open());
    }

    #[test]
    fn encode_rejects_bad_shapes() {
        assert!(matches!(
            encode(&Message::Dict(BTreeMap::new())),
            Err(EncodeError::EmptyDictionary)
        ));

        let too_many = Message::dict((0..MESSAGE_MAX_MEMBERS).map(|i| (format!("k{i}"), Value::from(true))));
        assert!(matches!(
            encode(&too_many),
            Err(EncodeError::TooManyMembers { count: 7, max: 6 })
        ));

        let nil = Message::dict([("gone", Value::Nil)]);
        assert!(matches!(encode(&nil), Err(EncodeError::NilInDictionary { .. })));

        assert!(matches!(
            encode(&Message::from(f64::NAN)),
            Err(EncodeError::NotANumber)
        ));

        let long = "x".repeat(MAX_STRING_LEN + 1);
        assert!(matches!(
            encode(&Message::from(long.as_str())),
            Err(EncodeError::StringTooLong { .. })
        ));
    }

    #[test]
    fn encode_rejects_buffer_overflow() {
        let big = "y".repeat(MAX_STRING_LEN);
        let msg = Message::dict([("a", big.as_str()), ("b", big.as_str())]);
        assert!(matches!(encode(&msg), Err(EncodeError::BufferOverflow { .. })));
    }

    #[test]
    fn short_datagram_is_malformed() {
        let mut fds = ReceivedFds::new();
        let err = decode(&[0u8; 15], &mut fds).unwrap_err();
        assert_eq!(err, MalformedMessage::ShortDatagram { received: 15 });
    }

    #[test]
    fn string_length_past_received_bytes_is_malformed() {
        // Claims 200 bytes but only 10 follow the prefix.
        let mut strbuf = vec![200u8];
        strbuf.extend_from_slice(&[b'z'; 10]);
        let bytes = raw_message(&[TERMINATOR, tag(Tag::String)], &strbuf);
        let err = decode(&bytes, &mut ReceivedFds::new()).unwrap_err();
        assert!(matches!(err, MalformedMessage::StringOutOfBounds { .. }));
    }

    #[test]
    fn decode_never_reads_past_received_bytes() {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = NonZeroUsize::new(2 * page).unwrap();
        let base = unsafe {
            mmap_anonymous(None, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, MapFlags::MAP_PRIVATE)
        }
        .unwrap();
        let guard = unsafe { base.byte_add(page) };
        unsafe { mprotect(guard, page, ProtFlags::PROT_NONE) }.unwrap();

        // A dictionary whose key claims 255 bytes, placed flush against the guard page.
        let bytes = raw_message(&[tag(Tag::True), TERMINATOR], &[255, b'k']);
        let start = unsafe { guard.cast::<u8>().as_ptr().sub(bytes.len()) };
        let region = unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), start, bytes.len());
            std::slice::from_raw_parts(start, bytes.len())
        };
        let err = decode(region, &mut ReceivedFds::new()).unwrap_err();
        assert!(matches!(err, MalformedMessage::StringOutOfBounds { .. }));

        unsafe { munmap(base, 2 * page) }.unwrap();
    }

    #[test]
    fn unknown_nan_pattern_is_malformed() {
        let bytes = raw_message(&[TERMINATOR, BOX_BASE | 0x9], &[]);
        let err = decode(&bytes, &mut ReceivedFds::new()).unwrap_err();
        assert_eq!(err, MalformedMessage::UnknownTag { bits: BOX_BASE | 0x9 });

        let quiet_nan_payload = 0x7FF8_0000_0001_0000u64;
        let bytes = raw_message(&[TERMINATOR, quiet_nan_payload], &[]);
        assert!(decode(&bytes, &mut ReceivedFds::new()).is_err());
    }

    #[test]
    fn duplicate_keys_are_malformed() {
        let bytes = raw_message(&[tag(Tag::True), tag(Tag::False), TERMINATOR], b"\x01k\x01k");
        let err = decode(&bytes, &mut ReceivedFds::new()).unwrap_err();
        assert_eq!(err, MalformedMessage::DuplicateKey);
    }

    #[test]
    fn dictionary_without_terminator_is_malformed() {
        let slots = [tag(Tag::True); MESSAGE_MAX_MEMBERS];
        let strbuf: Vec<u8> = (0..MESSAGE_MAX_MEMBERS as u8).flat_map(|i| [1, b'a' + i]).collect();
        let err = decode(&raw_message(&slots, &strbuf), &mut ReceivedFds::new()).unwrap_err();
        assert_eq!(err, MalformedMessage::Unterminated);
    }

    fn null_fds(n: usize) -> ReceivedFds {
        (0..n)
            .map(|_| OwnedFd::from(std::fs::File::open("/dev/null").unwrap()))
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn missing_descriptor_claims_nothing() {
        let bytes = raw_message(&[tag(Tag::Fd), tag(Tag::Fd), TERMINATOR], b"\x01a\x01b");
        let mut fds = null_fds(1);
        let err = decode(&bytes, &mut fds).unwrap_err();
        assert_eq!(
            err,
            MalformedMessage::MissingDescriptors {
                needed: 2,
                available: 1
            }
        );
        assert_eq!(fds.close_remaining(), 1);
    }

    #[test]
    fn malformed_tail_claims_nothing() {
        // First entry is a valid descriptor, second entry's key overruns.
        let bytes = raw_message(&[tag(Tag::Fd), tag(Tag::True), TERMINATOR], b"\x01a\x09b");
        let mut fds = null_fds(1);
        assert!(decode(&bytes, &mut fds).is_err());
        assert_eq!(fds.len(), 1);
    }

    #[test]
    fn surplus_descriptors_are_left_for_the_caller() {
        let bytes = raw_message(&[tag(Tag::Fd), tag(Tag::Address), TERMINATOR], b"\x01a\x01b");
        let mut fds = null_fds(3);
        let msg = decode(&bytes, &mut fds).unwrap();
        assert!(matches!(msg.get("a"), Some(Value::Fd(_))));
        assert!(matches!(msg.get("b"), Some(Value::Address(_))));
        // claimed + closed == delivered
        assert_eq!(fds.close_remaining(), 1);
    }

    #[test]
    fn descriptors_are_claimed_in_slot_order() {
        // Key order ("z" before "a") differs from the map's sorted order.
        let bytes = raw_message(&[tag(Tag::Fd), tag(Tag::Fd), TERMINATOR], b"\x01z\x01a");
        let first = tempfile::tempfile().unwrap();
        let second = tempfile::tempfile().unwrap();
        let first_inode = first.metadata().unwrap().ino();
        let mut fds: ReceivedFds = vec![OwnedFd::from(first), OwnedFd::from(second)].into();

        let msg = decode(&bytes, &mut fds).unwrap();
        let z = msg.get("z").and_then(Value::as_fd).unwrap();
        let z_inode = z
            .with_fd(|fd| {
                let raw = fd.as_raw_fd();
                let file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(raw) });
                file.metadata().unwrap().ino()
            })
            .unwrap();
        assert_eq!(z_inode, first_inode);
    }
}
