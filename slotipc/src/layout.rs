//! Binary layout of the shared region.
//!
//! Every process maps the same `/dev/shm` object and interprets it through
//! the types in this module, so all of them are `#[repr(C)]`, fixed-width,
//! and pointer-free. The region is a header followed by a fixed array of
//! message slots:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ SharedHeader                                             │
//! │   server_generation (8B atomic) │ next_request_id (8B)   │
//! ├──────────────────────────────────────────────────────────┤
//! │ Slot[0]   state │ request_id │ pid │ command │ req │ ... │
//! ├──────────────────────────────────────────────────────────┤
//! │ ...                                                      │
//! ├──────────────────────────────────────────────────────────┤
//! │ Slot[MAX_SLOTS - 1]                                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! `server_generation` is an atomic so clients can read it without the
//! shared mutex; every other field is written only while the mutex is held.

use std::fmt;
use std::sync::atomic::AtomicU64;

/// Number of message slots (maximum concurrent in-flight requests).
pub const MAX_SLOTS: usize = 16;

/// Maximum length of an input string in bytes, excluding the terminator.
pub const MAX_STRING_LEN: usize = 16;

/// Maximum length of a result string: two inputs plus a NUL terminator.
pub const MAX_RESULT_LEN: usize = 2 * MAX_STRING_LEN + 1;

/// Request id 0 is reserved and never assigned to a real request.
pub const NIL_REQUEST_ID: u64 = 0;

/// Opaque handle for an in-flight asynchronous request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operation requested by a client. Stored in `Slot::command` as a `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Concat = 4,
    Search = 5,
}

impl Command {
    /// Convert from the shared-memory tag. `None` for corrupt tags.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Command::Add),
            1 => Some(Command::Sub),
            2 => Some(Command::Mul),
            3 => Some(Command::Div),
            4 => Some(Command::Concat),
            5 => Some(Command::Search),
            _ => None,
        }
    }

    /// True for commands handled by the math pool.
    pub fn is_math(self) -> bool {
        matches!(self, Command::Add | Command::Sub | Command::Mul | Command::Div)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Add => "add",
            Command::Sub => "sub",
            Command::Mul => "mul",
            Command::Div => "div",
            Command::Concat => "concat",
            Command::Search => "search",
        };
        f.write_str(name)
    }
}

/// Outcome of an operation, written by the server into `Slot::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    DivByZero = 1,
    NotFound = 2,
    StrTooLong = 3,
    InvalidInput = 4,
    InternalError = 5,
}

impl Status {
    /// Convert from the shared-memory tag. `None` for corrupt tags.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Status::Ok),
            1 => Some(Status::DivByZero),
            2 => Some(Status::NotFound),
            3 => Some(Status::StrTooLong),
            4 => Some(Status::InvalidInput),
            5 => Some(Status::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Status::Ok => "ok",
            Status::DivByZero => "division by zero",
            Status::NotFound => "not found",
            Status::StrTooLong => "string too long",
            Status::InvalidInput => "invalid input",
            Status::InternalError => "internal error",
        };
        f.write_str(msg)
    }
}

/// State of a message slot.
///
/// Transitions (always under the shared mutex):
/// `Free → RequestPending → Processing → ResponseReady → Free`,
/// plus a reset of every slot to `Free` when the server reinitializes
/// the region on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Free = 0,
    RequestPending = 1,
    Processing = 2,
    ResponseReady = 3,
}

impl SlotState {
    /// Convert from the shared-memory tag. `None` for corrupt tags.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::RequestPending),
            2 => Some(SlotState::Processing),
            3 => Some(SlotState::ResponseReady),
            _ => None,
        }
    }
}

/// Operands for `Add`/`Sub`/`Mul`/`Div`.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MathArgs {
    pub a: i32,
    pub b: i32,
}

/// Operands for `Concat`/`Search`, NUL-terminated in place.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct StringArgs {
    pub s1: [u8; MAX_STRING_LEN + 1],
    pub s2: [u8; MAX_STRING_LEN + 1],
}

/// Request operands, interpreted according to `Slot::command`.
#[derive(Clone, Copy)]
#[repr(C)]
pub union RequestPayload {
    pub math: MathArgs,
    pub text: StringArgs,
}

impl RequestPayload {
    /// All-zero payload. Valid for every variant of the union.
    pub fn zeroed() -> Self {
        // SAFETY: every field of the union is valid as all-zero bytes.
        unsafe { std::mem::zeroed() }
    }
}

/// Response value, interpreted according to `Slot::command`.
///
/// Workers zero the whole union before writing so unoccupied bytes never
/// leak data from a previous request sharing the slot.
#[derive(Clone, Copy)]
#[repr(C)]
pub union ResponsePayload {
    pub number: i32,
    pub text: [u8; MAX_RESULT_LEN],
    pub position: i32,
}

impl ResponsePayload {
    /// All-zero payload. Valid for every variant of the union.
    pub fn zeroed() -> Self {
        // SAFETY: every field of the union is valid as all-zero bytes.
        unsafe { std::mem::zeroed() }
    }
}

/// A single message slot carrying one request and its eventual response.
#[repr(C)]
pub struct Slot {
    /// `SlotState` tag.
    pub state: u32,
    /// Id assigned at submission; `NIL_REQUEST_ID` while the slot is free.
    pub request_id: u64,
    /// Pid of the submitting client.
    pub client_pid: i32,
    /// `Command` tag.
    pub command: u32,
    pub request: RequestPayload,
    pub response: ResponsePayload,
    /// `Status` tag, valid once the slot is `ResponseReady`.
    pub status: u32,
}

impl Slot {
    /// Decoded slot state, `None` when the tag is corrupt.
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u32(self.state)
    }

    pub fn set_state(&mut self, state: SlotState) {
        self.state = state as u32;
    }

    /// Marks the slot free for reuse after its response was consumed.
    /// Clears the request id so later polls report the id as unknown.
    pub fn release(&mut self) {
        self.request_id = NIL_REQUEST_ID;
        self.set_state(SlotState::Free);
    }
}

/// Header at offset 0 of the shared region.
#[repr(C)]
pub struct SharedHeader {
    /// Bumped once per server start. Readable without the mutex.
    pub server_generation: AtomicU64,
    /// Next id to hand out. Written only under the mutex.
    pub next_request_id: u64,
}

/// The entire shared region.
#[repr(C)]
pub struct SharedRegion {
    pub header: SharedHeader,
    pub slots: [Slot; MAX_SLOTS],
}

/// Size of the mapping every process creates.
pub const REGION_SIZE: usize = std::mem::size_of::<SharedRegion>();

// Layout lock-in. A silent size drift would desynchronize processes built
// from different revisions, so pin the exact numbers.
const _: () = assert!(std::mem::size_of::<MathArgs>() == 8);
const _: () = assert!(std::mem::size_of::<StringArgs>() == 34);
const _: () = assert!(std::mem::size_of::<RequestPayload>() == 36);
const _: () = assert!(std::mem::size_of::<ResponsePayload>() == 36);
const _: () = assert!(std::mem::size_of::<Slot>() == 104);
const _: () = assert!(std::mem::size_of::<SharedHeader>() == 16);
const _: () = assert!(REGION_SIZE == 16 + MAX_SLOTS * 104);
const _: () = assert!(std::mem::align_of::<SharedRegion>() == 8);

/// Copies `s` into a NUL-terminated fixed buffer.
///
/// The caller must have validated `s.len() <= MAX_STRING_LEN`.
pub fn encode_string(s: &str) -> [u8; MAX_STRING_LEN + 1] {
    debug_assert!(s.len() <= MAX_STRING_LEN);
    let mut buf = [0u8; MAX_STRING_LEN + 1];
    buf[..s.len()].copy_from_slice(s.as_bytes());
    buf
}

/// Bytes of a NUL-terminated buffer up to (excluding) the terminator.
/// A buffer with no terminator yields the whole buffer, which callers
/// treat as over-length.
pub fn cstr_bytes(buf: &[u8]) -> &[u8] {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    &buf[..len]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_tags_round_trip() {
        for cmd in [
            Command::Add,
            Command::Sub,
            Command::Mul,
            Command::Div,
            Command::Concat,
            Command::Search,
        ] {
            assert_eq!(Command::from_u32(cmd as u32), Some(cmd));
        }
        assert_eq!(Command::from_u32(6), None);
    }

    #[test]
    fn status_tags_round_trip() {
        for st in [
            Status::Ok,
            Status::DivByZero,
            Status::NotFound,
            Status::StrTooLong,
            Status::InvalidInput,
            Status::InternalError,
        ] {
            assert_eq!(Status::from_u32(st as u32), Some(st));
        }
        assert_eq!(Status::from_u32(42), None);
    }

    #[test]
    fn slot_state_tags_round_trip() {
        for st in [
            SlotState::Free,
            SlotState::RequestPending,
            SlotState::Processing,
            SlotState::ResponseReady,
        ] {
            assert_eq!(SlotState::from_u32(st as u32), Some(st));
        }
        assert_eq!(SlotState::from_u32(4), None);
    }

    #[test]
    fn math_commands_split_from_string_commands() {
        assert!(Command::Add.is_math());
        assert!(Command::Div.is_math());
        assert!(!Command::Concat.is_math());
        assert!(!Command::Search.is_math());
    }

    #[test]
    fn string_encode_decode() {
        let buf = encode_string("hello");
        assert_eq!(cstr_bytes(&buf), b"hello");

        let max = "a".repeat(MAX_STRING_LEN);
        let buf = encode_string(&max);
        assert_eq!(cstr_bytes(&buf), max.as_bytes());
        assert_eq!(buf[MAX_STRING_LEN], 0);
    }

    #[test]
    fn cstr_bytes_without_terminator_returns_whole_buffer() {
        let buf = [b'x'; 7];
        assert_eq!(cstr_bytes(&buf).len(), 7);
    }

    #[test]
    fn released_slot_forgets_its_request_id() {
        // SAFETY: all-zero bytes are a valid Slot (Free, nil id).
        let mut slot: Slot = unsafe { std::mem::zeroed() };
        slot.request_id = 17;
        slot.set_state(SlotState::ResponseReady);
        slot.release();
        assert_eq!(slot.state(), Some(SlotState::Free));
        assert_eq!(slot.request_id, NIL_REQUEST_ID);
    }
}
