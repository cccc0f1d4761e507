//! Client side of the shared-memory transport.
//!
//! A [`Client`] opens the server-created region and semaphores, then offers
//! two call styles:
//!
//! - blocking ([`Client::add`], [`Client::sub`]) — submit, then wait on the
//!   slot's semaphore until the response for *this* request id is present
//!   (semaphore wakeups from earlier slot cycles are filtered out);
//! - asynchronous ([`Client::multiply`], [`Client::divide`],
//!   [`Client::concat`], [`Client::search`]) — submit and get a
//!   [`RequestId`] to [`poll`](Client::poll) later.
//!
//! Every entry point first verifies it is still talking to the same server
//! incarnation: the shared object's `(device, inode)` and the region's
//! generation counter must match what was seen at connect time. On any
//! drift — or when the shared mutex stays unavailable past its retry
//! budget — the client tears everything down, reconnects to the fresh
//! region, and reports [`Error::ServerRestarted`] so the caller can
//! re-submit invalidated work (see [`PendingSet`](crate::PendingSet)).

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::IpcConfig;
use crate::error::{Error, Result};
use crate::layout::{
    cstr_bytes, encode_string, Command, MathArgs, RequestId, RequestPayload, SharedRegion, Slot,
    SlotState, Status, StringArgs, MAX_SLOTS, MAX_STRING_LEN, REGION_SIZE,
};
use crate::sem::NamedSemaphore;
use crate::shm::{live_identity, SharedMemory};

/// Budget for one shared-mutex acquisition attempt.
const MUTEX_WAIT: Duration = Duration::from_secs(1);
/// Mutex acquisition timeouts tolerated before declaring the server lost.
const MUTEX_TIMEOUT_RETRIES: usize = 5;
/// Budget for one slot-semaphore wait in a blocking call.
const SLOT_WAIT: Duration = Duration::from_secs(1);
/// Slot-semaphore attempts (timeouts and stale wakeups combined) before a
/// blocking call gives up and forces a reconnect.
const SLOT_WAIT_RETRIES: usize = 16;

/// Result of polling an asynchronous request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// The response was consumed; the slot is free again.
    Ready(Reply),
    /// The request is still pending or processing; poll again.
    Pending,
}

/// A consumed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub value: Value,
}

/// Response value, typed by the command that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Result of a math command.
    Number(i32),
    /// Result of `Concat`.
    Text(String),
    /// Result of `Search`; −1 when the needle is absent.
    Position(i32),
}

/// Connection to the server's shared region and semaphores.
///
/// Not reentrant: one `Client` belongs to one thread. Separate `Client`
/// instances (or processes) may run concurrently; the shared mutex
/// serializes them.
///
/// Dropping a client unmaps the region and closes every semaphore handle.
/// Clients never unlink the shared objects; the server owns them.
pub struct Client {
    cfg: IpcConfig,
    shm: SharedMemory,
    mutex: NamedSemaphore,
    notify: NamedSemaphore,
    slot_sems: Vec<NamedSemaphore>,
    known_generation: u64,
}

impl Client {
    /// Opens the shared region and all semaphores; caches the server
    /// generation. The server must already be running.
    pub fn connect(cfg: IpcConfig) -> Result<Self> {
        // SAFETY: the region was created with REGION_SIZE bytes by the
        // server and both sides compile the same layout module.
        let shm = unsafe { SharedMemory::open(&cfg.shm_name, REGION_SIZE)? };
        let mutex = NamedSemaphore::open(&cfg.mutex_name)?;
        let notify = NamedSemaphore::open(&cfg.notify_name)?;
        let mut slot_sems = Vec::with_capacity(MAX_SLOTS);
        for i in 0..MAX_SLOTS {
            slot_sems.push(NamedSemaphore::open(&cfg.slot_sem_name(i))?);
        }

        let mut client = Self {
            cfg,
            shm,
            mutex,
            notify,
            slot_sems,
            known_generation: 0,
        };
        client.known_generation = client.generation();
        debug!(generation = client.known_generation, "connected");
        Ok(client)
    }

    /// Blocking ADD. Returns the wrapped 32-bit sum.
    pub fn add(&mut self, a: i32, b: i32) -> Result<i32> {
        self.call_math_blocking(Command::Add, a, b)
    }

    /// Blocking SUB. Returns the wrapped 32-bit difference.
    pub fn sub(&mut self, a: i32, b: i32) -> Result<i32> {
        self.call_math_blocking(Command::Sub, a, b)
    }

    /// Asynchronous MUL. Poll the returned id for the product.
    pub fn multiply(&mut self, a: i32, b: i32) -> Result<RequestId> {
        self.submit_math(Command::Mul, a, b)
    }

    /// Asynchronous DIV. Division by zero surfaces as
    /// [`Status::DivByZero`] in the polled reply.
    pub fn divide(&mut self, a: i32, b: i32) -> Result<RequestId> {
        self.submit_math(Command::Div, a, b)
    }

    /// Asynchronous CONCAT of two strings of 1..=16 bytes each.
    pub fn concat(&mut self, s1: &str, s2: &str) -> Result<RequestId> {
        self.submit_string(Command::Concat, s1, s2)
    }

    /// Asynchronous SEARCH for the first occurrence of `needle` in
    /// `haystack`. A miss surfaces as [`Status::NotFound`] with
    /// position −1 in the polled reply.
    pub fn search(&mut self, haystack: &str, needle: &str) -> Result<RequestId> {
        self.submit_string(Command::Search, haystack, needle)
    }

    /// Polls an asynchronous request.
    ///
    /// The first poll that observes the response consumes it and frees the
    /// slot; later polls with the same id report
    /// [`Error::UnknownRequest`].
    pub fn poll(&mut self, id: RequestId) -> Result<Poll> {
        self.ensure_fresh_connection()?;
        self.lock_shared_mutex_recovering()?;

        // SAFETY: mutex held; see region().
        let region = unsafe { &mut *self.region() };
        if region.header.server_generation.load(Ordering::Acquire) != self.known_generation {
            let _ = self.mutex.post();
            return Err(self.reconnect());
        }

        for slot in region.slots.iter_mut() {
            if slot.request_id != id.0 {
                continue;
            }
            if slot.state() == Some(SlotState::ResponseReady) {
                let reply = read_reply(slot);
                slot.release();
                let _ = self.mutex.post();
                trace!(%id, status = %reply.status, "poll ready");
                return Ok(Poll::Ready(reply));
            }
            let _ = self.mutex.post();
            return Ok(Poll::Pending);
        }

        let _ = self.mutex.post();
        Err(Error::UnknownRequest(id))
    }

    fn submit_math(&mut self, cmd: Command, a: i32, b: i32) -> Result<RequestId> {
        let payload = RequestPayload {
            math: MathArgs { a, b },
        };
        let (_, id) = self.submit(cmd, payload)?;
        Ok(id)
    }

    fn submit_string(&mut self, cmd: Command, s1: &str, s2: &str) -> Result<RequestId> {
        validate_input(s1)?;
        validate_input(s2)?;
        let payload = RequestPayload {
            text: StringArgs {
                s1: encode_string(s1),
                s2: encode_string(s2),
            },
        };
        let (_, id) = self.submit(cmd, payload)?;
        Ok(id)
    }

    fn call_math_blocking(&mut self, cmd: Command, a: i32, b: i32) -> Result<i32> {
        let payload = RequestPayload {
            math: MathArgs { a, b },
        };
        let (slot_idx, id) = self.submit(cmd, payload)?;

        let mut attempts = 0;
        while attempts < SLOT_WAIT_RETRIES {
            if self.slot_sems[slot_idx].timed_wait(SLOT_WAIT)? {
                self.lock_shared_mutex_recovering()?;
                // SAFETY: mutex held; see region().
                let region = unsafe { &mut *self.region() };
                let slot = &mut region.slots[slot_idx];
                if slot.request_id == id.0 && slot.state() == Some(SlotState::ResponseReady) {
                    // SAFETY: math commands produce the number variant.
                    let value = unsafe { slot.response.number };
                    let status = Status::from_u32(slot.status).unwrap_or(Status::InternalError);
                    slot.release();
                    let _ = self.mutex.post();
                    return match status {
                        Status::Ok => Ok(value),
                        other => Err(Error::Op(other)),
                    };
                }
                // Wakeup from a previous slot cycle; not our response.
                let _ = self.mutex.post();
                attempts += 1;
            } else {
                self.ensure_fresh_connection()?;
                attempts += 1;
            }
        }

        // The response never arrived inside the budget; assume the server
        // went away with the slot in flight.
        Err(self.reconnect())
    }

    /// Reserves a free slot, publishes the request, and rings the server.
    fn submit(&mut self, cmd: Command, payload: RequestPayload) -> Result<(usize, RequestId)> {
        self.ensure_fresh_connection()?;
        self.lock_shared_mutex_recovering()?;

        // SAFETY: mutex held; see region().
        let region = unsafe { &mut *self.region() };
        if region.header.server_generation.load(Ordering::Acquire) != self.known_generation {
            let _ = self.mutex.post();
            return Err(self.reconnect());
        }

        let Some(idx) = region
            .slots
            .iter()
            .position(|s| s.state() == Some(SlotState::Free))
        else {
            let _ = self.mutex.post();
            return Err(Error::NoFreeSlots);
        };

        let id = region.header.next_request_id;
        region.header.next_request_id += 1;

        let slot = &mut region.slots[idx];
        slot.request_id = id;
        slot.client_pid = std::process::id() as i32;
        slot.command = cmd as u32;
        slot.request = payload;
        slot.set_state(SlotState::RequestPending);

        self.mutex.post()?;
        self.notify.post()?;
        trace!(%cmd, id, slot = idx, "submitted");
        Ok((idx, RequestId(id)))
    }

    /// Detects a replaced shared object or a bumped generation and, if so,
    /// reconnects and reports [`Error::ServerRestarted`].
    fn ensure_fresh_connection(&mut self) -> Result<()> {
        if self.shm_object_replaced() || self.generation() != self.known_generation {
            return Err(self.reconnect());
        }
        Ok(())
    }

    /// True when the name now resolves to a different object than the one
    /// this client mapped. A missing object is not "replaced": the server
    /// may be mid-restart, and the generation check catches the rest.
    fn shm_object_replaced(&self) -> bool {
        match (self.shm.identity(), live_identity(&self.cfg.shm_name)) {
            (Ok(current), Ok(Some(live))) => current != live,
            _ => false,
        }
    }

    /// Acquires the shared mutex with timeout-and-recheck semantics. After
    /// too many timeouts the holder is presumed dead and the client
    /// reconnects.
    fn lock_shared_mutex_recovering(&mut self) -> Result<()> {
        for _ in 0..MUTEX_TIMEOUT_RETRIES {
            if self.mutex.timed_wait(MUTEX_WAIT)? {
                return Ok(());
            }
            self.ensure_fresh_connection()?;
        }
        Err(self.reconnect())
    }

    /// Tears down and re-establishes the connection. Returns the error the
    /// caller should propagate: [`Error::ServerRestarted`] when the new
    /// connection is up, or the connect failure itself.
    fn reconnect(&mut self) -> Error {
        warn!(generation = self.known_generation, "reconnecting after server restart");
        match Client::connect(self.cfg.clone()) {
            Ok(fresh) => {
                // Old mapping and semaphore handles close on drop.
                *self = fresh;
                Error::ServerRestarted
            }
            Err(e) => e,
        }
    }

    fn region(&self) -> *mut SharedRegion {
        // Callers may only dereference mutably while holding the shared
        // mutex; the generation counter is atomic and may be read lock-free.
        self.shm.as_ptr().cast()
    }

    fn generation(&self) -> u64 {
        // SAFETY: the atomic header field is valid for the mapping's
        // lifetime and shared reads need no lock.
        unsafe { &(*self.region()).header.server_generation }.load(Ordering::Acquire)
    }
}

fn validate_input(s: &str) -> Result<()> {
    if s.is_empty() || s.len() > MAX_STRING_LEN || s.bytes().any(|b| b == 0) {
        return Err(Error::InvalidString);
    }
    Ok(())
}

fn read_reply(slot: &Slot) -> Reply {
    let status = Status::from_u32(slot.status).unwrap_or(Status::InternalError);
    let value = match Command::from_u32(slot.command) {
        Some(Command::Concat) => {
            // SAFETY: concat responses carry the text variant.
            let bytes = cstr_bytes(unsafe { &slot.response.text });
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        // SAFETY: search responses carry the position variant.
        Some(Command::Search) => Value::Position(unsafe { slot.response.position }),
        // SAFETY: math responses carry the number variant.
        _ => Value::Number(unsafe { slot.response.number }),
    };
    Reply { status, value }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_validation() {
        assert!(validate_input("a").is_ok());
        assert!(validate_input(&"a".repeat(MAX_STRING_LEN)).is_ok());
        assert!(matches!(validate_input(""), Err(Error::InvalidString)));
        assert!(matches!(
            validate_input(&"a".repeat(MAX_STRING_LEN + 1)),
            Err(Error::InvalidString)
        ));
        assert!(matches!(validate_input("a\0b"), Err(Error::InvalidString)));
    }

    #[test]
    fn reply_decoding_follows_the_command() {
        // SAFETY: all-zero bytes are a valid Slot.
        let mut slot: Slot = unsafe { std::mem::zeroed() };
        slot.command = Command::Concat as u32;
        slot.status = Status::Ok as u32;
        // SAFETY: writing the text variant of a freshly zeroed union.
        unsafe { slot.response.text[..10].copy_from_slice(b"helloworld") };
        let reply = read_reply(&slot);
        assert_eq!(reply.value, Value::Text("helloworld".to_string()));

        slot.command = Command::Search as u32;
        slot.status = Status::NotFound as u32;
        slot.response = crate::layout::ResponsePayload::zeroed();
        slot.response.position = -1;
        let reply = read_reply(&slot);
        assert_eq!(reply.status, Status::NotFound);
        assert_eq!(reply.value, Value::Position(-1));

        slot.command = Command::Add as u32;
        slot.status = Status::Ok as u32;
        slot.response = crate::layout::ResponsePayload::zeroed();
        slot.response.number = 79;
        assert_eq!(read_reply(&slot).value, Value::Number(79));
    }
}
