//! Server startup, dispatcher loop, and worker logic.
//!
//! Startup follows a strict order: singleton lock, generation bump, shared
//! region (unlink stale, create, zero, stamp header), semaphores, worker
//! pools, banner. The dispatcher then sleeps on the notify semaphore and,
//! per wakeup, claims every `RequestPending` slot under the shared mutex
//! and hands its index to the math or string pool. Workers copy operands
//! out under the mutex, compute unlocked, publish the response under the
//! mutex, and post the slot's semaphore.
//!
//! A worker-level failure is never fatal: the slot always ends up
//! `ResponseReady` with a status describing the problem. Only startup
//! failures and a requested shutdown terminate the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info};

use slotipc::config::IpcConfig;
use slotipc::layout::{
    cstr_bytes, Command, MathArgs, ResponsePayload, SharedRegion, SlotState, Status, MAX_RESULT_LEN,
    MAX_SLOTS, MAX_STRING_LEN, REGION_SIZE,
};
use slotipc::sem::NamedSemaphore;
use slotipc::shm::SharedMemory;

use crate::config::{default_threads_per_pool, ServerConfig, ShutdownMode};
use crate::error::{Result, ServerError};
use crate::generation::next_generation;
use crate::pool::ThreadPool;
use crate::singleton::SingletonLock;

/// Everything the dispatcher and both pools share.
struct Shared {
    shm: SharedMemory,
    mutex: NamedSemaphore,
    notify: NamedSemaphore,
    slot_sems: Vec<NamedSemaphore>,
    running: AtomicBool,
    status_requested: AtomicBool,
}

impl Shared {
    /// Callers may only dereference mutably while holding the mutex.
    fn region(&self) -> *mut SharedRegion {
        self.shm.as_ptr().cast()
    }
}

/// What [`Server::run`] reports after the dispatcher exits.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownSummary {
    pub mode: ShutdownMode,
    /// Queued tasks dropped by an immediate shutdown.
    pub discarded: usize,
}

/// Control handle for a running server.
///
/// Both methods are async-signal-safe (an atomic store plus a `sem_post`),
/// so signal handlers may call them directly. Tests use them in place of
/// signals.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Stops the dispatcher after the current wakeup; `run` then shuts the
    /// pools down in the configured mode.
    pub fn request_shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.notify.post();
    }

    /// Makes the dispatcher log a status snapshot on its next wakeup.
    pub fn request_status(&self) {
        self.shared.status_requested.store(true, Ordering::SeqCst);
        let _ = self.shared.notify.post();
    }
}

/// The server: owner of the shared region, the semaphores, and both pools.
pub struct Server {
    server_cfg: ServerConfig,
    shared: Arc<Shared>,
    math_pool: ThreadPool,
    string_pool: ThreadPool,
    generation: u64,
    threads_per_pool: usize,
    started_at: Instant,
    // Declared last: the lock releases only after the shared objects are
    // unlinked, so a racing second server cannot start against them.
    _lock: SingletonLock,
}

impl Server {
    /// Runs the startup sequence and returns a server ready to [`run`](Self::run).
    pub fn start(cfg: IpcConfig, server_cfg: ServerConfig) -> Result<Server> {
        let lock = SingletonLock::acquire(&cfg.lock_path).map_err(|e| {
            if SingletonLock::is_contended(&e) {
                ServerError::AlreadyRunning(cfg.lock_path.clone())
            } else {
                ServerError::Io(e)
            }
        })?;

        let generation = next_generation(&cfg.generation_path);

        // Replace any stale object so clients of a crashed predecessor see
        // an identity change, then start from an all-free region.
        SharedMemory::unlink(&cfg.shm_name)?;
        // SAFETY: the singleton lock is held; no live server owns an
        // object under this name.
        let shm = unsafe { SharedMemory::create(&cfg.shm_name, REGION_SIZE)? };
        // SAFETY: fresh private mapping of REGION_SIZE bytes; all-zero
        // bytes are a valid SharedRegion (every slot Free).
        unsafe {
            std::ptr::write_bytes(shm.as_ptr(), 0, REGION_SIZE);
            let region = shm.as_ptr() as *mut SharedRegion;
            (*region)
                .header
                .server_generation
                .store(generation, Ordering::Release);
            (*region).header.next_request_id = 1;
        }

        let mutex = NamedSemaphore::create(&cfg.mutex_name, 1)?;
        let notify = NamedSemaphore::create(&cfg.notify_name, 0)?;
        let mut slot_sems = Vec::with_capacity(MAX_SLOTS);
        for i in 0..MAX_SLOTS {
            slot_sems.push(NamedSemaphore::create(&cfg.slot_sem_name(i), 0)?);
        }

        let shared = Arc::new(Shared {
            shm,
            mutex,
            notify,
            slot_sems,
            running: AtomicBool::new(true),
            status_requested: AtomicBool::new(false),
        });

        let threads_per_pool = server_cfg
            .threads_per_pool
            .unwrap_or_else(default_threads_per_pool);
        let delay = server_cfg.slow_op_delay;

        let math_shared = Arc::clone(&shared);
        let math_pool = ThreadPool::new("math", threads_per_pool, move |idx| {
            process_math(&math_shared, idx, delay)
        })?;
        let string_shared = Arc::clone(&shared);
        let string_pool = ThreadPool::new("string", threads_per_pool, move |idx| {
            process_string(&string_shared, idx)
        })?;

        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        info!(
            pid = std::process::id(),
            generation,
            cores,
            threads_per_pool,
            shutdown = %server_cfg.shutdown,
            "server started, waiting for requests"
        );

        Ok(Server {
            server_cfg,
            shared,
            math_pool,
            string_pool,
            generation,
            threads_per_pool,
            started_at: Instant::now(),
            _lock: lock,
        })
    }

    /// Control handle usable from other threads and signal handlers.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Generation stamped into the region at startup.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Dispatcher loop. Returns after a shutdown request, once both pools
    /// finished according to the shutdown mode. Dropping the returned-from
    /// server unlinks every shared object.
    pub fn run(self) -> ShutdownSummary {
        loop {
            if let Err(e) = self.shared.notify.wait() {
                error!(error = %e, "notify wait failed, shutting down");
                break;
            }
            if self.shared.status_requested.swap(false, Ordering::SeqCst) {
                self.log_status();
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            self.dispatch_pending();
        }
        self.finish()
    }

    /// Claims every pending slot and routes it to the matching pool.
    ///
    /// The mutex is dropped around each pool submission, so a claimed slot
    /// can sit momentarily in `Processing` with no worker assigned; the
    /// next lines reacquire and resume the scan.
    fn dispatch_pending(&self) {
        if self.shared.mutex.wait().is_err() {
            return;
        }
        for i in 0..MAX_SLOTS {
            // SAFETY: mutex held.
            let slot = unsafe { &mut (*self.shared.region()).slots[i] };
            if slot.state() != Some(SlotState::RequestPending) {
                continue;
            }
            slot.set_state(SlotState::Processing);
            match Command::from_u32(slot.command) {
                Some(cmd) if cmd.is_math() => {
                    let _ = self.shared.mutex.post();
                    self.math_pool.submit(i);
                    if self.shared.mutex.wait().is_err() {
                        return;
                    }
                }
                Some(_) => {
                    let _ = self.shared.mutex.post();
                    self.string_pool.submit(i);
                    if self.shared.mutex.wait().is_err() {
                        return;
                    }
                }
                None => {
                    // Corrupt command tag: answer in place so the slot and
                    // any blocked client are not wedged.
                    slot.response = ResponsePayload::zeroed();
                    slot.status = Status::InternalError as u32;
                    slot.set_state(SlotState::ResponseReady);
                    let _ = self.shared.slot_sems[i].post();
                }
            }
        }
        let _ = self.shared.mutex.post();
    }

    fn log_status(&self) {
        let mut counts = [0usize; 4];
        if self.shared.mutex.wait().is_ok() {
            for i in 0..MAX_SLOTS {
                // SAFETY: mutex held.
                let slot = unsafe { &(*self.shared.region()).slots[i] };
                if let Some(state) = slot.state() {
                    counts[state as usize] += 1;
                }
            }
            let _ = self.shared.mutex.post();
        }

        let uptime = self.started_at.elapsed().as_secs();
        info!(
            pid = std::process::id(),
            uptime_secs = uptime,
            mode = %self.server_cfg.shutdown,
            threads_per_pool = self.threads_per_pool,
            math_queue = self.math_pool.pending_len(),
            string_queue = self.string_pool.pending_len(),
            slots_free = counts[SlotState::Free as usize],
            slots_pending = counts[SlotState::RequestPending as usize],
            slots_processing = counts[SlotState::Processing as usize],
            slots_ready = counts[SlotState::ResponseReady as usize],
            "status"
        );
    }

    fn finish(mut self) -> ShutdownSummary {
        let mode = self.server_cfg.shutdown;
        let pending = self.math_pool.pending_len() + self.string_pool.pending_len();
        match mode {
            ShutdownMode::Drain => {
                info!(pending, "shutdown requested, finishing queued tasks")
            }
            ShutdownMode::Immediate => {
                info!(pending, "shutdown requested, discarding queued tasks")
            }
        }

        let discarded = self.math_pool.shutdown(mode) + self.string_pool.shutdown(mode);
        if discarded > 0 {
            info!(discarded, "discarded queued tasks");
        }
        info!("server shut down cleanly");
        ShutdownSummary { mode, discarded }
    }
}

fn process_math(shared: &Shared, slot_index: usize, delay: Duration) {
    if shared.mutex.wait().is_err() {
        return;
    }
    // SAFETY: mutex held; math slots carry the math request variant.
    let (cmd, MathArgs { a, b }) = unsafe {
        let slot = &(*shared.region()).slots[slot_index];
        (Command::from_u32(slot.command), slot.request.math)
    };
    let _ = shared.mutex.post();

    if matches!(cmd, Some(Command::Mul) | Some(Command::Div)) && !delay.is_zero() {
        std::thread::sleep(delay);
    }

    let (value, status) = match cmd {
        Some(cmd) if cmd.is_math() => math_result(cmd, a, b),
        _ => (0, Status::InvalidInput),
    };
    let mut response = ResponsePayload::zeroed();
    response.number = value;
    publish_response(shared, slot_index, response, status);
}

fn process_string(shared: &Shared, slot_index: usize) {
    if shared.mutex.wait().is_err() {
        return;
    }
    // SAFETY: mutex held; string slots carry the text request variant.
    let (cmd, args) = unsafe {
        let slot = &(*shared.region()).slots[slot_index];
        (Command::from_u32(slot.command), slot.request.text)
    };
    let _ = shared.mutex.post();

    let (response, status) = match cmd {
        Some(cmd @ (Command::Concat | Command::Search)) => string_result(cmd, &args.s1, &args.s2),
        _ => (ResponsePayload::zeroed(), Status::InvalidInput),
    };
    publish_response(shared, slot_index, response, status);
}

/// Writes the response under the mutex and wakes the slot's waiter.
fn publish_response(
    shared: &Shared,
    slot_index: usize,
    response: ResponsePayload,
    status: Status,
) {
    if shared.mutex.wait().is_err() {
        return;
    }
    // SAFETY: mutex held; this worker owns the Processing slot.
    unsafe {
        let slot = &mut (*shared.region()).slots[slot_index];
        slot.response = response;
        slot.status = status as u32;
        slot.set_state(SlotState::ResponseReady);
    }
    let _ = shared.mutex.post();
    let _ = shared.slot_sems[slot_index].post();
}

/// Two's-complement arithmetic on the operands.
fn math_result(cmd: Command, a: i32, b: i32) -> (i32, Status) {
    match cmd {
        Command::Add => (a.wrapping_add(b), Status::Ok),
        Command::Sub => (a.wrapping_sub(b), Status::Ok),
        Command::Mul => (a.wrapping_mul(b), Status::Ok),
        Command::Div if b == 0 => (0, Status::DivByZero),
        Command::Div => (a.wrapping_div(b), Status::Ok),
        _ => (0, Status::InvalidInput),
    }
}

/// Concat or search over NUL-terminated operands. Lengths are re-checked
/// here because the payload bytes come from another process.
fn string_result(
    cmd: Command,
    s1: &[u8; MAX_STRING_LEN + 1],
    s2: &[u8; MAX_STRING_LEN + 1],
) -> (ResponsePayload, Status) {
    let mut response = ResponsePayload::zeroed();
    let a = cstr_bytes(s1);
    let b = cstr_bytes(s2);
    if a.is_empty() || a.len() > MAX_STRING_LEN || b.is_empty() || b.len() > MAX_STRING_LEN {
        return (response, Status::StrTooLong);
    }

    match cmd {
        Command::Concat => {
            if a.len() + b.len() > MAX_RESULT_LEN - 1 {
                return (response, Status::StrTooLong);
            }
            // SAFETY: writing the text variant of a zeroed union; the zero
            // fill already provides the NUL terminator.
            unsafe {
                response.text[..a.len()].copy_from_slice(a);
                response.text[a.len()..a.len() + b.len()].copy_from_slice(b);
            }
            (response, Status::Ok)
        }
        Command::Search => match a.windows(b.len()).position(|w| w == b) {
            Some(pos) => {
                response.position = pos as i32;
                (response, Status::Ok)
            }
            None => {
                response.position = -1;
                (response, Status::NotFound)
            }
        },
        _ => (response, Status::InvalidInput),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotipc::layout::encode_string;

    #[test]
    fn math_wraps_like_twos_complement() {
        assert_eq!(math_result(Command::Add, 2, 3), (5, Status::Ok));
        assert_eq!(math_result(Command::Sub, 10, 50), (-40, Status::Ok));
        assert_eq!(
            math_result(Command::Add, i32::MAX, 1),
            (i32::MIN, Status::Ok)
        );
        assert_eq!(
            math_result(Command::Mul, i32::MAX, 2),
            (i32::MAX.wrapping_mul(2), Status::Ok)
        );
        assert_eq!(
            math_result(Command::Div, i32::MIN, -1),
            (i32::MIN, Status::Ok)
        );
    }

    #[test]
    fn division_truncates_toward_zero() {
        assert_eq!(math_result(Command::Div, 10, 3), (3, Status::Ok));
        assert_eq!(math_result(Command::Div, -7, 2), (-3, Status::Ok));
        assert_eq!(math_result(Command::Div, 10, 0), (0, Status::DivByZero));
    }

    #[test]
    fn concat_joins_and_terminates() {
        let (resp, status) =
            string_result(Command::Concat, &encode_string("hello"), &encode_string("world"));
        assert_eq!(status, Status::Ok);
        // SAFETY: concat produced the text variant.
        let text = unsafe { resp.text };
        assert_eq!(cstr_bytes(&text), b"helloworld");

        let max = "a".repeat(MAX_STRING_LEN);
        let (resp, status) =
            string_result(Command::Concat, &encode_string(&max), &encode_string(&max));
        assert_eq!(status, Status::Ok);
        let text = unsafe { resp.text };
        assert_eq!(cstr_bytes(&text).len(), 2 * MAX_STRING_LEN);
        assert_eq!(text[MAX_RESULT_LEN - 1], 0);
    }

    #[test]
    fn search_finds_first_occurrence() {
        let (resp, status) =
            string_result(Command::Search, &encode_string("abcdef"), &encode_string("cd"));
        assert_eq!(status, Status::Ok);
        assert_eq!(unsafe { resp.position }, 2);

        let (resp, status) =
            string_result(Command::Search, &encode_string("abcabc"), &encode_string("abc"));
        assert_eq!(status, Status::Ok);
        assert_eq!(unsafe { resp.position }, 0);
    }

    #[test]
    fn search_miss_reports_not_found() {
        let (resp, status) =
            string_result(Command::Search, &encode_string("abcdef"), &encode_string("zz"));
        assert_eq!(status, Status::NotFound);
        assert_eq!(unsafe { resp.position }, -1);

        // Needle longer than haystack can never match.
        let (resp, status) =
            string_result(Command::Search, &encode_string("ab"), &encode_string("abc"));
        assert_eq!(status, Status::NotFound);
        assert_eq!(unsafe { resp.position }, -1);
    }

    #[test]
    fn unterminated_operand_is_rejected() {
        let unterminated = [b'x'; MAX_STRING_LEN + 1];
        let (_, status) = string_result(Command::Concat, &unterminated, &encode_string("ok"));
        assert_eq!(status, Status::StrTooLong);

        let empty = [0u8; MAX_STRING_LEN + 1];
        let (_, status) = string_result(Command::Search, &encode_string("ok"), &empty);
        assert_eq!(status, Status::StrTooLong);
    }
}
