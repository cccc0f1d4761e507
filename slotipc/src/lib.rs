//! # slotipc — slot-based request/response IPC over POSIX shared memory
//!
//! Multiple client processes submit compute requests to a single server
//! process through a fixed array of message slots in one shared memory
//! object. A named binary semaphore arbitrates every slot write; a counting
//! semaphore wakes the server's dispatcher; one semaphore per slot wakes a
//! blocking client when its response lands. Each slot cycles
//! `Free → RequestPending → Processing → ResponseReady → Free`.
//!
//! Clients survive server restarts: the server bumps a generation counter
//! in the region header on every start, and replaces the shared object
//! outright, so a client noticing either drift reconnects and reports
//! [`Error::ServerRestarted`] instead of consuming stale state.
//!
//! This crate holds everything both sides agree on — wire layout, shared
//! memory and semaphore wrappers, object names — plus the client library.
//! The server lives in the `slotipc_server` crate.
//!
//! ## Client usage
//!
//! ```ignore
//! let mut client = Client::connect(IpcConfig::default())?;
//! let sum = client.add(2, 3)?;                    // blocking
//! let id = client.concat("hello", "world")?;      // async
//! loop {
//!     match client.poll(id)? {
//!         Poll::Ready(reply) => break println!("{:?}", reply),
//!         Poll::Pending => std::thread::sleep(Duration::from_millis(10)),
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod layout;
pub mod pending;
pub mod sem;
pub mod shm;

pub use client::{Client, Poll, Reply, Value};
pub use config::IpcConfig;
pub use error::{Error, Result};
pub use layout::{
    Command, RequestId, SlotState, Status, MAX_RESULT_LEN, MAX_SLOTS, MAX_STRING_LEN, REGION_SIZE,
};
pub use pending::{AsyncOp, PendingRequest, PendingSet};
pub use sem::NamedSemaphore;
pub use shm::SharedMemory;
