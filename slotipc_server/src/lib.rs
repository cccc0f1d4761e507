//! # slotipc_server — the server side of slotipc
//!
//! Owns the shared region and every semaphore, dispatches client requests
//! to two worker pools (math: ADD/SUB/MUL/DIV, string: CONCAT/SEARCH), and
//! enforces the one-server-per-host rule through an advisory file lock and
//! a per-start generation counter.
//!
//! The `slotipc-server` binary wires this to the CLI and signals; tests
//! drive a [`Server`] in-process through its [`ServerHandle`].

pub mod config;
pub mod error;
pub mod generation;
pub mod pool;
pub mod server;
pub mod singleton;

pub use config::{default_threads_per_pool, ServerConfig, ShutdownMode};
pub use error::{Result, ServerError};
pub use generation::next_generation;
pub use pool::ThreadPool;
pub use server::{Server, ServerHandle, ShutdownSummary};
pub use singleton::SingletonLock;
