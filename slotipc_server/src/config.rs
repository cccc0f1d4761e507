//! Server tuning knobs.

use std::fmt;
use std::time::Duration;

/// What happens to queued-but-unstarted work on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ShutdownMode {
    /// Finish every queued task before exiting.
    Drain,
    /// Drop the queue; only tasks already on a worker finish.
    Immediate,
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownMode::Drain => f.write_str("drain"),
            ShutdownMode::Immediate => f.write_str("immediate"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Worker threads per pool; `None` picks a value from the core count.
    pub threads_per_pool: Option<usize>,
    /// Shutdown mode applied on SIGINT/SIGTERM.
    pub shutdown: ShutdownMode,
    /// Artificial delay applied to MUL/DIV so asynchronous behavior is
    /// observable. Zero disables it; keep it well under the drain budget.
    pub slow_op_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            threads_per_pool: None,
            shutdown: ShutdownMode::Drain,
            slow_op_delay: Duration::from_secs(2),
        }
    }
}

/// Default pool width: half the cores minus one for the dispatcher,
/// never less than one thread.
pub fn default_threads_per_pool() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    if cores <= 2 {
        1
    } else {
        (cores - 1) / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_width_is_positive() {
        assert!(default_threads_per_pool() >= 1);
    }

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.threads_per_pool, None);
        assert_eq!(cfg.shutdown, ShutdownMode::Drain);
        assert_eq!(cfg.slow_op_delay, Duration::from_secs(2));
    }
}
