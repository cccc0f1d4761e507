//! slotipc-server binary: CLI parsing, signal wiring, and the run loop.

use std::sync::OnceLock;
use std::time::Duration;

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use slotipc::IpcConfig;
use slotipc_server::{Server, ServerConfig, ServerHandle, ShutdownMode};

#[derive(Parser, Debug)]
#[command(name = "slotipc-server")]
#[command(about = "Shared-memory compute IPC server")]
struct Cli {
    /// Worker threads per pool (default: derived from the core count)
    #[arg(short = 't', long = "threads", value_parser = clap::value_parser!(u16).range(1..))]
    threads: Option<u16>,

    /// Shutdown mode applied on SIGINT/SIGTERM
    #[arg(long = "shutdown", value_enum, default_value_t = ShutdownMode::Drain)]
    shutdown: ShutdownMode,

    /// Artificial MUL/DIV delay in milliseconds (0 disables)
    #[arg(long = "slow-op-delay-ms", default_value_t = 2000)]
    slow_op_delay_ms: u64,
}

static HANDLE: OnceLock<ServerHandle> = OnceLock::new();

// Signal handlers stick to async-signal-safe work: an atomic store plus a
// sem_post through the handle.
extern "C" fn on_shutdown_signal(_: libc::c_int) {
    if let Some(handle) = HANDLE.get() {
        handle.request_shutdown();
    }
}

extern "C" fn on_status_signal(_: libc::c_int) {
    if let Some(handle) = HANDLE.get() {
        handle.request_status();
    }
}

fn install_signal_handlers(handle: ServerHandle) {
    let _ = HANDLE.set(handle);

    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let status = SigAction::new(
        SigHandler::Handler(on_status_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: handlers are async-signal-safe, see above.
    unsafe {
        let _ = sigaction(Signal::SIGINT, &shutdown);
        let _ = sigaction(Signal::SIGTERM, &shutdown);
        let _ = sigaction(Signal::SIGUSR1, &status);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Startup failures, bad argv included, exit with 1.
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let server_cfg = ServerConfig {
        threads_per_pool: cli.threads.map(usize::from),
        shutdown: cli.shutdown,
        slow_op_delay: Duration::from_millis(cli.slow_op_delay_ms),
    };

    let server = match Server::start(IpcConfig::default(), server_cfg) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    install_signal_handlers(server.handle());

    let summary = server.run();
    info!(mode = %summary.mode, discarded = summary.discarded, "exit");
}
