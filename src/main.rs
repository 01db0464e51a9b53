//! PhaseHound broker binary.
//!
//! Binds the local socket, autoloads addons, and runs the event loop until
//! SIGINT/SIGTERM or an `exit` command on `cli-control`. See the
//! `phasehound` library for the core subsystems.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;
use phasehound::broker::{self, BrokerConfig};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system
/// allocator (addon threads share this heap).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Modular software-radio host core.
#[derive(Parser, Debug)]
#[command(name = "phasehound", version, about)]
struct Cli {
    /// Broker socket path (default: /tmp/phasehound-<uid>/core.sock).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Do not scan the addon roots for loadable modules at startup.
    #[arg(long)]
    no_autoload: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = BrokerConfig {
        socket_path: cli.socket.unwrap_or_else(phasehound::socket::default_socket_path),
        autoload: !cli.no_autoload,
    };

    // SIGINT/SIGTERM raise the shutdown flag; the loop notices within its
    // poll timeout, stops plugins in reverse load order, and unlinks the
    // socket. A second SIGINT while shutdown is pending terminates with the
    // default action (register_conditional_default precedes register).
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register_conditional_default(
        signal_hook::consts::SIGINT,
        Arc::clone(&shutdown),
    )?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    // A listener-creation failure is the only non-zero exit.
    broker::run(&cfg, &shutdown)
}
