//! Process lifecycle: logging, optional fork-to-background with a PID
//! file, signal handling, and thread orchestration for the CRS and EE.
//!
//! Signal policy grounded in original_source/src/bin/edna_main.cpp's
//! handler table, implemented with `signal_hook` the way
//! Actyx-Actyx's `node/src/util.rs` registers its shutdown handler: an
//! `AtomicBool` flag flipped from the signal handler, observed by the main
//! loop rather than doing work inside the handler itself.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use signal_hook::consts::*;

use crate::config::Config;
use crate::engine::Engine;
use crate::error::HardwareError;
use crate::hardware::Hardware;
use crate::registry::Registry;
use crate::server::Server;

/// Rendezvous socket path, unchanged from spec.md §6.
pub const SOCKET_PATH: &str = "/tmp/edna-comm";

/// Signals that merely get logged; the process keeps running.
const SURVIVABLE_SIGNALS: &[libc::c_int] = &[
    SIGABRT, SIGBUS, SIGFPE, SIGILL, SIGPIPE, SIGQUIT, SIGSYS, SIGXCPU, SIGXFSZ,
];

/// Signals that request an orderly shutdown.
const SHUTDOWN_SIGNALS: &[libc::c_int] = &[SIGTERM, SIGINT];

pub fn init_logging(level: &str) {
    let level = match level {
        "error" => log::LevelFilter::Error,
        "warning" | "warn" => log::LevelFilter::Warn,
        "debug" => log::LevelFilter::Debug,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

/// Fork to the background, writing `pidfile` from the parent before it
/// exits. Mirrors edna_main.cpp's single fork (no double-fork/session
/// leadership dance -- the original daemon doesn't detach from its
/// controlling terminal beyond the one fork either).
pub fn daemonize(pidfile: &Path) -> std::io::Result<()> {
    // SAFETY: fork() is called before any additional threads exist in this
    // process; the child immediately either execs nothing further or
    // proceeds single-threaded into `run`.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if pid > 0 {
        let mut file = fs::File::create(pidfile)?;
        writeln!(file, "{pid}")?;
        std::process::exit(0);
    }
    Ok(())
}

/// Install the signal handlers described in SPEC_FULL.md §2 item 6,
/// returning the flag the run loop should watch for shutdown requests.
pub fn install_signal_handlers() -> std::io::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));

    for &sig in SHUTDOWN_SIGNALS {
        let running = running.clone();
        unsafe {
            signal_hook::low_level::register(sig, move || {
                running.store(false, Ordering::SeqCst);
            })?;
        }
    }

    for &sig in SURVIVABLE_SIGNALS {
        unsafe {
            signal_hook::low_level::register(sig, move || {
                log::warn!("received signal {sig}, continuing");
            })?;
        }
    }

    unsafe {
        signal_hook::low_level::register(SIGSEGV, || {
            log::error!("received SIGSEGV, exiting");
            std::process::exit(139);
        })?;
    }

    Ok(running)
}

/// Wire up the registry, CRS and EE and run them to completion (until a
/// shutdown signal arrives or the engine hits a fatal hardware error).
pub fn run(config: Config, socket_path: &Path) -> Result<(), HardwareError> {
    let running = install_signal_handlers()?;

    let registry = Arc::new(Mutex::new(Registry::new()));

    let hardware = Hardware::connect(&config.emulation.reader)?;
    let engine = Engine::new(hardware, config.emulation, registry.clone(), running.clone());

    let server = Server::bind(socket_path, registry.clone(), running.clone())
        .expect("failed to bind rendezvous socket");

    let server_handle = spawn_with_name("edna-crs", move || server.run());
    let engine_result = engine.run();

    running.store(false, Ordering::SeqCst);
    server_handle.join().expect("server thread panicked");

    engine_result
}

/// Named thread spawn, matching Actyx-Actyx's `util::spawn_with_name`:
/// gives each long-lived thread a name visible in `ps`/`top` rather than
/// the default anonymous one.
fn spawn_with_name<F, T>(name: &str, f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("failed to spawn thread")
}

pub fn resolve_pidfile(cli_pidfile: Option<PathBuf>, config: &Config) -> PathBuf {
    cli_pidfile.unwrap_or_else(|| PathBuf::from(&config.daemon.pidfile))
}
