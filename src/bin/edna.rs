//! edna daemon entry point: CLI parsing, config load, daemonisation, run.

use std::path::PathBuf;

use structopt::StructOpt;

use edna::config::{self, DEFAULT_CONFIG_PATH};
use edna::daemon;

#[derive(StructOpt)]
#[structopt(
    name = "edna",
    about = "Emulator Daemon for NFC Applications",
    setting = structopt::clap::AppSettings::ColoredHelp,
    setting = structopt::clap::AppSettings::DisableVersion
)]
struct Opts {
    /// Run in the foreground instead of forking to the background.
    #[structopt(short = "f", long = "foreground")]
    foreground: bool,

    /// Path to the configuration file.
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Path to the PID file (overrides the configuration file's value).
    #[structopt(short = "p", long = "pidfile", parse(from_os_str))]
    pidfile: Option<PathBuf>,

    /// Print the version and exit.
    #[structopt(short = "v", long = "version")]
    version: bool,
}

fn main() {
    let opts = Opts::from_args();

    if opts.version {
        println!("edna {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    let config_path = opts.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut cfg = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("edna: {e}");
            std::process::exit(1);
        }
    };

    if opts.foreground {
        cfg.daemon.fork = false;
    }

    daemon::init_logging(&cfg.log.level);

    let pidfile = daemon::resolve_pidfile(opts.pidfile, &cfg);
    if cfg.daemon.fork {
        if let Err(e) = daemon::daemonize(&pidfile) {
            log::error!("failed to fork to background: {e}");
            std::process::exit(1);
        }
    }

    let socket_path = std::path::PathBuf::from(daemon::SOCKET_PATH);
    if let Err(e) = daemon::run(cfg, &socket_path) {
        log::error!("fatal error: {e}");
        std::process::exit(1);
    }
}
