//! gpusched daemon entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use nix::unistd::Uid;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use gpusched::daemon::server::Server;
use gpusched::daemon::{Config, Daemon, DEFAULT_SOCKET};
use gpusched::util;

#[derive(Parser, Debug)]
#[command(
    name = "gpusched-daemon",
    about = "GPU process manager daemon: freeze, thaw, and migrate CUDA processes",
    version
)]
struct Args {
    /// Max host RAM for snapshots (e.g. 80G, 80000M; default 80% of host RAM)
    #[arg(long, value_parser = parse_size)]
    ram_budget: Option<i64>,

    /// Max disk space for hibernated snapshots (e.g. 500G)
    #[arg(long, value_parser = parse_size)]
    disk_budget: Option<i64>,

    /// Directory for hibernated process snapshots
    #[arg(long)]
    disk_dir: Option<PathBuf>,

    /// Directory for per-process log files
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Control socket path
    #[arg(short, long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,
}

fn parse_size(s: &str) -> Result<i64, String> {
    util::parse_size_mb(s)
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = Config::default();
    if let Some(mb) = args.ram_budget {
        cfg.ram_budget_mb = mb;
    }
    if let Some(mb) = args.disk_budget {
        cfg.disk_budget_mb = mb;
    }
    if let Some(dir) = args.disk_dir {
        cfg.disk_dir = dir;
    }
    if let Some(dir) = args.log_dir {
        cfg.log_dir = dir;
    }

    if !Uid::effective().is_root() {
        warn!("not running as root, cuda-checkpoint will likely fail");
    }

    let daemon = match Daemon::new(cfg) {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!(error = %e, "daemon setup failed");
            return ExitCode::FAILURE;
        }
    };

    let server = Server::new(daemon, args.socket);
    match server.listen_and_serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
