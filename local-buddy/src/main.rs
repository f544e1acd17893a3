//! Binary entry point for local-buddy: parses the command line, loads the
//! config file it names (or the default), and runs the event loop until a
//! signal or a fatal error stops it.

use intap_core::cli::Args;
use intap_core::config::{Config, ConfigProvider};
use intap_core::local::LocalBuddy;
use intap_core::logging;
use std::net::SocketAddr;
use std::process::ExitCode;

const DEFAULT_CONFIG_PATH: &str = "config-local.dat";
const DEFAULT_LISTEN_PORT: u16 = 7777;
const DEFAULT_BACKLOG: u32 = 16;

fn main() -> ExitCode {
    let args = Args::parse_args();
    let logger = logging::init(args.debug != 0);

    let config_path = args.config_path.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            slog::error!(logger, "failed to read config file"; "path" => %config_path, "error" => %e);
            return ExitCode::FAILURE;
        }
    };

    let port = args.port.or_else(|| config.listen_port()).unwrap_or(DEFAULT_LISTEN_PORT);
    let backlog = args.backlog.unwrap_or(DEFAULT_BACKLOG);
    let listen_addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));

    slog::info!(logger, "starting local-buddy"; "listen" => %listen_addr);

    let mut buddy = match LocalBuddy::new(listen_addr, backlog, logger.clone(), &args) {
        Ok(b) => b,
        Err(e) => {
            slog::error!(logger, "startup failed"; "error" => %e);
            return ExitCode::FAILURE;
        }
    };

    match buddy.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            slog::error!(logger, "local-buddy exited with error"; "error" => %e);
            ExitCode::FAILURE
        }
    }
}
