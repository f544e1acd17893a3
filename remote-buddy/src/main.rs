//! Binary entry point for remote-buddy: raises the tunnel to local-buddy,
//! then binds the REST server's own address to intercept its traffic.
//! Unlike local-buddy, a failed startup dial is always fatal — there is
//! nothing useful this process can do without its one tunnel.

use intap_core::cli::Args;
use intap_core::config::{Config, ConfigProvider};
use intap_core::logging;
use intap_core::remote::RemoteBuddy;
use std::process::ExitCode;

const DEFAULT_CONFIG_PATH: &str = "config-remote.dat";
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

    let (local_buddy_addr, rest_addr, database_addr) =
        match (config.local_buddy(), config.rest_server(), config.database()) {
            (Some(l), Some(r), Some(d)) => (l, r, d),
            _ => {
                slog::error!(logger, "config must set Local_Buddy, RESTServer_Address and Database_Address");
                return ExitCode::FAILURE;
            }
        };

    let backlog = args.backlog.unwrap_or(DEFAULT_BACKLOG);

    slog::info!(logger, "starting remote-buddy";
        "local_buddy" => %local_buddy_addr, "rest" => %rest_addr, "database" => %database_addr);

    let mut buddy = match RemoteBuddy::new(
        local_buddy_addr.into(),
        rest_addr.into(),
        database_addr.into(),
        backlog,
        logger.clone(),
        &args,
    ) {
        Ok(b) => b,
        Err(e) => {
            slog::error!(logger, "startup failed"; "error" => %e);
            return ExitCode::FAILURE;
        }
    };

    match buddy.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            slog::error!(logger, "remote-buddy exited with error"; "error" => %e);
            ExitCode::FAILURE
        }
    }
}
