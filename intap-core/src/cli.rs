//! Command-line surface shared by both binaries.
//!
//! All flags are optional and order-independent; unknown arguments are
//! ignored by `clap`'s default behavior. `-d` bits gate the logging
//! categories described in `logging`.
//!
//! `clap`'s `long` flags are always double-dash, but the documented surface
//! uses single-dash `-fn`/`-bs`/`-bl`. `Args::parse_args` rewrites those
//! tokens to their `--fn`/`--bs`/`--bl` spelling before handing argv to
//! clap, so both binaries can keep accepting the single-dash form.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Bitwise-OR'd debug level: bit 0 = L1 basic, bit 1 = L2 fd list, bit 2 = L3 hex dump.
    #[arg(short = 'd', default_value_t = 0)]
    pub debug: u8,

    /// Override the listen port (local-buddy only; ignored by remote-buddy).
    #[arg(short = 'p')]
    pub port: Option<u16>,

    /// Override the config-file path.
    #[arg(long = "fn")]
    pub config_path: Option<String>,

    /// Override the receive buffer size.
    #[arg(long = "bs")]
    pub buffer_size: Option<usize>,

    /// Override the listen backlog.
    #[arg(long = "bl")]
    pub backlog: Option<u32>,
}

const LEGACY_SINGLE_DASH: &[&str] = &["-fn", "-bs", "-bl"];

/// Rewrites an exact `-fn`/`-bs`/`-bl` token to its `--fn`/`--bs`/`--bl`
/// double-dash spelling; every other token passes through unchanged.
fn normalize_legacy_flags(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if LEGACY_SINGLE_DASH.contains(&arg.as_str()) {
                format!("-{}", arg)
            } else {
                arg
            }
        })
        .collect()
}

impl Args {
    /// Parses the process's real argv, accepting both the `-fn`/`-bs`/`-bl`
    /// single-dash spelling and clap's own `--fn`/`--bs`/`--bl`.
    pub fn parse_args() -> Args {
        Args::parse_from(normalize_legacy_flags(std::env::args()))
    }
}

pub const DEBUG_L1: u8 = 1 << 0;
pub const DEBUG_L2: u8 = 1 << 1;
pub const DEBUG_L3: u8 = 1 << 2;

impl Args {
    pub fn l1(&self) -> bool {
        self.debug & DEBUG_L1 != 0
    }
    pub fn l2(&self) -> bool {
        self.debug & DEBUG_L2 != 0
    }
    pub fn l3(&self) -> bool {
        self.debug & DEBUG_L3 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_bits_are_independent() {
        let args = Args {
            debug: DEBUG_L1 | DEBUG_L3,
            port: None,
            config_path: None,
            buffer_size: None,
            backlog: None,
        };
        assert!(args.l1());
        assert!(!args.l2());
        assert!(args.l3());
    }

    #[test]
    fn parses_flags_in_any_order() {
        let args = Args::parse_from(["remote-buddy", "-p", "7777", "-d", "5", "--bs", "4096"]);
        assert_eq!(args.port, Some(7777));
        assert_eq!(args.debug, 5);
        assert_eq!(args.buffer_size, Some(4096));
    }

    #[test]
    fn legacy_single_dash_flags_are_normalized() {
        let argv = normalize_legacy_flags(
            ["remote-buddy", "-fn", "cfg.dat", "-bs", "2048", "-bl", "32"]
                .into_iter()
                .map(String::from),
        );
        let args = Args::parse_from(argv);
        assert_eq!(args.config_path.as_deref(), Some("cfg.dat"));
        assert_eq!(args.buffer_size, Some(2048));
        assert_eq!(args.backlog, Some(32));
    }

    #[test]
    fn double_dash_spelling_still_works_after_normalizing() {
        let argv = normalize_legacy_flags(
            ["remote-buddy", "--fn", "cfg.dat"].into_iter().map(String::from),
        );
        let args = Args::parse_from(argv);
        assert_eq!(args.config_path.as_deref(), Some("cfg.dat"));
    }
}
