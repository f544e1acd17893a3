//! Logging setup and hex-dump diagnostics.
//!
//! A `slog` terminal logger built once at startup via `sloggers`. L1 lifecycle events log at
//! `Info`; the `-d` L2 (descriptor-set dump) and L3 (hex dump) categories
//! are gated behind their bits and logged at `Trace` so they carry no cost
//! when the flag is off and never fire without it.

use mio::Token;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

pub fn init(debug_enabled: bool) -> slog::Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(if debug_enabled { Severity::Trace } else { Severity::Info });
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger construction never fails")
}

/// Renders `buf` as a hex/ASCII dump: 8 bytes per row, a hex column then a
/// printable-ASCII column.
pub fn hex_dump(buf: &[u8]) -> String {
    const WIDTH: usize = 8;
    let mut out = String::new();

    for (row, chunk) in buf.chunks(WIDTH).enumerate() {
        out.push_str(&format!("{:04X}: ", row * WIDTH));
        for b in chunk {
            out.push_str(&format!("{:02X} ", b));
        }
        for _ in chunk.len()..WIDTH {
            out.push_str("   ");
        }
        out.push('\t');
        for &b in chunk {
            let c = if (0x20..0x7f).contains(&b) { b as char } else { '.' };
            out.push(c);
        }
        out.push('\n');
    }

    out
}

pub fn fmt_tokens(tokens: &[Token]) -> String {
    tokens.iter().map(|t| t.0.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_renders_printable_ascii() {
        let dump = hex_dump(b"hi");
        assert!(dump.contains("68 69"));
        assert!(dump.contains("hi"));
    }

    #[test]
    fn hex_dump_handles_multiple_rows() {
        let data: Vec<u8> = (0..20u8).collect();
        let dump = hex_dump(&data);
        assert_eq!(dump.lines().count(), 3);
    }

    #[test]
    fn hex_dump_replaces_non_printable_bytes_with_dot() {
        let dump = hex_dump(&[0x00, 0x01, 0xff]);
        assert!(dump.contains("..."));
    }

    #[test]
    fn fmt_tokens_joins_with_commas() {
        assert_eq!(fmt_tokens(&[Token(1), Token(2), Token(3)]), "1, 2, 3");
    }
}
