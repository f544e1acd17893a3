//! Key/value configuration file reader.
//!
//! A runnable binary needs a config-file reader, built here to match the
//! reference format (`Read_Config`): one or more whitespace-separated, double-quoted
//! `"key" "value"` pairs per line, read with the same quoted-token
//! semantics as `std::ifstream >> std::quoted(...)` (a backslash escapes
//! the following character inside a quoted token).
//!
//! The event-loop constructors in `local`/`remote` depend on the
//! `ConfigProvider` trait, not on this file-backed reader directly, so the
//! core engine stays decoupled from the on-disk format.

use std::collections::HashMap;
use std::fs;
use std::net::SocketAddrV4;
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct Config {
    pub listen_port: Option<u16>,
    pub rest_server: Option<SocketAddrV4>,
    pub database: Option<SocketAddrV4>,
    pub local_buddy: Option<SocketAddrV4>,
    /// Every key read from the file, including ones this type doesn't
    /// otherwise interpret — mirrors the source caching every entry
    /// regardless of whether anything consumes it.
    pub raw: HashMap<String, String>,
}

pub trait ConfigProvider {
    fn listen_port(&self) -> Option<u16>;
    fn rest_server(&self) -> Option<SocketAddrV4>;
    fn database(&self) -> Option<SocketAddrV4>;
    fn local_buddy(&self) -> Option<SocketAddrV4>;
}

impl ConfigProvider for Config {
    fn listen_port(&self) -> Option<u16> {
        self.listen_port
    }
    fn rest_server(&self) -> Option<SocketAddrV4> {
        self.rest_server
    }
    fn database(&self) -> Option<SocketAddrV4> {
        self.database
    }
    fn local_buddy(&self) -> Option<SocketAddrV4> {
        self.local_buddy
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Malformed { line: usize },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "{}", e),
            ConfigError::Malformed { line } => write!(f, "malformed config at line {}", line),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Config, ConfigError> {
        let mut raw = HashMap::new();

        for (line_no, line) in text.lines().enumerate() {
            let mut tokens = quoted_tokens(line);
            while let Some(key) = tokens.next() {
                let value = tokens
                    .next()
                    .ok_or(ConfigError::Malformed { line: line_no + 1 })?;
                raw.insert(key, value);
            }
        }

        let mut config = Config { raw, ..Config::default() };
        config.listen_port = config.raw.get("Listen_Port").and_then(|v| v.parse().ok());
        config.rest_server = config
            .raw
            .get("RESTServer_Address")
            .and_then(|v| v.parse().ok());
        config.database = config.raw.get("Database_Address").and_then(|v| v.parse().ok());
        config.local_buddy = config.raw.get("Local_Buddy").and_then(|v| v.parse().ok());

        Ok(config)
    }
}

/// Splits a line into double-quoted tokens, honoring backslash escapes
/// inside the quotes (the same convention as C++'s `std::quoted`).
/// Unquoted text between tokens is ignored.
fn quoted_tokens(line: &str) -> impl Iterator<Item = String> + '_ {
    QuotedTokens { chars: line.chars().peekable() }
}

struct QuotedTokens<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Iterator for QuotedTokens<'a> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        // Skip to the next opening quote.
        loop {
            match self.chars.next() {
                None => return None,
                Some('"') => break,
                Some(_) => continue,
            }
        }

        let mut token = String::new();
        loop {
            match self.chars.next() {
                None => return Some(token), // unterminated quote: best effort
                Some('"') => return Some(token),
                Some('\\') => {
                    if let Some(escaped) = self.chars.next() {
                        token.push(escaped);
                    }
                }
                Some(c) => token.push(c),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_recognized_keys() {
        let text = concat!(
            "\"Listen_Port\" \"7777\"\n",
            "\"RESTServer_Address\" \"127.0.0.1:8080\"\n",
            "\"Database_Address\" \"127.0.0.1:5432\"\n",
            "\"Local_Buddy\" \"127.0.0.1:7777\"\n",
        );

        let config = Config::from_str(text).unwrap();
        assert_eq!(config.listen_port, Some(7777));
        assert_eq!(config.rest_server, Some("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(config.database, Some("127.0.0.1:5432".parse().unwrap()));
        assert_eq!(config.local_buddy, Some("127.0.0.1:7777".parse().unwrap()));
    }

    #[test]
    fn retains_unrecognized_keys_in_raw_map() {
        let config = Config::from_str("\"Some_Future_Key\" \"whatever\"\n").unwrap();
        assert_eq!(config.raw.get("Some_Future_Key").map(String::as_str), Some("whatever"));
        assert!(config.listen_port.is_none());
    }

    #[test]
    fn multiple_pairs_on_one_line() {
        let config = Config::from_str("\"Listen_Port\" \"9999\" \"Local_Buddy\" \"10.0.0.1:1\"\n").unwrap();
        assert_eq!(config.listen_port, Some(9999));
        assert_eq!(config.local_buddy, Some("10.0.0.1:1".parse().unwrap()));
    }

    #[test]
    fn handles_escaped_quote_inside_token() {
        let config = Config::from_str(r#""key" "va\"lue""#).unwrap();
        assert_eq!(config.raw.get("key").map(String::as_str), Some("va\"lue"));
    }

    #[test]
    fn odd_token_count_is_malformed() {
        let err = Config::from_str("\"Listen_Port\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { line: 1 }));
    }

    #[test]
    fn blank_and_comment_free_lines_are_skipped() {
        let config = Config::from_str("\n   \n\"Listen_Port\" \"1234\"\n").unwrap();
        assert_eq!(config.listen_port, Some(1234));
    }
}
