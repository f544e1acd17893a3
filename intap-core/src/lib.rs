//! Shared engine for the INTAP relay pair: frame codec, routing tables,
//! poll-driven event loop, and the lifecycle protocol that drives them.
//! `local` and `remote` hold the two buddy-specific policies; everything
//! else in this crate is symmetric between the two.

pub mod buffer;
pub mod cli;
pub mod config;
pub mod error;
pub mod flowid;
pub mod frame;
pub mod gate;
pub mod local;
pub mod logging;
pub mod remote;
pub mod shutdown;
pub mod socketset;

pub use error::{Error, Result};
