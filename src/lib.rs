//! ttysplit - relay one pty session to several terminals
//!
//! Runs a command on a fresh pseudoterminal and copies every byte between
//! that pty and a set of secondary terminal devices, the invoking terminal
//! and an optional log file, so several physical terminals share one
//! interactive session.
//!
//! - `term`: secondary devices and their raw-mode attributes
//! - `pty`: pty pair allocation
//! - `handshake`: one-shot readiness pipe between the two halves
//! - `process`: the fork topology
//! - `relay`: the poll loop and fan-out
//! - `app`: command-line parsing and settings

pub mod app;
pub mod error;
pub mod handshake;
pub mod process;
pub mod pty;
pub mod relay;
pub mod term;

#[cfg(test)]
mod testing;

pub use error::{RelayError, Result};
