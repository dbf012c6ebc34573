//! PTY management module
//!
//! Runs attachment processes under a pseudo-terminal using portable-pty.

mod process;

pub use process::*;
