//! Multiplexer adapter module
//!
//! Stateless access to the external tmux server: session lifecycle, pane
//! capture, key injection and copy-mode control, plus the session naming scheme.

mod adapter;
#[cfg(test)]
pub mod mock;
mod naming;

pub use adapter::*;
pub use naming::*;
