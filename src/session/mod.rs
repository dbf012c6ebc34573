//! Session handle module
//!
//! One in-process handle per attachment to an external tmux session: lifecycle
//! state machine, bounded output history and command echo suppression.

mod buffer;
mod echo;
mod handle;
mod state;

pub use buffer::*;
pub use handle::*;
pub use state::*;
