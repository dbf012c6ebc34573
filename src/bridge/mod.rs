//! Broadcast bridge module
//!
//! Fans one session's events out to every connection in its room and maps
//! scroll requests onto tmux copy mode.

mod binding;
mod decode;
mod rooms;
mod scroll;

pub use binding::*;
pub use decode::Utf8Decoder;
pub use rooms::*;
pub use scroll::*;
