//! Session registry module
//!
//! Owns every session handle, the persisted id -> external name mapping and
//! the reconciliation with sessions the multiplexer still hosts.

mod error;
mod metadata;
#[allow(clippy::module_inception)]
mod registry;

pub use error::*;
pub use metadata::*;
pub use registry::*;
