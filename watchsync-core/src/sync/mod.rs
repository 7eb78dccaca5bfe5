//! Sync Engine
//!
//! Authoritative playback timeline and the wire protocol used to mutate and
//! observe it.

mod protocol;
mod state;

pub use protocol::*;
pub use state::*;
