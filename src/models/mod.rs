//! Data models for the estimation room.
//!
//! Field names follow the backend's column names so rows deserialize as-is.

mod event;
mod participant;
mod room;

pub use event::*;
pub use participant::*;
pub use room::*;
