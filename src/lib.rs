//! Estimation room client.
//!
//! Participants join a shared room, submit hidden votes and reveal them
//! together. Persistence, fan-out and presence belong to a backend; this
//! crate keeps one participant's view of the room in sync with it.

pub mod aggregate;
pub mod backend;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod session;
