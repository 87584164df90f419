//! # bts-cast
//!
//! Push delivery for the BTS feed.
//!
//! - [`broadcaster`]: minimal-wait scheduler pushing store selections to
//!   every subscriber class at its own interval
//! - [`server`]: axum WebSocket endpoint for subscribers plus the
//!   status, snapshot and operator endpoints

pub mod broadcaster;
pub mod server;

pub use broadcaster::Broadcaster;
pub use server::{AppState, serve};
