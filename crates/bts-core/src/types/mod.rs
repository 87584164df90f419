//! Core data types flowing between collectors, the store and the broadcaster.

pub mod metric;
pub mod push;
pub mod subscriber;

pub use metric::*;
pub use push::*;
pub use subscriber::*;
