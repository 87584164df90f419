//! # bts-core
//!
//! Core crate for the BTS market-data feed, providing:
//!
//! - **Types** (`types`): metric keys, snapshots, subscriber classes, push messages
//! - **Configuration** (`config`): JSON config deserialization and validation
//! - **Error types** (`error`): domain-specific `BtsError` via thiserror
//! - **Validity rules** (`guard`): per-key payload predicates for the store
//! - **Snapshot store** (`store`): single-source-of-truth latest-value table
//! - **Subscription registry** (`registry`): class policies and live connections
//! - **Activity tracker** (`activity`): "is this class connected?" view
//! - **Cadence settings** (`settings`): runtime-mutable fast/slow intervals
//! - **WebSocket** (`ws`): subscriber client with auto-reconnect
//! - **Time utilities** (`time_util`): epoch timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod activity;
pub mod config;
pub mod error;
pub mod guard;
pub mod logging;
pub mod registry;
pub mod settings;
pub mod store;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;
