//! WebSocket subscriber client with auto-reconnect.

pub mod client;

pub use client::{OnPushCallback, SubscriberClient, SubscriberConfig};
