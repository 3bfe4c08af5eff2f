//! Telegram Bot API abstractions: the port the gateway calls, its data types,
//! the error taxonomy every adapter maps into, and an outbound pacing decorator.

pub mod error;
pub mod port;
pub mod throttled;
pub mod types;
