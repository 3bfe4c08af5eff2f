//! Core of the chat-admin gateway: WebApp credential checks, retried Bot API
//! access, and cached chat/member listings.
//!
//! This crate is framework-agnostic. Telegram lives behind ports (traits)
//! implemented in adapter crates.

pub mod authz;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod init_data;
pub mod logging;
pub mod messaging;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod security;
pub mod telemetry;
pub mod webapp;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
