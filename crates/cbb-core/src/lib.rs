//! Core of the chat-bot back end: update ingestion, dispatch and durable state.
//!
//! This crate is intentionally provider-agnostic. The messaging provider (Telegram)
//! lives behind ports (traits) implemented in adapter crates.

pub mod classifier;
pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod ingest;
pub mod logging;
pub mod messaging;
pub mod persist;
pub mod ports;
pub mod profile;
pub mod responder;
pub mod state;
pub mod supervisor;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result, RpcError};
