//! Core domain + application logic for the Telegram ⇄ DeepSeek relay.
//!
//! This crate is intentionally framework-agnostic. Telegram and the completion
//! backend live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod personas;
pub mod rate_limit;
pub mod security;
pub mod utils;

pub use errors::{Error, Result};
