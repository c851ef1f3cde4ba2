//! Completion backend port and the retry-wrapped adapter in front of it.

pub mod adapter;
pub mod client;
pub mod retry;
pub mod types;
