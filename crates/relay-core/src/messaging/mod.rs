//! Messenger-facing abstractions (Telegram is the only implementation).

pub mod port;
pub mod split;
pub mod types;
