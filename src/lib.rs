//! Core library for the channel-syndication bot: text debloating and
//! translation, reference-data caching, content-based destination routing,
//! and post formatting. The binary in `main.rs` wires these to Telegram.

pub mod cache;
pub mod config;
pub mod db;
pub mod debloat;
pub mod format;
pub mod handlers;
pub mod model;
pub mod platform;
pub mod route;
pub mod translate;
