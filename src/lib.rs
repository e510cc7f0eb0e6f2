//! Offline resilience layer for the SafeRoute emergency web app.
//!
//! Intercepted requests are served by per-class caching strategies backed by
//! versioned cache generations, and emergency/location reports captured while
//! offline wait in a durable outbox until a sync trigger delivers them.

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod event;
pub mod http;
pub mod notify;
pub mod outbox;
pub mod push;
pub mod router;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use worker::{Worker, WorkerState};
