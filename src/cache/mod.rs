//! Versioned response cache for offline support.
//!
//! This module provides:
//! - Cache generations named after the running version (`v2-static`, ...)
//! - Atomic pre-population on install and garbage collection on activation
//! - The strategy resolver that serves intercepted requests from network
//!   and cache

mod layer;
mod lifecycle;
mod storage;
mod traits;

pub use layer::{Intercept, StrategyResolver};
pub use lifecycle::{ActivationReport, Generations, InstallReport, LifecycleManager};
pub use storage::{CacheStore, SqliteCacheStore};
pub use traits::{CacheEntry, Purpose, RequestIdentity, ResponseSource, Served};

pub(crate) use storage::{format_datetime, parse_datetime};
