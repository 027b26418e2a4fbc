//! Mnemon - AI Memory Infrastructure
//!
//! Hybrid persistence for AI agent memories: a fast embedded local store and
//! a durable, quota-limited remote store behaving as one logical store, with
//! low-latency foreground writes and eventual cross-store consistency.

pub mod engine;
pub mod error;
pub mod store;
pub mod sync;
pub mod types;

pub use engine::HybridEngine;
pub use error::{MnemonError, RemoteError, Result, SyncErrorClass};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
