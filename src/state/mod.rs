//! Crash-safe persistence of the feed cursor and the dedup index.

pub mod atomic;
pub mod store;

pub use store::StateStore;
