//! Database module for uptrail.
//!
//! Provides SQLite storage for services, notifier settings and the
//! append-only hit/failure log.

mod events;
mod models;
mod store;

pub use models::*;
pub use store::*;

#[cfg(test)]
pub(crate) use store::tests as test_support;
