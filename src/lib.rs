//! Local-first telemetry history.
//!
//! Events pass an [`ingest`] filter into a durable [`cache`]; a
//! [`dispatch`] sweep copies unpersisted entries into a backing
//! [`store`], a [`retention`] sweep prunes what is both persisted and old,
//! and the [`query`] engine reads history from the store or, while it is
//! unreachable, from the cache.

pub mod agent;
pub mod api;
pub mod cache;
pub mod config;
pub mod demo;
pub mod dispatch;
pub mod export;
pub mod ingest;
pub mod migrate;
pub mod policy;
pub mod query;
pub mod retention;
pub mod store;
pub mod sweep;
pub mod value;
