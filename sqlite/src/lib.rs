//! `SQLite` event record store for Event Octopus.
//!
//! This crate provides [`SqliteEventStore`], an implementation of the
//! [`EventRecordStore`](event_octopus_core::event_store::EventRecordStore) trait
//! on top of sqlx. It supports:
//!
//! - One row per event id, whole-row overwrite on every save
//! - Writes serialized behind one async mutex, each in its own transaction
//! - Lookups by id and by external id
//! - Purging completed events
//! - Embedded schema migrations
//!
//! # Example
//!
//! ```no_run
//! use event_octopus_sqlite::SqliteEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteEventStore::connect("sqlite::memory:").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

mod event_store;

pub use event_store::SqliteEventStore;
