//! Persistence abstraction for event records.
//!
//! The engine keeps exactly one row per event id: the latest known state of that
//! event. Writers replace the whole row (last write wins).

use crate::event::{Event, EventName};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database error (connection, query, constraint violation, ...)
    #[error("Database error: {0}")]
    Database(String),

    /// Schema migration failed
    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored row could not be mapped back to an event
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store was closed
    #[error("Store is closed")]
    Closed,
}

/// Durable store of event records, keyed by event id.
///
/// Implementations must be safe to call concurrently; two writers on the same id
/// must never produce two rows.
pub trait EventRecordStore: Send + Sync {
    /// Insert the event if no record with its id exists, otherwise replace every
    /// field of the existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the lookup or the write fails. A failed
    /// lookup aborts the write.
    fn save_or_update(
        &self,
        event: &Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Look up an event by id.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    fn get(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Event>, StoreError>> + Send + '_>>;

    /// Look up an event by the producer's external id.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Event>, StoreError>> + Send + '_>>;

    /// Every stored event.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Event>, StoreError>> + Send + '_>>;

    /// Every stored event whose name is not `name`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    fn list_excluding(
        &self,
        name: EventName,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>, StoreError>> + Send + '_>>;

    /// Delete every event named `name`, returning how many rows were removed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the statement fails.
    fn delete_by_name(
        &self,
        name: EventName,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>>;

    /// Check that the store is reachable.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the store cannot be reached.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}
