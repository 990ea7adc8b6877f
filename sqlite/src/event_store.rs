//! `SQLite`-backed [`EventRecordStore`].

use chrono::Utc;
use event_octopus_core::event::{Event, EventName};
use event_octopus_core::event_store::{EventRecordStore, StoreError};
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

const SELECT_COLUMNS: &str = r"
    SELECT uuid, external_id, name, payload, retry_count, error,
           consent_id, transaction_id, initiator_legal_entity
    FROM events
";

/// Event record store on `SQLite`.
///
/// Cloning is cheap: clones share the connection pool and the write mutex, so
/// every write through any clone is serialized.
///
/// # Example
///
/// ```no_run
/// use event_octopus_sqlite::SqliteEventStore;
/// use event_octopus_core::event_store::EventRecordStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SqliteEventStore::connect("sqlite://octopus.db").await?;
/// store.migrate().await?;
/// store.ping().await?;
///
/// let events = store.list().await?;
/// println!("{} events recorded", events.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteEventStore {
    /// Open a pool for the given connection string.
    ///
    /// In-memory databases (`sqlite::memory:`) get a single connection that is
    /// never recycled, since every new connection would see an empty database.
    /// File databases are created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection string is invalid or
    /// the database cannot be opened.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Database(format!("invalid connection string: {e}")))?
            .create_if_missing(true);

        let pool_options = if url.contains(":memory:") || url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        tracing::info!(url = %url, "Event store connected");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply pending schema migrations. Running it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Migration`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::debug!("Event store migrations applied");
        Ok(())
    }

    /// Close the pool. Later operations fail with [`StoreError::Closed`].
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("Event store closed");
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    async fn upsert(&self, event: Event) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let existing = match sqlx::query("SELECT uuid FROM events WHERE uuid = ?")
            .bind(&event.id)
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row.is_some(),
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback after failed lookup failed");
                }
                return Err(map_sqlx_error(e));
            },
        };

        let now = Utc::now();
        let query = if existing {
            sqlx::query(
                r"
                UPDATE events
                SET external_id = ?, name = ?, payload = ?, retry_count = ?, error = ?,
                    consent_id = ?, transaction_id = ?, initiator_legal_entity = ?,
                    updated_at = ?
                WHERE uuid = ?
                ",
            )
            .bind(&event.external_id)
            .bind(event.name.as_str())
            .bind(&event.payload)
            .bind(i64::from(event.retry_count))
            .bind(&event.error)
            .bind(&event.consent_id)
            .bind(&event.transaction_id)
            .bind(&event.initiator_legal_entity)
            .bind(now)
            .bind(&event.id)
        } else {
            sqlx::query(
                r"
                INSERT INTO events (
                    uuid, external_id, name, payload, retry_count, error,
                    consent_id, transaction_id, initiator_legal_entity,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(&event.id)
            .bind(&event.external_id)
            .bind(event.name.as_str())
            .bind(&event.payload)
            .bind(i64::from(event.retry_count))
            .bind(&event.error)
            .bind(&event.consent_id)
            .bind(&event.transaction_id)
            .bind(&event.initiator_legal_entity)
            .bind(now)
            .bind(now)
        };

        query.execute(&mut *tx).await.map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;

        metrics::counter!(
            "event_store.writes",
            "kind" => if existing { "update" } else { "insert" }
        )
        .increment(1);
        tracing::debug!(
            id = %event.id,
            name = %event.name,
            retry_count = event.retry_count,
            updated = existing,
            "Event saved"
        );
        Ok(())
    }

    async fn fetch_one_by(&self, key: &str, value: String) -> Result<Option<Event>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE {key} = ? ORDER BY updated_at DESC, rowid DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.as_ref().map(row_to_event).transpose()
    }

    async fn fetch_all(&self, excluding: Option<EventName>) -> Result<Vec<Event>, StoreError> {
        let rows = match excluding {
            Some(name) => {
                let sql = format!("{SELECT_COLUMNS} WHERE name <> ? ORDER BY created_at, rowid");
                sqlx::query(&sql)
                    .bind(name.as_str())
                    .fetch_all(&self.pool)
                    .await
            },
            None => {
                let sql = format!("{SELECT_COLUMNS} ORDER BY created_at, rowid");
                sqlx::query(&sql).fetch_all(&self.pool).await
            },
        }
        .map_err(map_sqlx_error)?;

        rows.iter().map(row_to_event).collect()
    }

    async fn delete_named(&self, name: EventName) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM events WHERE name = ?")
            .bind(name.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        tracing::debug!(name = %name, deleted = result.rows_affected(), "Events deleted");
        Ok(result.rows_affected())
    }
}

impl EventRecordStore for SqliteEventStore {
    fn save_or_update(
        &self,
        event: &Event,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        let event = event.clone();
        Box::pin(self.upsert(event))
    }

    fn get(
        &self,
        id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Event>, StoreError>> + Send + '_>> {
        Box::pin(self.fetch_one_by("uuid", id.to_string()))
    }

    fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Event>, StoreError>> + Send + '_>> {
        Box::pin(self.fetch_one_by("external_id", external_id.to_string()))
    }

    fn list(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Event>, StoreError>> + Send + '_>> {
        Box::pin(self.fetch_all(None))
    }

    fn list_excluding(
        &self,
        name: EventName,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Event>, StoreError>> + Send + '_>> {
        Box::pin(self.fetch_all(Some(name)))
    }

    fn delete_by_name(
        &self,
        name: EventName,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>> {
        Box::pin(self.delete_named(name))
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            Ok(())
        })
    }
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolClosed => StoreError::Closed,
        other => StoreError::Database(other.to_string()),
    }
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Serialization(format!("column '{name}': {e}")))
}

/// Convert a database row to an [`Event`].
fn row_to_event(row: &SqliteRow) -> Result<Event, StoreError> {
    let name: String = column(row, "name")?;
    let name = EventName::parse(&name).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let retry_count: i64 = column(row, "retry_count")?;
    let retry_count = u32::try_from(retry_count).map_err(|_| {
        StoreError::Serialization(format!("retry_count out of range: {retry_count}"))
    })?;

    Ok(Event {
        id: column(row, "uuid")?,
        external_id: column(row, "external_id")?,
        name,
        payload: column(row, "payload")?,
        retry_count,
        error: column(row, "error")?,
        consent_id: column(row, "consent_id")?,
        transaction_id: column(row, "transaction_id")?,
        initiator_legal_entity: column(row, "initiator_legal_entity")?,
    })
}
