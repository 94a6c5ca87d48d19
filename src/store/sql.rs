//! A [`Backing`] storing records as rows of a SQLite table.
//!
//! The table is created on first use:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS <table> (
//!     id TEXT PRIMARY KEY NOT NULL,
//!     sequence INTEGER NOT NULL UNIQUE,
//!     attributes BLOB,
//!     body BLOB
//! )
//!
//! CREATE TABLE IF NOT EXISTS <table>_meta (
//!     id INTEGER PRIMARY KEY CHECK (id = 1),
//!     high_water INTEGER NOT NULL
//! )
//! ```
//!
//! The single row of the meta table holds the highest sequence ever deleted. It is updated in the
//! same transaction as the delete.
//!
//! The pool holds a single connection: the owning queue serializes every call anyway, and SQLite
//! does not support concurrent writers.

use std::path::Path;
use std::str::FromStr;

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::{Backing, DurableQueue, StoredRecord};
use crate::error::{StorageError, StorageResult};
use crate::formatter::json_bytes;
use crate::{MqError, MqResult, QueueOptions};

#[derive(Clone, Debug)]
pub struct SqlBacking {
    pool: SqlitePool,
    table: String,
}

impl SqlBacking {
    /// Connects to a database url such as `sqlite://queue.db`, creating the database and the
    /// table if they do not exist.
    pub async fn connect(url: &str, table: &str) -> MqResult<Self> {
        let options = SqliteConnectOptions::from_str(url).map_err(StorageError::from)?.create_if_missing(true);
        Self::with_options(options, table).await
    }

    /// Opens the database file at `path`, creating it and the table if they do not exist.
    pub async fn open_file(path: impl AsRef<Path>, table: &str) -> MqResult<Self> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        Self::with_options(options, table).await
    }

    async fn with_options(options: SqliteConnectOptions, table: &str) -> MqResult<Self> {
        validate_table(table)?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::from)?;

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id TEXT PRIMARY KEY NOT NULL, \
                sequence INTEGER NOT NULL UNIQUE, \
                attributes BLOB, \
                body BLOB)"
        );
        sqlx::query(&create).execute(&pool).await.map_err(StorageError::from)?;

        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table}_meta (\
                id INTEGER PRIMARY KEY CHECK (id = 1), \
                high_water INTEGER NOT NULL)"
        );
        sqlx::query(&create).execute(&pool).await.map_err(StorageError::from)?;

        tracing::debug!(table, "Connected to sqlite backing");
        Ok(Self { pool, table: table.to_string() })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn sql_sequence(&self, record: &StoredRecord) -> StorageResult<i64> {
        i64::try_from(record.sequence)
            .map_err(|_| StorageError::corrupt(self.location(), format!("sequence {} overflows", record.sequence)))
    }
}

/// Table names are interpolated into queries, so only plain identifiers are accepted.
fn validate_table(table: &str) -> MqResult<()> {
    let mut chars = table.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid { Ok(()) } else { Err(MqError::Validation(format!("invalid table name {table:?}"))) }
}

#[async_trait::async_trait]
impl Backing for SqlBacking {
    async fn load(&self) -> StorageResult<Vec<StoredRecord>> {
        let query = format!("SELECT id, sequence, attributes, body FROM {} ORDER BY sequence ASC", self.table);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let sequence: i64 = row.try_get("sequence")?;
            let attributes: Option<Vec<u8>> = row.try_get("attributes")?;
            let body: Option<Vec<u8>> = row.try_get("body")?;

            let location = format!("{}/{id}", self.table);
            let id = uuid::Uuid::parse_str(&id).map_err(|e| StorageError::corrupt(&location, e))?;
            let sequence = u64::try_from(sequence)
                .ok()
                .filter(|sequence| *sequence > 0)
                .ok_or_else(|| StorageError::corrupt(&location, format!("invalid sequence {sequence}")))?;
            let attributes = attributes.ok_or_else(|| StorageError::corrupt(&location, "missing attributes"))?;
            let body = body.ok_or_else(|| StorageError::corrupt(&location, "missing body"))?;

            records.push(StoredRecord { id, sequence, attributes, body });
        }

        Ok(records)
    }

    async fn insert(&self, record: &StoredRecord) -> StorageResult<()> {
        let sequence = self.sql_sequence(record)?;

        let query = format!("INSERT INTO {} (id, sequence, attributes, body) VALUES (?, ?, ?, ?)", self.table);
        sqlx::query(&query)
            .bind(record.id.to_string())
            .bind(sequence)
            .bind(record.attributes.as_slice())
            .bind(record.body.as_slice())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn delete(&self, record: &StoredRecord) -> StorageResult<()> {
        let sequence = self.sql_sequence(record)?;
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "INSERT INTO {}_meta (id, high_water) VALUES (1, ?) \
             ON CONFLICT (id) DO UPDATE SET high_water = max(high_water, excluded.high_water)",
            self.table
        );
        sqlx::query(&query).bind(sequence).execute(&mut *tx).await?;

        let query = format!("DELETE FROM {} WHERE id = ?", self.table);
        let res = sqlx::query(&query).bind(record.id.to_string()).execute(&mut *tx).await?;
        tx.commit().await?;

        if res.rows_affected() == 0 {
            tracing::warn!(id = %record.id, table = %self.table, "Deleted a record which was not stored");
        }
        Ok(())
    }

    async fn high_water(&self) -> StorageResult<u64> {
        let query = format!("SELECT high_water FROM {}_meta WHERE id = 1", self.table);
        let Some(high_water) = sqlx::query_scalar::<_, i64>(&query).fetch_optional(&self.pool).await? else {
            return Ok(0);
        };

        u64::try_from(high_water)
            .map_err(|_| StorageError::corrupt(format!("{}_meta", self.table), format!("invalid high water {high_water}")))
    }

    async fn close(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }

    fn location(&self) -> String {
        format!("sqlite table {}", self.table)
    }
}

impl<M> DurableQueue<M>
where
    M: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    /// Opens a queue persisting json messages in `table` of the SQLite database at `path`.
    pub async fn in_sqlite(path: impl AsRef<Path>, table: &str, options: QueueOptions) -> MqResult<Self> {
        let backing = SqlBacking::open_file(path, table).await?;
        Self::open(backing, json_bytes::<M>(), options).await
    }
}
