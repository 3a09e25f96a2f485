//! SQLite-backed state source over the game database.
//!
//! The game writes event rows into an events table; the bridge scans them
//! by an increasing marker column, writes responses into target tables and
//! keeps its resume marker in a single-row table of its own. Table and
//! column names come from [`StoreSchema`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use nwnbridge_domain::{DomainError, RowChange, SequenceMarker, SqlIdentifier, WriteTarget};

use crate::infrastructure::backoff::Backoff;
use crate::infrastructure::ports::{ClockPort, StateSourcePort, StoreError};

/// Deployment contract between the game and the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSchema {
    pub events_table: SqlIdentifier,
    pub marker_column: SqlIdentifier,
    pub tag_column: SqlIdentifier,
    /// Column naming the table an event is about
    pub table_column: SqlIdentifier,
    /// JSON object of changed fields
    pub payload_column: SqlIdentifier,
    /// Tag column in write-target tables
    pub target_tag_column: SqlIdentifier,
    /// Non-null, non-zero value marks a target row as consumed by the game
    pub consumed_column: Option<SqlIdentifier>,
    pub resume_table: SqlIdentifier,
}

impl StoreSchema {
    /// The default table and column names.
    pub fn standard() -> Result<Self, DomainError> {
        Ok(Self {
            events_table: SqlIdentifier::new("bridge_events")?,
            marker_column: SqlIdentifier::new("id")?,
            tag_column: SqlIdentifier::new("tag")?,
            table_column: SqlIdentifier::new("source_table")?,
            payload_column: SqlIdentifier::new("payload")?,
            target_tag_column: SqlIdentifier::new("tag")?,
            consumed_column: None,
            resume_table: SqlIdentifier::new("bridge_resume")?,
        })
    }

    fn scan_sql(&self) -> String {
        format!(
            "SELECT CAST({marker} AS INTEGER) AS marker, CAST({tag} AS TEXT) AS tag, \
             CAST({table} AS TEXT) AS source_table, CAST({payload} AS TEXT) AS payload \
             FROM {events} WHERE {marker} > ? ORDER BY {marker} ASC LIMIT ?",
            marker = self.marker_column.quoted(),
            tag = self.tag_column.quoted(),
            table = self.table_column.quoted(),
            payload = self.payload_column.quoted(),
            events = self.events_table.quoted(),
        )
    }

    fn read_sql(&self, target: &WriteTarget) -> String {
        format!(
            "SELECT CAST({column} AS TEXT) AS value FROM {table} WHERE {tag} = ? LIMIT 1",
            column = target.column.quoted(),
            table = target.table.quoted(),
            tag = self.target_tag_column.quoted(),
        )
    }

    fn commit_sql(&self, target: &WriteTarget) -> String {
        let mut sql = format!(
            "UPDATE {table} SET {column} = ? WHERE {tag} = ?",
            table = target.table.quoted(),
            column = target.column.quoted(),
            tag = self.target_tag_column.quoted(),
        );
        if let Some(consumed) = &self.consumed_column {
            let consumed = consumed.quoted();
            sql.push_str(&format!(" AND ({consumed} IS NULL OR {consumed} = 0)"));
        }
        sql
    }
}

/// Retry budget for busy/locked errors.
#[derive(Debug, Clone, PartialEq)]
pub struct BusyRetry {
    pub retries: u32,
    pub backoff: Backoff,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self {
            retries: 5,
            backoff: Backoff::new(50, 1000),
        }
    }
}

/// SQLite implementation of [`StateSourcePort`].
pub struct SqliteStateSource {
    pool: SqlitePool,
    schema: StoreSchema,
    busy: BusyRetry,
    clock: Arc<dyn ClockPort>,
    scan_sql: String,
}

impl SqliteStateSource {
    /// Open an existing game database and prepare the resume table.
    ///
    /// Fails when the file is missing, the events table or one of its
    /// configured columns does not exist, or the resume table cannot be
    /// created.
    pub async fn open(
        db_path: &Path,
        schema: StoreSchema,
        busy: BusyRetry,
        clock: Arc<dyn ClockPort>,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(false)
            .busy_timeout(busy.backoff.delay(1));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::database("open", e))?;

        let source = Self {
            scan_sql: schema.scan_sql(),
            pool,
            schema,
            busy,
            clock,
        };
        source.verify_events_table().await?;
        source.ensure_resume_table().await?;
        Ok(source)
    }

    async fn verify_events_table(&self) -> Result<(), StoreError> {
        let exists = self
            .with_busy_retry("open", || {
                sqlx::query(
                    "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?",
                )
                .bind(self.schema.events_table.as_str())
                .fetch_optional(&self.pool)
            })
            .await?;
        if exists.is_none() {
            return Err(StoreError::InvalidData(format!(
                "events table '{}' does not exist",
                self.schema.events_table
            )));
        }

        // Misnamed columns fail here rather than on the first scan.
        sqlx::query(&self.scan_sql)
            .bind(i64::MAX)
            .bind(0_i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                StoreError::InvalidData(format!(
                    "events table '{}' does not fit the configured columns: {e}",
                    self.schema.events_table
                ))
            })?;
        Ok(())
    }

    async fn ensure_resume_table(&self) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                marker INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            self.schema.resume_table.quoted()
        );
        self.with_busy_retry("open", || sqlx::query(&sql).execute(&self.pool))
            .await?;
        Ok(())
    }

    /// Run `operation`, retrying busy/locked errors with backoff.
    async fn with_busy_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        run: F,
    ) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match run().await {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    attempt += 1;
                    if attempt > self.busy.retries {
                        return Err(StoreError::busy(operation, e));
                    }
                    let delay = self.busy.backoff.delay(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(StoreError::database(operation, e)),
            }
        }
    }

    async fn commit_once(&self, sql: &str, value: &str, tag: &str) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(sql)
            .bind(value)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(0);
        }
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StateSourcePort for SqliteStateSource {
    async fn scan(
        &self,
        since: SequenceMarker,
        limit: usize,
    ) -> Result<Vec<RowChange>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .with_busy_retry("scan", || {
                sqlx::query(&self.scan_sql)
                    .bind(since.value())
                    .bind(limit)
                    .fetch_all(&self.pool)
            })
            .await?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let marker: i64 = row
                .try_get("marker")
                .map_err(|e| StoreError::InvalidData(format!("marker column: {e}")))?;
            let marker = SequenceMarker::new(marker);
            let tag: Option<String> = row
                .try_get("tag")
                .map_err(|e| StoreError::InvalidData(format!("tag column: {e}")))?;
            let table: Option<String> = row
                .try_get("source_table")
                .map_err(|e| StoreError::InvalidData(format!("table column: {e}")))?;
            let payload: Option<String> = row
                .try_get("payload")
                .map_err(|e| StoreError::InvalidData(format!("payload column: {e}")))?;

            let tag = tag.unwrap_or_else(|| {
                tracing::warn!(marker = %marker, "Event row has no tag");
                String::new()
            });
            let mut change = RowChange::new(tag, table.unwrap_or_default(), marker);
            if let Some(payload) = payload {
                change.changed_fields = parse_payload(marker, &payload);
            }
            changes.push(change);
        }
        Ok(changes)
    }

    async fn commit(
        &self,
        target: &WriteTarget,
        tag: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let sql = self.schema.commit_sql(target);
        let rows = match self
            .with_busy_retry("commit", || self.commit_once(&sql, value, tag))
            .await
        {
            Ok(rows) => rows,
            Err(e) if e.is_busy() => {
                return Err(StoreError::write_conflict(
                    target,
                    tag,
                    format!("target stayed locked: {e}"),
                ));
            }
            Err(e) => return Err(e),
        };

        if rows == 0 {
            return Err(StoreError::write_conflict(
                target,
                tag,
                "no unconsumed row with this tag",
            ));
        }
        Ok(())
    }

    async fn read_field(
        &self,
        target: &WriteTarget,
        tag: &str,
    ) -> Result<Option<String>, StoreError> {
        let sql = self.schema.read_sql(target);
        let row = self
            .with_busy_retry("read_field", || {
                sqlx::query(&sql).bind(tag).fetch_optional(&self.pool)
            })
            .await?;
        match row {
            Some(row) => row
                .try_get::<Option<String>, _>("value")
                .map_err(|e| StoreError::InvalidData(format!("{target}: {e}"))),
            None => Ok(None),
        }
    }

    async fn current_marker(&self) -> Result<SequenceMarker, StoreError> {
        let sql = format!(
            "SELECT marker FROM {} WHERE id = 1",
            self.schema.resume_table.quoted()
        );
        let row = self
            .with_busy_retry("current_marker", || {
                sqlx::query(&sql).fetch_optional(&self.pool)
            })
            .await?;

        match row {
            Some(row) => {
                let marker: i64 = row
                    .try_get("marker")
                    .map_err(|e| StoreError::InvalidData(format!("resume marker: {e}")))?;
                Ok(SequenceMarker::new(marker))
            }
            None => Ok(SequenceMarker::ORIGIN),
        }
    }

    async fn persist_marker(&self, marker: SequenceMarker) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (id, marker, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                marker = excluded.marker,
                updated_at = excluded.updated_at
            "#,
            self.schema.resume_table.quoted()
        );
        let now = self.clock.now().to_rfc3339();
        self.with_busy_retry("persist_marker", || {
            sqlx::query(&sql)
                .bind(marker.value())
                .bind(&now)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            matches!(primary, Some(5) | Some(6)) || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

fn parse_payload(
    marker: SequenceMarker,
    payload: &str,
) -> std::collections::BTreeMap<String, Value> {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(fields)) => fields.into_iter().collect(),
        Ok(other) => {
            tracing::warn!(
                marker = %marker,
                kind = value_kind(&other),
                "Event payload is not a JSON object, treating as no fields"
            );
            Default::default()
        }
        Err(e) => {
            tracing::warn!(
                marker = %marker,
                error = %e,
                "Event payload is not valid JSON, treating as no fields"
            );
            Default::default()
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
