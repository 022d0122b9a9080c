//! Postgres target store
//!
//! Statements are built at runtime from the [`TableDef`] with quoted
//! identifiers and bound parameters, each wrapped in a `CAST` to its column
//! type. Decimals travel as text and are parsed by the server.
//!
//! Each session pins one pooled connection. A transaction is opened lazily on
//! the first write after a commit or rollback, and every single-row statement
//! runs under a savepoint so a unique violation can be rolled back alone
//! without aborting the rest of the page.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use dmsync_common::types::{DateRange, Key, Record, Timestamp};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info, warn};

use super::{Operation, TableDef, TargetSession, TargetStore};
use crate::config::TargetConfig;
use crate::error::{Result, SyncError};
use crate::writer::binder::{BoundValue, ColumnDef};

const SAVEPOINT: &str = "dmsync_row";

pub struct PgTarget {
    pool: PgPool,
    schema: Option<String>,
}

impl PgTarget {
    pub fn new(pool: PgPool, schema: Option<String>) -> Self {
        Self { pool, schema }
    }

    /// Connect a pool sized for one connection per concurrent partition
    pub async fn connect(config: &TargetConfig) -> Result<Self> {
        info!(max_connections = config.max_connections, "Connecting to target database");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool, config.schema.clone()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Double-quote an identifier
fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote(schema), quote(table)),
        None => quote(table),
    }
}

fn cast(index: usize, column: &ColumnDef) -> String {
    format!("CAST(${} AS {})", index, column.column_type.sql_type())
}

fn insert_sql(schema: Option<&str>, table: &TableDef) -> String {
    let columns: Vec<String> = table.columns().iter().map(|c| quote(&c.name)).collect();
    let values: Vec<String> = table
        .columns()
        .iter()
        .enumerate()
        .map(|(i, c)| cast(i + 1, c))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified(schema, &table.name),
        columns.join(", "),
        values.join(", ")
    )
}

fn update_sql(schema: Option<&str>, table: &TableDef, columns: &[&ColumnDef]) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", quote(&c.name), cast(i + 1, c)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {} = ${}",
        qualified(schema, &table.name),
        assignments.join(", "),
        quote(table.key_column()),
        columns.len() + 1
    )
}

fn delete_sql(schema: Option<&str>, table: &TableDef) -> String {
    format!(
        "DELETE FROM {} WHERE {} = $1",
        qualified(schema, &table.name),
        quote(table.key_column())
    )
}

fn bind_value<'q>(query: Query<'q, Postgres, PgArguments>, value: BoundValue) -> Query<'q, Postgres, PgArguments> {
    match value {
        BoundValue::Null => query.bind(None::<String>),
        BoundValue::Text(v) | BoundValue::Decimal(v) => query.bind(v),
        BoundValue::Integer(v) => query.bind(v),
        BoundValue::Boolean(v) => query.bind(v),
        BoundValue::Date(v) => query.bind(v),
        BoundValue::DateTime(v) => query.bind(v),
        BoundValue::Seconds(v) => query.bind(v),
    }
}

#[async_trait]
impl TargetStore for PgTarget {
    async fn timestamps(&self, table: &TableDef, created: &DateRange) -> Result<BTreeMap<Key, Timestamp>> {
        let names = &table.field_names;
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {}, {} FROM {} WHERE TRUE",
            quote(&names.key),
            quote(&names.updated),
            qualified(self.schema.as_deref(), &table.name)
        ));
        if let Some(start) = created.start() {
            builder
                .push(format!(" AND {} >= ", quote(&names.created)))
                .push_bind(start.naive_utc());
        }
        if let Some(end) = created.end() {
            builder
                .push(format!(" AND {} < ", quote(&names.created)))
                .push_bind(end.naive_utc());
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut map = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get(0)?;
            let updated: Option<NaiveDateTime> = row.try_get(1)?;
            if let Some(updated) = updated {
                map.insert(Key::new(key), updated.and_utc());
            }
        }

        debug!(table = %table.name, %created, rows = map.len(), "Loaded target timestamps");
        Ok(map)
    }

    async fn max_updated(&self, table: &TableDef) -> Result<Option<Timestamp>> {
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            quote(&table.field_names.updated),
            qualified(self.schema.as_deref(), &table.name)
        );
        let max: Option<NaiveDateTime> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(max.map(|ts| ts.and_utc()))
    }

    async fn session(&self) -> Result<Box<dyn TargetSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(PgSession {
            conn: Some(conn),
            schema: self.schema.clone(),
            open: false,
        }))
    }
}

struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
    schema: Option<String>,
    open: bool,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_deref_mut()
            .ok_or(SyncError::Database(sqlx::Error::PoolClosed))
    }

    async fn execute_raw(&mut self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(self.conn()?).await?;
        Ok(())
    }

    async fn ensure_transaction(&mut self) -> Result<()> {
        if !self.open {
            self.execute_raw("BEGIN").await?;
            self.open = true;
        }
        Ok(())
    }

    /// Run one statement under a savepoint so that a failure leaves the
    /// surrounding transaction usable
    async fn guarded(&mut self, query: Query<'_, Postgres, PgArguments>) -> Result<u64> {
        self.ensure_transaction().await?;
        self.execute_raw(&format!("SAVEPOINT {SAVEPOINT}")).await?;

        match query.execute(self.conn()?).await {
            Ok(done) => {
                self.execute_raw(&format!("RELEASE SAVEPOINT {SAVEPOINT}")).await?;
                Ok(done.rows_affected())
            },
            Err(err) => {
                let rollback = self.execute_raw(&format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}")).await;
                Err(statement_error(err, rollback))
            },
        }
    }
}

/// Error for a failed statement. A failed savepoint rollback wins since the
/// transaction is then unusable, but the statement's own error is logged.
fn statement_error(err: sqlx::Error, rollback: Result<()>) -> SyncError {
    match rollback {
        Ok(()) => SyncError::from_database(err),
        Err(rollback_err) => {
            warn!(error = %err, rollback_error = %rollback_err, "Savepoint rollback failed after statement error");
            rollback_err
        },
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // An aborted task can drop its session mid-page. Closing the socket
        // makes the server roll back instead of pooling a dirty connection.
        if self.open {
            if let Some(conn) = self.conn.take() {
                warn!("Session dropped inside a transaction; discarding its connection");
                drop(conn.detach());
            }
        }
    }
}

#[async_trait]
impl TargetSession for PgSession {
    async fn apply(&mut self, op: Operation, table: &TableDef, record: &Record) -> Result<u64> {
        let schema = self.schema.clone();
        match op {
            Operation::Insert => {
                let sql = insert_sql(schema.as_deref(), table);
                let mut query = sqlx::query(&sql);
                for column in table.columns() {
                    query = bind_value(query, column.bind(record));
                }
                self.guarded(query).await
            },
            Operation::Update => {
                let columns: Vec<&ColumnDef> = table.update_columns(record).collect();
                if columns.is_empty() {
                    return Ok(0);
                }
                let sql = update_sql(schema.as_deref(), table, &columns);
                let mut query = sqlx::query(&sql);
                for column in &columns {
                    query = bind_value(query, column.bind(record));
                }
                query = query.bind(record.key().as_str().to_string());
                self.guarded(query).await
            },
            Operation::Delete => self.delete(table, record.key()).await,
        }
    }

    async fn delete(&mut self, table: &TableDef, key: &Key) -> Result<u64> {
        let sql = delete_sql(self.schema.as_deref(), table);
        let query = sqlx::query(&sql).bind(key.as_str().to_string());
        self.guarded(query).await
    }

    async fn commit(&mut self) -> Result<()> {
        if self.open {
            self.execute_raw("COMMIT").await?;
            self.open = false;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.open {
            self.execute_raw("ROLLBACK").await?;
            self.open = false;
        }
        Ok(())
    }
}
