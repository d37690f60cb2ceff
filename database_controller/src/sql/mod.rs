//! Minimal SQL execution capability: open a connection, run statements, close it.
//!
//! The provisioning logic never talks to a driver directly. It goes through
//! [`SqlConnector`] and wraps every connection in a [`ScopedConnection`], which bounds
//! each call by the configured timeout and guarantees the connection is released on
//! every exit path.

pub mod escaping;
pub mod mysql;
pub mod postgres;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use database_api::models::DatabaseEngine;

use crate::metrics::SQL_CONNECTION_CLOSE_FAILURES;

#[derive(thiserror::Error, Debug)]
pub enum SqlError {
    #[error("failed to connect to {target}: {message}")]
    Connect { target: String, message: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error("query timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    /// The driver error was discarded because the statement carried a credential.
    #[error("{0} (driver error suppressed)")]
    Redacted(&'static str),
    #[error("failed to decode result row: {0}")]
    Decode(String),
    #[error("connection is already closed")]
    Closed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

/// One result row. Drivers that only return text (simple query protocol) produce
/// [`SqlValue::Text`] everywhere, so the typed accessors parse text when needed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&SqlValue> {
        self.values.get(idx)
    }

    pub fn get_by_name(&self, column: &str) -> Option<&SqlValue> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)
    }

    pub fn get_text(&self, idx: usize) -> Option<&str> {
        match self.values.get(idx)? {
            SqlValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        match self.values.get(idx)? {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, idx: usize) -> Option<bool> {
        match self.values.get(idx)? {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Int(i) => Some(*i != 0),
            SqlValue::Text(s) => match s.as_str() {
                "t" | "true" | "1" => Some(true),
                "f" | "false" | "0" => Some(false),
                _ => None,
            },
            SqlValue::Null => None,
        }
    }
}

/// Where to connect. The password is never printed.
#[derive(Clone)]
pub struct ConnectionTarget {
    pub engine: DatabaseEngine,
    pub host: String,
    pub port: u16,
    /// `None` connects to the engine's default database.
    pub database: Option<String>,
    pub username: String,
    pub password: String,
}

impl ConnectionTarget {
    pub fn describe(&self) -> String {
        match &self.database {
            Some(db) => format!("{}@{}:{}/{}", self.username, self.host, self.port, db),
            None => format!("{}@{}:{}", self.username, self.host, self.port),
        }
    }
}

impl Debug for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// An open connection to a SQL engine.
#[async_trait]
pub trait SqlExecutor: Send {
    /// Run one statement. Statements without parameters go over the engine's text
    /// protocol, so they may contain DDL that cannot be prepared.
    async fn execute(&mut self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SqlError>;

    async fn close(self: Box<Self>) -> Result<(), SqlError>;
}

#[async_trait]
pub trait SqlConnector: Send + Sync {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn SqlExecutor>, SqlError>;
}

/// Dispatches to the binding for the target's engine.
pub struct EngineConnector {
    postgres: postgres::PostgresConnector,
    mysql: mysql::MySqlConnector,
}

impl EngineConnector {
    pub fn new() -> Result<Self, SqlError> {
        Ok(Self {
            postgres: postgres::PostgresConnector::new()?,
            mysql: mysql::MySqlConnector,
        })
    }
}

#[async_trait]
impl SqlConnector for EngineConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn SqlExecutor>, SqlError> {
        match target.engine {
            DatabaseEngine::Postgres => self.postgres.connect(target).await,
            DatabaseEngine::MySql => self.mysql.connect(target).await,
        }
    }
}

/// A connection owned by a single operation.
///
/// Call [`ScopedConnection::finish`] once the work is done; close failures are logged and
/// counted instead of being returned, so they never mask the operation's own result.
/// Dropping an unfinished connection (early return, cancelled future) drops the driver
/// handle, which closes the socket, and is reported the same way.
pub struct ScopedConnection {
    inner: Option<Box<dyn SqlExecutor>>,
    engine: DatabaseEngine,
    description: String,
    query_timeout: Duration,
}

impl ScopedConnection {
    pub async fn open(
        connector: &Arc<dyn SqlConnector>,
        target: &ConnectionTarget,
        query_timeout: Duration,
    ) -> Result<Self, SqlError> {
        let inner = tokio::time::timeout(query_timeout, connector.connect(target))
            .await
            .map_err(|_| SqlError::Timeout(query_timeout))??;
        Ok(Self {
            inner: Some(inner),
            engine: target.engine,
            description: target.describe(),
            query_timeout,
        })
    }

    pub async fn execute(
        &mut self,
        query: &str,
        params: &[SqlValue],
    ) -> Result<Vec<SqlRow>, SqlError> {
        let inner = self.inner.as_mut().ok_or(SqlError::Closed)?;
        tokio::time::timeout(self.query_timeout, inner.execute(query, params))
            .await
            .map_err(|_| SqlError::Timeout(self.query_timeout))?
    }

    /// Like [`ScopedConnection::execute`], but any driver error is replaced by `what`.
    /// Used for statements that embed a password.
    pub async fn execute_redacted(
        &mut self,
        query: &str,
        params: &[SqlValue],
        what: &'static str,
    ) -> Result<Vec<SqlRow>, SqlError> {
        match self.execute(query, params).await {
            Ok(rows) => Ok(rows),
            Err(SqlError::Timeout(d)) => Err(SqlError::Timeout(d)),
            Err(_) => Err(SqlError::Redacted(what)),
        }
    }

    /// True if the query returned at least one row.
    pub async fn exists(&mut self, query: &str, params: &[SqlValue]) -> Result<bool, SqlError> {
        Ok(!self.execute(query, params).await?.is_empty())
    }

    pub async fn finish(mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let engine = self.engine.to_string();
        match tokio::time::timeout(self.query_timeout, inner.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!("failed to close SQL connection to {}: {e}", self.description);
                SQL_CONNECTION_CLOSE_FAILURES
                    .with_label_values(&[&engine, "error"])
                    .inc();
            }
            Err(_) => {
                tracing::warn!(
                    "timed out closing SQL connection to {}",
                    self.description
                );
                SQL_CONNECTION_CLOSE_FAILURES
                    .with_label_values(&[&engine, "timeout"])
                    .inc();
            }
        }
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if self.inner.take().is_some() {
            tracing::warn!(
                "SQL connection to {} dropped without being closed",
                self.description
            );
            SQL_CONNECTION_CLOSE_FAILURES
                .with_label_values(&[&self.engine.to_string(), "dropped"])
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_accessors_parse_text() {
        let row = SqlRow::new(
            vec!["n".to_string(), "flag".to_string(), "name".to_string()],
            vec![
                SqlValue::Text("42".to_string()),
                SqlValue::Text("t".to_string()),
                SqlValue::Null,
            ],
        );
        assert_eq!(row.get_i64(0), Some(42));
        assert_eq!(row.get_bool(1), Some(true));
        assert_eq!(row.get_text(2), None);
        assert_eq!(row.get_by_name("flag"), Some(&SqlValue::Text("t".to_string())));
    }

    #[test]
    fn connection_target_debug_hides_password() {
        let target = ConnectionTarget {
            engine: DatabaseEngine::Postgres,
            host: "writer.example".to_string(),
            port: 5432,
            database: None,
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{target:?}").contains("hunter2"));
        assert_eq!(target.describe(), "admin@writer.example:5432");
    }
}
