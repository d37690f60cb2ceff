use std::error::Error;

use async_trait::async_trait;
use bytes::BytesMut;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, SimpleQueryMessage};

use super::{ConnectionTarget, SqlConnector, SqlError, SqlExecutor, SqlRow, SqlValue};

const DEFAULT_DATABASE: &str = "postgres";
const APPLICATION_NAME: &str = "database_controller";

/// Postgres binding over `tokio-postgres`. Connections require TLS but do not verify
/// the server certificate, matching `sslmode=require`.
pub struct PostgresConnector {
    tls: MakeTlsConnector,
}

impl PostgresConnector {
    pub fn new() -> Result<Self, SqlError> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| SqlError::Connect {
                target: "tls".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            tls: MakeTlsConnector::new(connector),
        })
    }
}

#[async_trait]
impl SqlConnector for PostgresConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn SqlExecutor>, SqlError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .user(&target.username)
            .password(&target.password)
            .dbname(target.database.as_deref().unwrap_or(DEFAULT_DATABASE))
            .application_name(APPLICATION_NAME)
            .ssl_mode(SslMode::Require);

        let (client, connection) =
            config
                .connect(self.tls.clone())
                .await
                .map_err(|e| SqlError::Connect {
                    target: target.describe(),
                    message: e.to_string(),
                })?;

        let description = target.describe();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("postgres connection to {description} failed: {e}");
            }
        });

        Ok(Box::new(PostgresExecutor { client }))
    }
}

struct PostgresExecutor {
    client: Client,
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn execute(&mut self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SqlError> {
        if params.is_empty() {
            let messages = self
                .client
                .simple_query(query)
                .await
                .map_err(|e| SqlError::Query(e.to_string()))?;
            return Ok(messages
                .into_iter()
                .filter_map(|msg| match msg {
                    SimpleQueryMessage::Row(row) => Some(simple_row(&row)),
                    _ => None,
                })
                .collect());
        }

        let params: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client
            .query(query, &params)
            .await
            .map_err(|e| SqlError::Query(e.to_string()))?;
        rows.iter().map(decode_row).collect()
    }

    async fn close(self: Box<Self>) -> Result<(), SqlError> {
        // Dropping the client terminates the connection task spawned in `connect`.
        drop(self.client);
        Ok(())
    }
}

fn simple_row(row: &tokio_postgres::SimpleQueryRow) -> SqlRow {
    let columns = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = (0..row.len())
        .map(|i| match row.get(i) {
            Some(v) => SqlValue::Text(v.to_string()),
            None => SqlValue::Null,
        })
        .collect();
    SqlRow::new(columns, values)
}

fn decode_row(row: &tokio_postgres::Row) -> Result<SqlRow, SqlError> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match *column.type_() {
            Type::BOOL => row.try_get::<_, Option<bool>>(i).map(|v| v.map(SqlValue::Bool)),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(i)
                .map(|v| v.map(|v| SqlValue::Int(v.into()))),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(i)
                .map(|v| v.map(|v| SqlValue::Int(v.into()))),
            Type::INT8 => row.try_get::<_, Option<i64>>(i).map(|v| v.map(SqlValue::Int)),
            _ => row
                .try_get::<_, Option<String>>(i)
                .map(|v| v.map(SqlValue::Text)),
        }
        .map_err(|e| SqlError::Decode(format!("column {}: {e}", column.name())))?;
        columns.push(column.name().to_string());
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(SqlRow::new(columns, values))
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Text(s) => s.to_sql(ty, out),
            SqlValue::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Null => Ok(IsNull::Yes),
        }
    }

    fn accepts(ty: &Type) -> bool {
        <String as ToSql>::accepts(ty)
            || <i64 as ToSql>::accepts(ty)
            || <i32 as ToSql>::accepts(ty)
            || <i16 as ToSql>::accepts(ty)
            || <bool as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}
