use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Params, Row, SslOpts, Value};

use super::{ConnectionTarget, SqlConnector, SqlError, SqlExecutor, SqlRow, SqlValue};

/// MySQL binding over `mysql_async`. TLS is always on; certificate verification is
/// skipped, matching `tls=skip-verify` on the application side.
pub struct MySqlConnector;

#[async_trait]
impl SqlConnector for MySqlConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn SqlExecutor>, SqlError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(target.host.clone())
            .tcp_port(target.port)
            .user(Some(target.username.clone()))
            .pass(Some(target.password.clone()))
            .db_name(target.database.clone())
            .ssl_opts(SslOpts::default().with_danger_accept_invalid_certs(true));

        let conn = Conn::new(opts).await.map_err(|e| SqlError::Connect {
            target: target.describe(),
            message: e.to_string(),
        })?;

        Ok(Box::new(MySqlExecutor { conn }))
    }
}

struct MySqlExecutor {
    conn: Conn,
}

#[async_trait]
impl SqlExecutor for MySqlExecutor {
    async fn execute(&mut self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SqlError> {
        let rows: Vec<Row> = if params.is_empty() {
            self.conn.query(query).await
        } else {
            let params = Params::Positional(params.iter().map(to_mysql_value).collect());
            self.conn.exec(query, params).await
        }
        .map_err(|e| SqlError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(decode_row).collect())
    }

    async fn close(self: Box<Self>) -> Result<(), SqlError> {
        self.conn
            .disconnect()
            .await
            .map_err(|e| SqlError::Query(e.to_string()))
    }
}

fn to_mysql_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Text(s) => Value::from(s.as_str()),
        SqlValue::Int(i) => Value::Int(*i),
        SqlValue::Bool(b) => Value::Int(i64::from(*b)),
        SqlValue::Null => Value::NULL,
    }
}

fn decode_row(row: Row) -> SqlRow {
    let columns = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().into_owned())
        .collect();
    let values = (0..row.len())
        .map(|i| match row.as_ref(i).cloned().unwrap_or(Value::NULL) {
            Value::NULL => SqlValue::Null,
            Value::Bytes(bytes) => SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
            Value::Int(i) => SqlValue::Int(i),
            Value::UInt(u) => match i64::try_from(u) {
                Ok(i) => SqlValue::Int(i),
                Err(_) => SqlValue::Text(u.to_string()),
            },
            other => SqlValue::Text(other.as_sql(true)),
        })
        .collect();
    SqlRow::new(columns, values)
}
