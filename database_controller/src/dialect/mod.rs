//! Engine-specific DDL behind one interface, so the provisioning state machine never
//! branches on the engine.
//!
//! Every `ensure_*` operation checks for existence before creating: user creation in
//! particular cannot use `IF NOT EXISTS` together with a password on every supported
//! engine version.

mod mysql;
mod postgres;

use async_trait::async_trait;
use database_api::models::DatabaseEngine;

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub(crate) use mysql::{MYSQL_DATABASE_EXISTS, MYSQL_USER_EXISTS};
pub(crate) use postgres::{POSTGRES_DATABASE_EXISTS, POSTGRES_ROLE_EXISTS};

use crate::sql::{ScopedConnection, SqlError};

/// Connection settings handed to the installation workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStrings {
    pub writer: String,
    pub readers: String,
    /// URL the workload polls to decide whether its database is reachable.
    pub check_url: Option<String>,
}

/// Credentials and addresses for building [`ConnectionStrings`].
pub struct ConnectionParams<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub database: &'a str,
    pub writer_endpoint: &'a str,
    pub reader_endpoint: &'a str,
}

#[async_trait]
pub trait SqlDialect: Send + Sync {
    fn engine(&self) -> DatabaseEngine;

    async fn database_exists(
        &self,
        conn: &mut ScopedConnection,
        database: &str,
    ) -> Result<bool, SqlError>;

    async fn ensure_database(
        &self,
        conn: &mut ScopedConnection,
        database: &str,
    ) -> Result<(), SqlError>;

    async fn ensure_user(
        &self,
        conn: &mut ScopedConnection,
        username: &str,
        password: &str,
    ) -> Result<(), SqlError>;

    async fn grant_full_permissions(
        &self,
        conn: &mut ScopedConnection,
        database: &str,
        username: &str,
    ) -> Result<(), SqlError>;

    /// Succeeds if the database is already gone.
    async fn drop_database(
        &self,
        conn: &mut ScopedConnection,
        database: &str,
    ) -> Result<(), SqlError>;

    /// Succeeds if the user is already gone.
    async fn drop_user(&self, conn: &mut ScopedConnection, username: &str) -> Result<(), SqlError>;

    fn connection_strings(&self, params: &ConnectionParams<'_>) -> ConnectionStrings;
}

pub fn dialect_for(engine: DatabaseEngine) -> &'static dyn SqlDialect {
    match engine {
        DatabaseEngine::MySql => &MySqlDialect,
        DatabaseEngine::Postgres => &PostgresDialect,
    }
}

/// Percent-encode a URL userinfo component.
pub(crate) fn encode_userinfo(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
