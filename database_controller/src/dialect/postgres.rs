use async_trait::async_trait;
use database_api::models::DatabaseEngine;

use super::{ConnectionParams, ConnectionStrings, SqlDialect, encode_userinfo};
use crate::sql::escaping::{Escaping, escape_literal};
use crate::sql::{ScopedConnection, SqlError, SqlValue};

pub(crate) const POSTGRES_DATABASE_EXISTS: &str = "SELECT 1 FROM pg_database WHERE datname = $1";
pub(crate) const POSTGRES_ROLE_EXISTS: &str = "SELECT 1 FROM pg_roles WHERE rolname = $1";
const TERMINATE_BACKENDS: &str = "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()";

pub struct PostgresDialect;

#[async_trait]
impl SqlDialect for PostgresDialect {
    fn engine(&self) -> DatabaseEngine {
        DatabaseEngine::Postgres
    }

    async fn database_exists(
        &self,
        conn: &mut ScopedConnection,
        database: &str,
    ) -> Result<bool, SqlError> {
        conn.exists(POSTGRES_DATABASE_EXISTS, &[database.into()]).await
    }

    async fn ensure_database(
        &self,
        conn: &mut ScopedConnection,
        database: &str,
    ) -> Result<(), SqlError> {
        if self.database_exists(conn, database).await? {
            return Ok(());
        }
        conn.execute(&format!("CREATE DATABASE {}", database.pg_quote()), &[])
            .await?;
        Ok(())
    }

    async fn ensure_user(
        &self,
        conn: &mut ScopedConnection,
        username: &str,
        password: &str,
    ) -> Result<(), SqlError> {
        if conn.exists(POSTGRES_ROLE_EXISTS, &[username.into()]).await? {
            return Ok(());
        }
        // CREATE ROLE cannot take the password as a bind parameter.
        let query = format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD {}",
            username.pg_quote(),
            escape_literal(password)
        );
        conn.execute_redacted(&query, &[], "failed to create postgres role")
            .await?;
        Ok(())
    }

    async fn grant_full_permissions(
        &self,
        conn: &mut ScopedConnection,
        database: &str,
        username: &str,
    ) -> Result<(), SqlError> {
        let database = database.pg_quote();
        let username = username.pg_quote();
        // The master user needs membership in the role before it may hand over ownership.
        for query in [
            format!("GRANT {username} TO CURRENT_USER"),
            format!("REVOKE ALL ON DATABASE {database} FROM PUBLIC"),
            format!("GRANT ALL PRIVILEGES ON DATABASE {database} TO {username}"),
            format!("ALTER DATABASE {database} OWNER TO {username}"),
        ] {
            conn.execute(&query, &[]).await?;
        }
        Ok(())
    }

    async fn drop_database(
        &self,
        conn: &mut ScopedConnection,
        database: &str,
    ) -> Result<(), SqlError> {
        if !self.database_exists(conn, database).await? {
            return Ok(());
        }
        conn.execute(TERMINATE_BACKENDS, &[SqlValue::from(database)])
            .await?;
        conn.execute(&format!("DROP DATABASE IF EXISTS {}", database.pg_quote()), &[])
            .await?;
        Ok(())
    }

    async fn drop_user(&self, conn: &mut ScopedConnection, username: &str) -> Result<(), SqlError> {
        conn.execute(&format!("DROP ROLE IF EXISTS {}", username.pg_quote()), &[])
            .await?;
        Ok(())
    }

    fn connection_strings(&self, params: &ConnectionParams<'_>) -> ConnectionStrings {
        let url = |host: &str| {
            format!(
                "postgres://{}:{}@{}:5432/{}?connect_timeout=10&sslmode=require",
                encode_userinfo(params.username),
                encode_userinfo(params.password),
                host,
                params.database
            )
        };
        let writer = url(params.writer_endpoint);
        ConnectionStrings {
            check_url: Some(writer.clone()),
            writer,
            readers: url(params.reader_endpoint),
        }
    }
}
