//! Installations behind PGBouncer: many installations share a logical database, each
//! isolated in its own schema owned by its own role. PGBouncer authenticates users
//! through a lookup function over a shared auth table instead of `pg_shadow`.

use std::sync::Arc;

use async_trait::async_trait;
use database_api::models::{
    DatabaseMigration, DatabaseSchema, DatabaseSchemaFilter, DatabaseType, LogicalDatabase,
    LogicalDatabaseFilter, MultitenantDatabaseState,
};
use database_api::secret::RdsSecret;
use k8s_openapi::api::core::v1::Secret;
use uuid::Uuid;

use crate::context::Context;
use crate::dialect::{
    ConnectionParams, ConnectionStrings, POSTGRES_ROLE_EXISTS, PostgresDialect, SqlDialect,
    encode_userinfo,
};
use crate::error::{PlacementError, ResultExt};
use crate::k8s_secret::database_secret;
use crate::metrics::observe_lifecycle;
use crate::multitenant::InstallationDatabase;
use crate::naming::{self, PGBOUNCER_ADMIN_DATABASE, PGBOUNCER_AUTH_USERNAME};
use crate::placement::ClaimedDatabase;
use crate::secrets::{SecretError, get_or_create_secret};
use crate::sql::escaping::Escaping;
use crate::sql::{ScopedConnection, SqlValue};

const DATABASE_TYPE: DatabaseType = DatabaseType::PostgresPgbouncerAurora;

pub(crate) const TABLE_EXISTS: &str =
    "SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2";
pub(crate) const CREATE_AUTH_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS pgbouncer";
pub(crate) const CREATE_AUTH_TABLE: &str =
    "CREATE TABLE pgbouncer.pgbouncer_users (usename NAME PRIMARY KEY, passwd TEXT NOT NULL)";
pub(crate) const CREATE_AUTH_FUNCTION: &str = "CREATE OR REPLACE FUNCTION pgbouncer.get_auth(p_usename TEXT) \
RETURNS TABLE(username TEXT, password TEXT) AS $$ \
BEGIN RETURN QUERY SELECT usename::TEXT, passwd::TEXT FROM pgbouncer.pgbouncer_users WHERE usename = p_usename; END; \
$$ LANGUAGE plpgsql SECURITY DEFINER";
pub(crate) const REVOKE_AUTH_FUNCTION: &str =
    "REVOKE ALL ON FUNCTION pgbouncer.get_auth(p_usename TEXT) FROM PUBLIC";
pub(crate) const GRANT_AUTH_SCHEMA: &str = "GRANT USAGE ON SCHEMA pgbouncer TO pgbouncer";
pub(crate) const GRANT_AUTH_FUNCTION: &str =
    "GRANT EXECUTE ON FUNCTION pgbouncer.get_auth(p_usename TEXT) TO pgbouncer";
pub(crate) const UPSERT_AUTH_ROW: &str = "INSERT INTO pgbouncer.pgbouncer_users (usename, passwd) VALUES ($1, $2) \
ON CONFLICT (usename) DO UPDATE SET passwd = EXCLUDED.passwd";
pub(crate) const DELETE_AUTH_ROW: &str = "DELETE FROM pgbouncer.pgbouncer_users WHERE usename = $1";

pub struct RdsMultitenantPgbouncerDatabase {
    ctx: Arc<Context>,
}

impl RdsMultitenantPgbouncerDatabase {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn provision_locked(
        &self,
        installation_id: &str,
        claimed: &mut ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        self.ctx
            .refresh_endpoints(&mut claimed.database, &claimed.cluster)
            .await?;
        if claimed.database.state == MultitenantDatabaseState::ProvisioningRequested {
            self.setup_cluster(claimed).await?;
        }

        let logical_database = self.select_logical_database(installation_id, claimed).await?;
        let secret = get_or_create_secret(
            &*self.ctx.secrets,
            &naming::installation_secret_name(installation_id),
            &naming::pgbouncer_username(installation_id),
            &Context::secret_tags(installation_id, &claimed.database.id),
        )
        .await
        .context_for(|| format!("failed to get or create secret of installation {installation_id}"))?;

        let mut admin = self
            .ctx
            .master_connection(claimed, Some(PGBOUNCER_ADMIN_DATABASE))
            .await?;
        let result = self
            .ensure_installation_role(&mut admin, &secret, &logical_database, &claimed.database.id)
            .await;
        admin.finish().await;
        result?;

        let mut conn = self
            .ctx
            .master_connection(claimed, Some(&logical_database.name))
            .await?;
        let schema_name = naming::pgbouncer_schema_name(installation_id);
        let result = conn
            .execute(
                &format!(
                    "CREATE SCHEMA IF NOT EXISTS {schema} AUTHORIZATION {schema}",
                    schema = schema_name.pg_quote()
                ),
                &[],
            )
            .await
            .context_for(|| {
                format!("failed to create schema {schema_name} in {}", logical_database.name)
            });
        conn.finish().await;
        result?;

        self.ensure_schema_record(installation_id, &logical_database)
            .await?;
        self.ctx.add_membership(claimed, installation_id).await?;
        tracing::info!(
            "installation {installation_id} provisioned in logical database {} on multitenant database {}",
            logical_database.name,
            claimed.database.id
        );
        Ok(())
    }

    /// One-time setup of the auth user, table and lookup function. Every statement is
    /// idempotent, so an interrupted setup is simply run again.
    async fn setup_cluster(&self, claimed: &mut ClaimedDatabase) -> Result<(), PlacementError> {
        let database_id = claimed.database.id.clone();
        tracing::info!("setting up pgbouncer authentication on multitenant database {database_id}");

        let secret = get_or_create_secret(
            &*self.ctx.secrets,
            &naming::pgbouncer_auth_secret_name(&claimed.database.vpc_id),
            PGBOUNCER_AUTH_USERNAME,
            &[],
        )
        .await
        .context_for(|| format!("failed to get or create the pgbouncer secret of {database_id}"))?;

        let mut conn = self
            .ctx
            .master_connection(claimed, Some(PGBOUNCER_ADMIN_DATABASE))
            .await?;
        let result = Self::setup_auth_objects(&mut conn, &secret).await;
        conn.finish().await;
        result.context_for(|| format!("failed to set up pgbouncer authentication on {database_id}"))?;

        let mut updated = claimed.database.clone();
        updated.state = MultitenantDatabaseState::Stable;
        self.ctx
            .registry
            .update_multitenant_database(&updated)
            .await
            .context_for(|| format!("failed to mark multitenant database {database_id} stable"))?;
        claimed.database = updated;
        Ok(())
    }

    async fn setup_auth_objects(
        conn: &mut ScopedConnection,
        secret: &RdsSecret,
    ) -> Result<(), crate::sql::SqlError> {
        PostgresDialect
            .ensure_user(conn, PGBOUNCER_AUTH_USERNAME, &secret.master_password)
            .await?;
        conn.execute(CREATE_AUTH_SCHEMA, &[]).await?;
        let table_exists = conn
            .exists(
                TABLE_EXISTS,
                &[
                    naming::PGBOUNCER_AUTH_SCHEMA.into(),
                    naming::PGBOUNCER_USERS_TABLE.into(),
                ],
            )
            .await?;
        if !table_exists {
            conn.execute(CREATE_AUTH_TABLE, &[]).await?;
        }
        for query in [
            CREATE_AUTH_FUNCTION,
            REVOKE_AUTH_FUNCTION,
            GRANT_AUTH_SCHEMA,
            GRANT_AUTH_FUNCTION,
        ] {
            conn.execute(query, &[]).await?;
        }
        Ok(())
    }

    /// The logical database the installation's schema lives in: the one it already has,
    /// else the first with room, else a new one. The database itself is ensured to exist
    /// and carry its settings in every case.
    async fn select_logical_database(
        &self,
        installation_id: &str,
        claimed: &ClaimedDatabase,
    ) -> Result<LogicalDatabase, PlacementError> {
        let database_id = claimed.database.id.as_str();
        let registry = &self.ctx.registry;

        let existing = registry
            .get_database_schema_for_installation(installation_id)
            .await
            .context_for(|| format!("failed to get the schema of installation {installation_id}"))?;
        let logical_database = match existing {
            Some(schema) => registry
                .get_logical_database(&schema.logical_database_id)
                .await
                .context_for(|| {
                    format!("failed to get logical database {}", schema.logical_database_id)
                })?
                .ok_or_else(|| {
                    PlacementError::validation(
                        database_id,
                        format!(
                            "schema {} refers to missing logical database {}",
                            schema.id, schema.logical_database_id
                        ),
                    )
                })?,
            None => self.logical_database_with_room(claimed).await?,
        };

        let mut conn = self
            .ctx
            .master_connection(claimed, Some(PGBOUNCER_ADMIN_DATABASE))
            .await?;
        let result = Self::configure_logical_database(&mut conn, &logical_database.name).await;
        conn.finish().await;
        result.context_for(|| {
            format!(
                "failed to configure logical database {} on {database_id}",
                logical_database.name
            )
        })?;
        Ok(logical_database)
    }

    async fn logical_database_with_room(
        &self,
        claimed: &ClaimedDatabase,
    ) -> Result<LogicalDatabase, PlacementError> {
        let database_id = claimed.database.id.as_str();
        let registry = &self.ctx.registry;
        let max_schemas = match claimed.database.max_installations_per_logical_database {
            n if n > 0 => n as usize,
            _ => self.ctx.config.max_installations_per_logical_database.max(1) as usize,
        };

        let logical_databases = registry
            .get_logical_databases(&LogicalDatabaseFilter {
                multitenant_database_id: Some(database_id.to_string()),
                ..Default::default()
            })
            .await
            .context_for(|| format!("failed to list logical databases of {database_id}"))?;
        for logical_database in logical_databases {
            let schemas = registry
                .get_database_schemas(&DatabaseSchemaFilter {
                    logical_database_id: Some(logical_database.id.clone()),
                    ..Default::default()
                })
                .await
                .context_for(|| {
                    format!("failed to list schemas of logical database {}", logical_database.id)
                })?;
            if schemas.len() < max_schemas {
                return Ok(logical_database);
            }
        }

        let id = Uuid::new_v4();
        let mut logical_database = LogicalDatabase {
            id: id.to_string(),
            multitenant_database_id: database_id.to_string(),
            name: naming::logical_database_name(id),
            create_at: 0,
            delete_at: 0,
        };
        registry
            .create_logical_database(&mut logical_database)
            .await
            .context_for(|| format!("failed to register a logical database on {database_id}"))?;
        tracing::info!(
            "created logical database {} on multitenant database {database_id}",
            logical_database.name
        );
        Ok(logical_database)
    }

    async fn configure_logical_database(
        conn: &mut ScopedConnection,
        name: &str,
    ) -> Result<(), crate::sql::SqlError> {
        PostgresDialect.ensure_database(conn, name).await?;
        let quoted = name.pg_quote();
        for query in [
            format!("ALTER DATABASE {quoted} SET default_text_search_config TO 'pg_catalog.english'"),
            format!("ALTER DATABASE {quoted} SET search_path TO \"$user\""),
            format!("REVOKE ALL ON DATABASE {quoted} FROM PUBLIC"),
        ] {
            conn.execute(&query, &[]).await?;
        }
        Ok(())
    }

    /// Role, auth table row and connect grant of one installation, run on the admin database.
    async fn ensure_installation_role(
        &self,
        conn: &mut ScopedConnection,
        secret: &RdsSecret,
        logical_database: &LogicalDatabase,
        database_id: &str,
    ) -> Result<(), PlacementError> {
        let username = secret.master_username.as_str();
        PostgresDialect
            .ensure_user(conn, username, &secret.master_password)
            .await
            .context_for(|| format!("failed to create role {username} on {database_id}"))?;
        conn.execute(&format!("GRANT {} TO CURRENT_USER", username.pg_quote()), &[])
            .await
            .context_for(|| format!("failed to grant role {username} to the master user"))?;

        let hash = postgres_protocol::password::md5(secret.master_password.as_bytes(), username);
        conn.execute_redacted(
            UPSERT_AUTH_ROW,
            &[SqlValue::from(username), SqlValue::from(hash)],
            "failed to store pgbouncer credentials",
        )
        .await
        .context_for(|| format!("failed to register {username} with pgbouncer on {database_id}"))?;

        for query in [
            format!(
                "GRANT CONNECT ON DATABASE {} TO {}",
                logical_database.name.pg_quote(),
                username.pg_quote()
            ),
            GRANT_AUTH_FUNCTION.to_string(),
        ] {
            conn.execute(&query, &[])
                .await
                .context_for(|| format!("failed to grant privileges to {username} on {database_id}"))?;
        }
        Ok(())
    }

    async fn ensure_schema_record(
        &self,
        installation_id: &str,
        logical_database: &LogicalDatabase,
    ) -> Result<(), PlacementError> {
        let registry = &self.ctx.registry;
        let existing = registry
            .get_database_schema_for_installation(installation_id)
            .await
            .context_for(|| format!("failed to get the schema of installation {installation_id}"))?;
        if existing.is_some() {
            return Ok(());
        }
        let mut schema = DatabaseSchema {
            id: Uuid::new_v4().to_string(),
            logical_database_id: logical_database.id.clone(),
            installation_id: installation_id.to_string(),
            name: naming::pgbouncer_schema_name(installation_id),
            create_at: 0,
            delete_at: 0,
        };
        registry
            .create_database_schema(&mut schema)
            .await
            .context_for(|| format!("failed to register the schema of installation {installation_id}"))
    }

    async fn teardown_locked(
        &self,
        installation_id: &str,
        claimed: &mut ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        let registry = &self.ctx.registry;
        let database_id = claimed.database.id.clone();
        let username = naming::pgbouncer_username(installation_id);
        let schema_name = naming::pgbouncer_schema_name(installation_id);

        let schema = registry
            .get_database_schema_for_installation(installation_id)
            .await
            .context_for(|| format!("failed to get the schema of installation {installation_id}"))?;
        let logical_database = match &schema {
            Some(schema) => registry
                .get_logical_database(&schema.logical_database_id)
                .await
                .context_for(|| {
                    format!("failed to get logical database {}", schema.logical_database_id)
                })?,
            None => None,
        };

        let mut admin = self
            .ctx
            .master_connection(claimed, Some(PGBOUNCER_ADMIN_DATABASE))
            .await?;
        let role_exists = admin
            .exists(POSTGRES_ROLE_EXISTS, &[username.as_str().into()])
            .await;
        let logical_exists = match &logical_database {
            Some(logical_database) => {
                PostgresDialect
                    .database_exists(&mut admin, &logical_database.name)
                    .await
            }
            None => Ok(false),
        };
        admin.finish().await;
        let role_exists = role_exists.context_for(|| format!("failed to look up role {username}"))?;
        let logical_exists =
            logical_exists.context_for(|| format!("failed to look up the logical database of {installation_id}"))?;

        if let (Some(logical_database), true) = (&logical_database, logical_exists) {
            let mut conn = self
                .ctx
                .master_connection(claimed, Some(&logical_database.name))
                .await?;
            let result = Self::drop_schema(&mut conn, &schema_name, &username, role_exists).await;
            conn.finish().await;
            result.context_for(|| {
                format!("failed to drop schema {schema_name} from {}", logical_database.name)
            })?;
        }

        let mut admin = self
            .ctx
            .master_connection(claimed, Some(PGBOUNCER_ADMIN_DATABASE))
            .await?;
        let result = Self::drop_role(&mut admin, &username).await;
        admin.finish().await;
        result.context_for(|| format!("failed to drop role {username} on {database_id}"))?;

        if let Some(schema) = &schema {
            registry
                .delete_database_schema(&schema.id)
                .await
                .context_for(|| format!("failed to delete schema record {}", schema.id))?;
        }

        let secret_name = naming::installation_secret_name(installation_id);
        self.ctx
            .secrets
            .delete_secret(&secret_name)
            .await
            .context_for(|| format!("failed to delete secret {secret_name}"))?;

        self.ctx.remove_membership(claimed, installation_id).await?;
        tracing::info!(
            "installation {installation_id} removed from multitenant database {database_id}"
        );
        Ok(())
    }

    async fn drop_schema(
        conn: &mut ScopedConnection,
        schema_name: &str,
        username: &str,
        role_exists: bool,
    ) -> Result<(), crate::sql::SqlError> {
        conn.execute(
            &format!("DROP SCHEMA IF EXISTS {} CASCADE", schema_name.pg_quote()),
            &[],
        )
        .await?;
        // Also revokes the role's privileges on shared objects, which would block DROP ROLE.
        if role_exists {
            conn.execute(&format!("DROP OWNED BY {}", username.pg_quote()), &[])
                .await?;
        }
        Ok(())
    }

    async fn drop_role(conn: &mut ScopedConnection, username: &str) -> Result<(), crate::sql::SqlError> {
        conn.execute(DELETE_AUTH_ROW, &[SqlValue::from(username)])
            .await?;
        PostgresDialect.drop_user(conn, username).await
    }

    fn unsupported_migration(installation_id: &str) -> PlacementError {
        PlacementError::Unsupported(format!(
            "migrations of {DATABASE_TYPE} databases are not supported (installation {installation_id})"
        ))
    }
}

/// Connection strings pointing at the in-cluster pooler instead of the cluster endpoints.
pub(crate) fn pooler_connection_strings(
    host: &str,
    port: u16,
    params: &ConnectionParams<'_>,
) -> ConnectionStrings {
    let url = format!(
        "postgres://{}:{}@{host}:{port}/{}?connect_timeout=10&sslmode=disable",
        encode_userinfo(params.username),
        encode_userinfo(params.password),
        params.database
    );
    ConnectionStrings {
        writer: url.clone(),
        readers: url,
        check_url: None,
    }
}

#[async_trait]
impl InstallationDatabase for RdsMultitenantPgbouncerDatabase {
    fn database_type(&self) -> DatabaseType {
        DATABASE_TYPE
    }

    #[tracing::instrument(skip(self), fields(database_type = %DATABASE_TYPE))]
    async fn provision(&self, installation_id: &str) -> Result<(), PlacementError> {
        let result: Result<(), PlacementError> = async {
            naming::validate_installation_id(installation_id)?;
            let vpc_id = self.ctx.resolve_vpc(installation_id).await?;
            let mut claimed = self
                .ctx
                .placement
                .select_and_lock(installation_id, &vpc_id, DATABASE_TYPE)
                .await?;
            let result = self.provision_locked(installation_id, &mut claimed).await;
            claimed.release().await;
            result
        }
        .await;
        observe_lifecycle("provision", DATABASE_TYPE, &result);
        result
    }

    #[tracing::instrument(skip(self), fields(database_type = %DATABASE_TYPE))]
    async fn teardown(&self, installation_id: &str, keep_data: bool) -> Result<(), PlacementError> {
        if keep_data {
            tracing::info!(
                "keeping the data of installation {installation_id}, its schema is left in place"
            );
            return Ok(());
        }
        let result: Result<(), PlacementError> = async {
            naming::validate_installation_id(installation_id)?;
            let Some(mut claimed) = self
                .ctx
                .placement
                .get_and_lock_assigned(installation_id)
                .await?
            else {
                tracing::info!(
                    "installation {installation_id} is not assigned to any multitenant database, nothing to tear down"
                );
                return Ok(());
            };
            let result = self.teardown_locked(installation_id, &mut claimed).await;
            claimed.release().await;
            result
        }
        .await;
        observe_lifecycle("teardown", DATABASE_TYPE, &result);
        result
    }

    async fn snapshot(&self, installation_id: &str) -> Result<(), PlacementError> {
        Err(PlacementError::Unsupported(format!(
            "snapshots of multitenant databases are not supported (installation {installation_id})"
        )))
    }

    async fn generate_database_secret(&self, installation_id: &str) -> Result<Secret, PlacementError> {
        naming::validate_installation_id(installation_id)?;
        let not_assigned = || {
            PlacementError::NotAssigned(format!(
                "installation {installation_id} is not assigned to a multitenant database"
            ))
        };
        self.ctx
            .placement
            .discovery()
            .find_assigned(installation_id)
            .await?
            .ok_or_else(not_assigned)?;

        let registry = &self.ctx.registry;
        let schema = registry
            .get_database_schema_for_installation(installation_id)
            .await
            .context_for(|| format!("failed to get the schema of installation {installation_id}"))?
            .ok_or_else(not_assigned)?;
        let logical_database = registry
            .get_logical_database(&schema.logical_database_id)
            .await
            .context_for(|| format!("failed to get logical database {}", schema.logical_database_id))?
            .ok_or_else(not_assigned)?;

        let secret_name = naming::installation_secret_name(installation_id);
        let secret = self
            .ctx
            .secrets
            .get_secret(&secret_name)
            .await
            .and_then(|s| s.ok_or_else(|| SecretError::NotFound(secret_name.clone())))
            .context_for(|| format!("failed to get secret of installation {installation_id}"))?;

        let pgbouncer = &self.ctx.config.pgbouncer;
        let strings = pooler_connection_strings(
            &pgbouncer.host,
            pgbouncer.port,
            &ConnectionParams {
                username: &secret.master_username,
                password: &secret.master_password,
                database: &logical_database.name,
                writer_endpoint: &pgbouncer.host,
                reader_endpoint: &pgbouncer.host,
            },
        );
        Ok(database_secret(installation_id, &strings))
    }

    async fn refresh_resource_metadata(&self, installation_id: &str) -> Result<(), PlacementError> {
        naming::validate_installation_id(installation_id)?;
        let mut claimed = self
            .ctx
            .placement
            .get_and_lock_assigned(installation_id)
            .await?
            .ok_or_else(|| {
                PlacementError::NotAssigned(format!(
                    "installation {installation_id} is not assigned to a multitenant database"
                ))
            })?;
        let result = self
            .ctx
            .refresh_endpoints(&mut claimed.database, &claimed.cluster)
            .await;
        claimed.release().await;
        result.map(|_| ())
    }

    async fn migrate_out(&self, migration: &DatabaseMigration) -> Result<(), PlacementError> {
        Err(Self::unsupported_migration(&migration.installation_id))
    }

    async fn migrate_to(&self, migration: &DatabaseMigration) -> Result<(), PlacementError> {
        Err(Self::unsupported_migration(&migration.installation_id))
    }

    async fn teardown_migrated(&self, migration: &DatabaseMigration) -> Result<(), PlacementError> {
        Err(Self::unsupported_migration(&migration.installation_id))
    }

    async fn rollback_migration(&self, migration: &DatabaseMigration) -> Result<(), PlacementError> {
        Err(Self::unsupported_migration(&migration.installation_id))
    }
}
