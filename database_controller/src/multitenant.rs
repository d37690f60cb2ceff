//! Lifecycle of installations on shared MySQL and Postgres Aurora clusters, one database
//! and one user per installation.

use std::sync::Arc;

use async_trait::async_trait;
use database_api::models::{DatabaseMigration, DatabaseType};
use k8s_openapi::api::core::v1::Secret;

use crate::context::{Context, ensure_type};
use crate::dialect::{ConnectionParams, SqlDialect, dialect_for};
use crate::error::{PlacementError, ResultExt};
use crate::k8s_secret::database_secret;
use crate::metrics::observe_lifecycle;
use crate::multitenant_pgbouncer::RdsMultitenantPgbouncerDatabase;
use crate::naming;
use crate::placement::ClaimedDatabase;
use crate::secrets::{SecretError, get_or_create_secret};
use crate::sql::ScopedConnection;

/// Operations on the database of one installation. Each call takes and releases the
/// registry lock of every cluster it touches.
#[async_trait]
pub trait InstallationDatabase: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Place the installation on a shared cluster and create its database, user and
    /// credentials. Safe to call again after a partial failure.
    async fn provision(&self, installation_id: &str) -> Result<(), PlacementError>;

    /// Remove everything `provision` created. With `keep_data`, nothing is touched.
    async fn teardown(&self, installation_id: &str, keep_data: bool) -> Result<(), PlacementError>;

    async fn snapshot(&self, installation_id: &str) -> Result<(), PlacementError>;

    async fn generate_database_secret(&self, installation_id: &str) -> Result<Secret, PlacementError>;

    async fn refresh_resource_metadata(&self, installation_id: &str) -> Result<(), PlacementError>;

    /// Move the installation from the source cluster's active set into its migrated set.
    /// Its data stays in place until `teardown_migrated`.
    async fn migrate_out(&self, migration: &DatabaseMigration) -> Result<(), PlacementError>;

    /// Assign the installation to the destination cluster and provision it there.
    async fn migrate_to(&self, migration: &DatabaseMigration) -> Result<(), PlacementError>;

    /// Drop the installation's data on the source cluster after a completed migration.
    async fn teardown_migrated(&self, migration: &DatabaseMigration) -> Result<(), PlacementError>;

    /// Undo `migrate_out` and `migrate_to`: the installation is active on the source again
    /// and its destination database is dropped.
    async fn rollback_migration(&self, migration: &DatabaseMigration) -> Result<(), PlacementError>;
}

/// The implementation for `database_type`.
pub fn installation_database(
    ctx: Arc<Context>,
    database_type: DatabaseType,
) -> Box<dyn InstallationDatabase> {
    if database_type.is_proxied() {
        Box::new(RdsMultitenantPgbouncerDatabase::new(ctx))
    } else {
        Box::new(RdsMultitenantDatabase::new(ctx, database_type))
    }
}

pub struct RdsMultitenantDatabase {
    database_type: DatabaseType,
    ctx: Arc<Context>,
}

impl RdsMultitenantDatabase {
    pub fn new(ctx: Arc<Context>, database_type: DatabaseType) -> Self {
        debug_assert!(!database_type.is_proxied());
        Self { database_type, ctx }
    }

    fn dialect(&self) -> &'static dyn SqlDialect {
        dialect_for(self.database_type.engine())
    }

    async fn provision_locked(
        &self,
        installation_id: &str,
        claimed: &mut ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        self.ctx
            .refresh_endpoints(&mut claimed.database, &claimed.cluster)
            .await?;
        self.ensure_installation_objects(installation_id, claimed)
            .await?;
        if let Err(e) = self.ctx.add_membership(claimed, installation_id).await {
            if matches!(e, PlacementError::ConcurrentAssignment { .. }) {
                // The objects just created here belong to no membership.
                if let Err(drop_err) = self.drop_installation_objects(installation_id, claimed).await {
                    tracing::warn!(
                        "failed to drop objects of installation {installation_id} from {}: {drop_err}",
                        claimed.database.id
                    );
                }
            }
            return Err(e);
        }
        tracing::info!(
            "installation {installation_id} provisioned on multitenant database {}",
            claimed.database.id
        );
        Ok(())
    }

    /// Database, secret, user and grants. Every step checks before it creates.
    async fn ensure_installation_objects(
        &self,
        installation_id: &str,
        claimed: &ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        let mut conn = self.ctx.master_connection(claimed, None).await?;
        let result = self
            .ensure_installation_objects_on(&mut conn, installation_id, &claimed.database.id)
            .await;
        conn.finish().await;
        result
    }

    async fn ensure_installation_objects_on(
        &self,
        conn: &mut ScopedConnection,
        installation_id: &str,
        database_id: &str,
    ) -> Result<(), PlacementError> {
        let dialect = self.dialect();
        let database_name = naming::database_name(installation_id);
        let username = naming::database_username(installation_id);

        dialect
            .ensure_database(conn, &database_name)
            .await
            .context_for(|| format!("failed to create database {database_name} on {database_id}"))?;

        let secret_name = naming::installation_secret_name(installation_id);
        let secret = get_or_create_secret(
            &*self.ctx.secrets,
            &secret_name,
            &username,
            &Context::secret_tags(installation_id, database_id),
        )
        .await
        .context_for(|| format!("failed to get or create secret of installation {installation_id}"))?;

        dialect
            .ensure_user(conn, &secret.master_username, &secret.master_password)
            .await
            .context_for(|| format!("failed to create user {username} on {database_id}"))?;
        dialect
            .grant_full_permissions(conn, &database_name, &secret.master_username)
            .await
            .context_for(|| {
                format!("failed to grant {username} permissions on {database_name} on {database_id}")
            })?;
        Ok(())
    }

    async fn drop_installation_objects(
        &self,
        installation_id: &str,
        claimed: &ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        let mut conn = self.ctx.master_connection(claimed, None).await?;
        let result = self
            .drop_installation_objects_on(&mut conn, installation_id, &claimed.database.id)
            .await;
        conn.finish().await;
        result
    }

    async fn drop_installation_objects_on(
        &self,
        conn: &mut ScopedConnection,
        installation_id: &str,
        database_id: &str,
    ) -> Result<(), PlacementError> {
        let dialect = self.dialect();
        let database_name = naming::database_name(installation_id);
        let username = naming::database_username(installation_id);
        dialect
            .drop_database(conn, &database_name)
            .await
            .context_for(|| format!("failed to drop database {database_name} on {database_id}"))?;
        dialect
            .drop_user(conn, &username)
            .await
            .context_for(|| format!("failed to drop user {username} on {database_id}"))?;
        Ok(())
    }

    async fn teardown_locked(
        &self,
        installation_id: &str,
        claimed: &mut ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        self.drop_installation_objects(installation_id, claimed)
            .await?;

        let secret_name = naming::installation_secret_name(installation_id);
        self.ctx
            .secrets
            .delete_secret(&secret_name)
            .await
            .context_for(|| format!("failed to delete secret {secret_name}"))?;

        self.ctx.remove_membership(claimed, installation_id).await?;
        tracing::info!(
            "installation {installation_id} removed from multitenant database {}",
            claimed.database.id
        );
        Ok(())
    }

    async fn migrate_out_locked(
        &self,
        installation_id: &str,
        claimed: &mut ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        let database = &claimed.database;
        if !database.installations.contains(installation_id) {
            if database.migrated_installations.contains(installation_id) {
                tracing::info!(
                    "installation {installation_id} is already migrated out of {}",
                    database.id
                );
                return Ok(());
            }
            return Err(PlacementError::NotAssigned(format!(
                "installation {installation_id} is not assigned to multitenant database {}",
                database.id
            )));
        }

        let mut updated = database.clone();
        updated.installations.remove(installation_id);
        updated.migrated_installations.add(installation_id);

        let registry = &self.ctx.registry;
        let updated_ref = &updated;
        self.ctx
            .counters
            .with_counter_rollback(
                &claimed.cluster.arn,
                &database.installations,
                &updated.installations,
                || async move {
                    registry
                        .update_multitenant_database(updated_ref)
                        .await
                        .context_for(|| {
                            format!(
                                "failed to move installation {installation_id} to the migrated set of {}",
                                updated_ref.id
                            )
                        })
                },
            )
            .await?;
        claimed.database = updated;
        Ok(())
    }

    async fn migrate_to_locked(
        &self,
        installation_id: &str,
        claimed: &mut ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        ensure_type(
            "migration",
            self.database_type,
            claimed.database.database_type,
        )?;
        if !claimed.database.installations.contains(installation_id) {
            let usage = self
                .ctx
                .counters
                .counter_value(&claimed.database.installations)
                .await?;
            let limit = self.ctx.placement.discovery().limit_for(self.database_type) as i64;
            if usage >= limit {
                return Err(PlacementError::CapacityExhausted {
                    installation_id: installation_id.to_string(),
                    database_type: self.database_type,
                    vpc_id: claimed.database.vpc_id.clone(),
                });
            }
        }

        self.ctx
            .refresh_endpoints(&mut claimed.database, &claimed.cluster)
            .await?;
        self.ctx.add_membership(claimed, installation_id).await?;
        self.ensure_installation_objects(installation_id, claimed)
            .await?;
        tracing::info!(
            "installation {installation_id} migrated to multitenant database {}",
            claimed.database.id
        );
        Ok(())
    }

    async fn teardown_migrated_locked(
        &self,
        installation_id: &str,
        claimed: &mut ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        if !claimed
            .database
            .migrated_installations
            .contains(installation_id)
        {
            tracing::info!(
                "installation {installation_id} is not in the migrated set of {}, nothing to tear down",
                claimed.database.id
            );
            return Ok(());
        }

        self.drop_installation_objects(installation_id, claimed)
            .await?;
        let database_id = claimed.database.id.clone();
        claimed.database.migrated_installations = self
            .ctx
            .registry
            .remove_migrated_installation_id(&database_id, installation_id)
            .await
            .context_for(|| {
                format!("failed to remove installation {installation_id} from the migrated set of {database_id}")
            })?;
        Ok(())
    }

    /// `destination` and `source` are both locked.
    async fn rollback_locked(
        &self,
        installation_id: &str,
        destination: &mut ClaimedDatabase,
        source: &mut ClaimedDatabase,
    ) -> Result<(), PlacementError> {
        // Leave the destination before rejoining the source, so the installation is never
        // active on both.
        if destination.database.installations.contains(installation_id) {
            self.ctx
                .remove_membership(destination, installation_id)
                .await?;
        }

        let source_id = source.database.id.clone();
        if source
            .database
            .migrated_installations
            .contains(installation_id)
        {
            source.database.migrated_installations = self
                .ctx
                .registry
                .remove_migrated_installation_id(&source_id, installation_id)
                .await
                .context_for(|| {
                    format!("failed to remove installation {installation_id} from the migrated set of {source_id}")
                })?;
        }
        self.ctx.add_membership(source, installation_id).await?;

        self.drop_installation_objects(installation_id, destination)
            .await?;
        tracing::info!(
            "migration of installation {installation_id} from {source_id} to {} rolled back",
            destination.database.id
        );
        Ok(())
    }
}

#[async_trait]
impl InstallationDatabase for RdsMultitenantDatabase {
    fn database_type(&self) -> DatabaseType {
        self.database_type
    }

    #[tracing::instrument(skip(self), fields(database_type = %self.database_type))]
    async fn provision(&self, installation_id: &str) -> Result<(), PlacementError> {
        let result: Result<(), PlacementError> = async {
            naming::validate_installation_id(installation_id)?;
            let vpc_id = self.ctx.resolve_vpc(installation_id).await?;
            let mut claimed = self
                .ctx
                .placement
                .select_and_lock(installation_id, &vpc_id, self.database_type)
                .await?;
            let result = self.provision_locked(installation_id, &mut claimed).await;
            claimed.release().await;
            result
        }
        .await;
        observe_lifecycle("provision", self.database_type, &result);
        result
    }

    #[tracing::instrument(skip(self), fields(database_type = %self.database_type))]
    async fn teardown(&self, installation_id: &str, keep_data: bool) -> Result<(), PlacementError> {
        if keep_data {
            tracing::info!(
                "keeping the data of installation {installation_id}, its database is left in place"
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
        observe_lifecycle("teardown", self.database_type, &result);
        result
    }

    async fn snapshot(&self, installation_id: &str) -> Result<(), PlacementError> {
        Err(PlacementError::Unsupported(format!(
            "snapshots of multitenant databases are not supported (installation {installation_id})"
        )))
    }

    async fn generate_database_secret(&self, installation_id: &str) -> Result<Secret, PlacementError> {
        naming::validate_installation_id(installation_id)?;
        let database = self
            .ctx
            .placement
            .discovery()
            .find_assigned(installation_id)
            .await?
            .ok_or_else(|| {
                PlacementError::NotAssigned(format!(
                    "installation {installation_id} is not assigned to a multitenant database"
                ))
            })?;
        ensure_type("secret generation", self.database_type, database.database_type)?;

        let secret_name = naming::installation_secret_name(installation_id);
        let secret = self
            .ctx
            .secrets
            .get_secret(&secret_name)
            .await
            .and_then(|s| s.ok_or_else(|| SecretError::NotFound(secret_name.clone())))
            .context_for(|| format!("failed to get secret of installation {installation_id}"))?;

        let database_name = naming::database_name(installation_id);
        let strings = self.dialect().connection_strings(&ConnectionParams {
            username: &secret.master_username,
            password: &secret.master_password,
            database: &database_name,
            writer_endpoint: &database.writer_endpoint,
            reader_endpoint: &database.reader_endpoint,
        });
        Ok(database_secret(installation_id, &strings))
    }

    #[tracing::instrument(skip(self), fields(database_type = %self.database_type))]
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

    #[tracing::instrument(skip_all, fields(installation_id = %migration.installation_id, source = %migration.source.multitenant_database_id))]
    async fn migrate_out(&self, migration: &DatabaseMigration) -> Result<(), PlacementError> {
        let installation_id = migration.installation_id.as_str();
        let result: Result<(), PlacementError> = async {
            ensure_type("migration", self.database_type, migration.source.database_type)?;
            naming::validate_installation_id(installation_id)?;
            let mut claimed = self
                .ctx
                .placement
                .claim_by_id(&migration.source.multitenant_database_id)
                .await?;
            let result = self.migrate_out_locked(installation_id, &mut claimed).await;
            claimed.release().await;
            result
        }
        .await;
        observe_lifecycle("migrate_out", self.database_type, &result);
        result
    }

    #[tracing::instrument(skip_all, fields(installation_id = %migration.installation_id, destination = %migration.destination.multitenant_database_id))]
    async fn migrate_to(&self, migration: &DatabaseMigration) -> Result<(), PlacementError> {
        let installation_id = migration.installation_id.as_str();
        let destination_id = migration.destination.multitenant_database_id.as_str();
        let result: Result<(), PlacementError> = async {
            ensure_type(
                "migration",
                self.database_type,
                migration.destination.database_type,
            )?;
            naming::validate_installation_id(installation_id)?;
            if let Some(assigned) = self
                .ctx
                .placement
                .discovery()
                .find_assigned(installation_id)
                .await?
            {
                if assigned.id != destination_id {
                    return Err(PlacementError::InvalidInstallation(format!(
                        "installation {installation_id} is still active on multitenant database {}",
                        assigned.id
                    )));
                }
            }
            let mut claimed = self.ctx.placement.claim_by_id(destination_id).await?;
            let result = self.migrate_to_locked(installation_id, &mut claimed).await;
            claimed.release().await;
            result
        }
        .await;
        observe_lifecycle("migrate_to", self.database_type, &result);
        result
    }

    #[tracing::instrument(skip_all, fields(installation_id = %migration.installation_id, source = %migration.source.multitenant_database_id))]
    async fn teardown_migrated(&self, migration: &DatabaseMigration) -> Result<(), PlacementError> {
        let installation_id = migration.installation_id.as_str();
        let result: Result<(), PlacementError> = async {
            ensure_type("migration", self.database_type, migration.source.database_type)?;
            naming::validate_installation_id(installation_id)?;
            let mut claimed = self
                .ctx
                .placement
                .claim_by_id(&migration.source.multitenant_database_id)
                .await?;
            let result = self
                .teardown_migrated_locked(installation_id, &mut claimed)
                .await;
            claimed.release().await;
            result
        }
        .await;
        observe_lifecycle("teardown_migrated", self.database_type, &result);
        result
    }

    #[tracing::instrument(skip_all, fields(installation_id = %migration.installation_id))]
    async fn rollback_migration(&self, migration: &DatabaseMigration) -> Result<(), PlacementError> {
        let installation_id = migration.installation_id.as_str();
        let source_id = migration.source.multitenant_database_id.as_str();
        let destination_id = migration.destination.multitenant_database_id.as_str();
        let result: Result<(), PlacementError> = async {
            // Only same-type rollbacks are supported for now.
            if migration.source.database_type != migration.destination.database_type {
                return Err(PlacementError::Unsupported(format!(
                    "rollback of a migration from {} to {} is not supported",
                    migration.source.database_type, migration.destination.database_type
                )));
            }
            ensure_type("rollback", self.database_type, migration.source.database_type)?;
            if source_id == destination_id {
                return Err(PlacementError::InvalidInstallation(format!(
                    "migration of installation {installation_id} has the same source and destination {source_id}"
                )));
            }
            naming::validate_installation_id(installation_id)?;

            // Destination first, then source, in every caller.
            let mut claimed = self
                .ctx
                .placement
                .claim_all(&[destination_id, source_id])
                .await?;
            let [destination, source] = claimed.as_mut_slice() else {
                return Err(PlacementError::validation(
                    destination_id,
                    "could not claim both sides of the migration",
                ));
            };
            let result = self
                .rollback_locked(installation_id, destination, source)
                .await;
            while let Some(database) = claimed.pop() {
                database.release().await;
            }
            result
        }
        .await;
        observe_lifecycle("rollback_migration", self.database_type, &result);
        result
    }
}
