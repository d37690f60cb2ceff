//! Shared state of the lifecycle state machines: collaborators, configuration, and the
//! steps every variant performs the same way.

use std::sync::Arc;

use database_api::models::{
    DatabaseType, InstallationIds, MultitenantDatabase, MultitenantDatabaseFilter,
};
use database_api::tags;

use crate::capacity::CounterTags;
use crate::cloud::{ClusterDescription, ResourceDirectory, find_vpc_for_cluster};
use crate::config::Config;
use crate::discovery::Discovery;
use crate::error::{PlacementError, ResultExt};
use crate::lock::DatabaseLocker;
use crate::naming;
use crate::placement::{ClaimedDatabase, Placement};
use crate::registry::Registry;
use crate::secrets::{SecretError, SecretStore};
use crate::sql::{ConnectionTarget, ScopedConnection, SqlConnector};

/// External systems the controller talks to, injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn Registry>,
    pub directory: Arc<dyn ResourceDirectory>,
    pub secrets: Arc<dyn SecretStore>,
    pub connector: Arc<dyn SqlConnector>,
}

pub struct Context {
    pub(crate) registry: Arc<dyn Registry>,
    pub(crate) directory: Arc<dyn ResourceDirectory>,
    pub(crate) secrets: Arc<dyn SecretStore>,
    pub(crate) connector: Arc<dyn SqlConnector>,
    pub(crate) config: Config,
    pub(crate) counters: Arc<CounterTags>,
    pub(crate) placement: Placement,
}

impl Context {
    pub fn new(collaborators: Collaborators, config: Config) -> Arc<Self> {
        let Collaborators {
            registry,
            directory,
            secrets,
            connector,
        } = collaborators;

        let counters = Arc::new(CounterTags::new(
            registry.clone(),
            directory.clone(),
            config.counter_mode,
        ));
        let discovery = Discovery::new(
            registry.clone(),
            directory.clone(),
            counters.clone(),
            config.limits.clone(),
            config.max_installations_per_logical_database,
        );
        let locker = DatabaseLocker::new(
            registry.clone(),
            config.instance_id.clone(),
            config.lock_hold_alert_threshold,
        );
        let placement = Placement::new(
            registry.clone(),
            directory.clone(),
            discovery,
            locker,
            counters.clone(),
        );

        Arc::new(Self {
            registry,
            directory,
            secrets,
            connector,
            config,
            counters,
            placement,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// The VPC an installation runs in, via the single workload cluster hosting it.
    pub(crate) async fn resolve_vpc(&self, installation_id: &str) -> Result<String, PlacementError> {
        let cluster_installations = self
            .registry
            .get_cluster_installations(installation_id)
            .await
            .context_for(|| {
                format!("failed to get cluster installations of installation {installation_id}")
            })?;
        let cluster_installation = match cluster_installations.as_slice() {
            [one] => one,
            other => {
                return Err(PlacementError::InvalidInstallation(format!(
                    "installation {installation_id} must run on exactly one cluster, found {}",
                    other.len()
                )));
            }
        };
        find_vpc_for_cluster(&*self.directory, &cluster_installation.cluster_id)
            .await
            .context_for(|| {
                format!(
                    "failed to find the vpc of cluster {}",
                    cluster_installation.cluster_id
                )
            })
    }

    /// Open a connection to the cluster's writer with its master credentials. `database`
    /// of `None` connects to the engine's default database.
    pub(crate) async fn master_connection(
        &self,
        claimed: &ClaimedDatabase,
        database: Option<&str>,
    ) -> Result<ScopedConnection, PlacementError> {
        let cluster_id = &claimed.database.rds_cluster_id;
        let secret_name = naming::master_secret_name(cluster_id);
        let master = self
            .secrets
            .get_secret(&secret_name)
            .await
            .and_then(|secret| secret.ok_or_else(|| SecretError::NotFound(secret_name.clone())))
            .context_for(|| format!("failed to get master credentials of cluster {cluster_id}"))?;

        let engine = claimed.database.database_type.engine();
        let target = ConnectionTarget {
            engine,
            host: claimed.cluster.writer_endpoint.clone(),
            port: engine.default_port(),
            database: database.map(str::to_string),
            username: master.master_username,
            password: master.master_password,
        };
        ScopedConnection::open(&self.connector, &target, self.config.sql_query_timeout)
            .await
            .context_for(|| format!("failed to connect to cluster {cluster_id}"))
    }

    /// Persist the cluster's current endpoints if the registry has stale ones.
    pub(crate) async fn refresh_endpoints(
        &self,
        database: &mut MultitenantDatabase,
        cluster: &ClusterDescription,
    ) -> Result<bool, PlacementError> {
        if database.writer_endpoint == cluster.writer_endpoint
            && database.reader_endpoint == cluster.reader_endpoint
        {
            return Ok(false);
        }
        let mut updated = database.clone();
        updated.writer_endpoint = cluster.writer_endpoint.clone();
        updated.reader_endpoint = cluster.reader_endpoint.clone();
        self.registry
            .update_multitenant_database(&updated)
            .await
            .context_for(|| format!("failed to update endpoints of multitenant database {}", database.id))?;
        tracing::info!(
            "endpoints of multitenant database {} are now {} / {}",
            database.id,
            updated.writer_endpoint,
            updated.reader_endpoint
        );
        *database = updated;
        Ok(true)
    }

    /// Add the installation to the cluster's active membership and rewrite the counter.
    /// The counter is rewritten even if the installation was already a member, so an
    /// interrupted earlier run converges.
    ///
    /// Locks are per cluster, so two placements of one installation can each add it to a
    /// different cluster. After the add, every other record is checked; if one already
    /// lists the installation this add is undone before the counter is touched. Both
    /// sides may undo, never both keep.
    pub(crate) async fn add_membership(
        &self,
        claimed: &mut ClaimedDatabase,
        installation_id: &str,
    ) -> Result<(), PlacementError> {
        let database_id = claimed.database.id.clone();
        if !claimed.database.installations.contains(installation_id) {
            claimed.database.installations = self
                .registry
                .add_installation_id(&database_id, installation_id)
                .await
                .context_for(|| {
                    format!("failed to add installation {installation_id} to multitenant database {database_id}")
                })?;

            if let Some(other) = self.other_assignment(&database_id, installation_id).await? {
                tracing::warn!(
                    "installation {installation_id} was assigned to multitenant database {other} concurrently, removing it from {database_id}"
                );
                claimed.database.installations = self
                    .registry
                    .remove_installation_id(&database_id, installation_id)
                    .await
                    .context_for(|| {
                        format!("failed to remove installation {installation_id} from multitenant database {database_id}")
                    })?;
                return Err(PlacementError::ConcurrentAssignment {
                    installation_id: installation_id.to_string(),
                    database_id: other,
                });
            }
        }
        self.counters
            .update_counter_tag_with_current_weight(
                &claimed.cluster.arn,
                &claimed.database.installations,
            )
            .await
    }

    /// A record other than `database_id` that lists the installation as active.
    async fn other_assignment(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<Option<String>, PlacementError> {
        let holders = self
            .registry
            .get_multitenant_databases(&MultitenantDatabaseFilter::for_installation(installation_id))
            .await
            .context_for(|| {
                format!("failed to look up multitenant databases of installation {installation_id}")
            })?;
        Ok(holders
            .into_iter()
            .map(|database| database.id)
            .find(|id| id != database_id))
    }

    /// Remove the installation from the cluster's active membership. The counter is
    /// written first and rolled back if the registry write fails.
    pub(crate) async fn remove_membership(
        &self,
        claimed: &mut ClaimedDatabase,
        installation_id: &str,
    ) -> Result<(), PlacementError> {
        let previous = claimed.database.installations.clone();
        let next = previous.without(installation_id);
        let database_id = claimed.database.id.as_str();
        let registry = &self.registry;
        let updated: InstallationIds = self
            .counters
            .with_counter_rollback(&claimed.cluster.arn, &previous, &next, || async move {
                registry
                    .remove_installation_id(database_id, installation_id)
                    .await
                    .context_for(|| {
                        format!("failed to remove installation {installation_id} from multitenant database {database_id}")
                    })
            })
            .await?;
        claimed.database.installations = updated;
        Ok(())
    }

    /// Tags attached to every installation secret.
    pub(crate) fn secret_tags(installation_id: &str, database_id: &str) -> Vec<(String, String)> {
        vec![
            (
                tags::INSTALLATION_ID_TAG_KEY.to_string(),
                installation_id.to_string(),
            ),
            (
                tags::MULTITENANT_DATABASE_ID_TAG_KEY.to_string(),
                database_id.to_string(),
            ),
        ]
    }
}

/// Fail with [`PlacementError::Unsupported`] unless `actual` is the variant's own type.
pub(crate) fn ensure_type(
    operation: &str,
    expected: DatabaseType,
    actual: DatabaseType,
) -> Result<(), PlacementError> {
    if expected != actual {
        return Err(PlacementError::Unsupported(format!(
            "{operation} of a {actual} database cannot be handled by the {expected} implementation"
        )));
    }
    Ok(())
}
