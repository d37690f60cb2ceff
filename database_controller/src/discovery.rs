//! Finding a shared cluster for an installation.
//!
//! Three tiers are tried in order, stopping at the first that yields anything:
//! 1. the registry record that already lists the installation (re-entry after a crash),
//! 2. registry records of the right type and VPC with room left,
//! 3. a tag scan for clusters the registry has not seen yet, which are registered on
//!    first sight.

use std::sync::Arc;

use database_api::models::{DatabaseType, MultitenantDatabase, MultitenantDatabaseFilter};
use database_api::tags;

use crate::capacity::{CounterTags, parse_counter};
use crate::cloud::{
    CLUSTER_STATUS_AVAILABLE, ResourceDirectory, TagFilter, TaggedResource, cluster_id_from_arn,
};
use crate::config::{CapacityLimits, CounterMode};
use crate::error::{PlacementError, ResultExt};
use crate::registry::{Registry, RegistryError};

/// Result of discovery for one installation.
#[derive(Debug)]
pub enum Candidates {
    /// The installation is already a member of this cluster.
    Assigned(MultitenantDatabase),
    /// Clusters with room, fullest first.
    Available(Vec<MultitenantDatabase>),
}

pub struct Discovery {
    registry: Arc<dyn Registry>,
    directory: Arc<dyn ResourceDirectory>,
    counters: Arc<CounterTags>,
    limits: CapacityLimits,
    max_installations_per_logical_database: i64,
}

impl Discovery {
    pub fn new(
        registry: Arc<dyn Registry>,
        directory: Arc<dyn ResourceDirectory>,
        counters: Arc<CounterTags>,
        limits: CapacityLimits,
        max_installations_per_logical_database: i64,
    ) -> Self {
        Self {
            registry,
            directory,
            counters,
            limits,
            max_installations_per_logical_database,
        }
    }

    pub fn limit_for(&self, database_type: DatabaseType) -> usize {
        self.limits.for_type(database_type)
    }

    /// The cluster that currently lists the installation as active. Finding more than one
    /// means the at-most-one-assignment invariant is already broken, which is reported
    /// rather than papered over.
    pub async fn find_assigned(
        &self,
        installation_id: &str,
    ) -> Result<Option<MultitenantDatabase>, PlacementError> {
        let mut databases = self
            .registry
            .get_multitenant_databases(&MultitenantDatabaseFilter::for_installation(
                installation_id,
            ))
            .await
            .context_for(|| {
                format!("failed to look up multitenant database of installation {installation_id}")
            })?;
        match databases.len() {
            0 => Ok(None),
            1 => Ok(databases.pop()),
            n => Err(PlacementError::InvalidInstallation(format!(
                "installation {installation_id} is assigned to {n} multitenant databases: {}",
                databases
                    .iter()
                    .map(|db| db.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    #[tracing::instrument(skip_all, fields(%installation_id, %vpc_id, %database_type))]
    pub async fn find_candidates(
        &self,
        installation_id: &str,
        vpc_id: &str,
        database_type: DatabaseType,
    ) -> Result<Candidates, PlacementError> {
        if let Some(assigned) = self.find_assigned(installation_id).await? {
            if assigned.database_type != database_type {
                return Err(PlacementError::InvalidInstallation(format!(
                    "installation {installation_id} is assigned to {} multitenant database {}, not {database_type}",
                    assigned.database_type, assigned.id
                )));
            }
            return Ok(Candidates::Assigned(assigned));
        }

        let limit = self.limit_for(database_type);
        // In weighted mode a cluster can hold more installations than the limit, so the
        // registry cannot filter by count and usage is computed per record instead.
        let count_limit = match self.counters.mode() {
            CounterMode::Count => Some(limit),
            CounterMode::Weighted => None,
        };
        let listed = self
            .registry
            .get_multitenant_databases(&MultitenantDatabaseFilter {
                database_type: Some(database_type),
                vpc_id: Some(vpc_id.to_string()),
                max_installations_limit: count_limit,
                ..Default::default()
            })
            .await
            .context_for(|| {
                format!("failed to list {database_type} multitenant databases in vpc {vpc_id}")
            })?;
        let mut candidates = Vec::with_capacity(listed.len());
        for database in listed {
            if self.has_room(&database, limit as i64).await? {
                candidates.push(database);
            }
        }

        if candidates.is_empty() {
            tracing::info!(
                "no registered {database_type} database with capacity in vpc {vpc_id}, scanning cloud tags"
            );
            candidates = self.discover_from_tags(vpc_id, database_type).await?;
        }

        // Fullest first. The sort is stable, so ties keep discovery order.
        candidates.sort_by(|a, b| b.installations.len().cmp(&a.installations.len()));
        Ok(Candidates::Available(candidates))
    }

    /// Tier 3: clusters tagged for multitenant use in this VPC whose counter is below the
    /// limit and whose endpoints are all available.
    async fn discover_from_tags(
        &self,
        vpc_id: &str,
        database_type: DatabaseType,
    ) -> Result<Vec<MultitenantDatabase>, PlacementError> {
        let filters = [
            TagFilter::equals(tags::PURPOSE_TAG_KEY, tags::PURPOSE_TAG_VALUE),
            TagFilter::equals(tags::OWNER_TAG_KEY, tags::OWNER_TAG_VALUE),
            TagFilter::equals(tags::TERRAFORM_TAG_KEY, tags::TERRAFORM_TAG_VALUE),
            TagFilter::equals(tags::DATABASE_TYPE_TAG_KEY, database_type.as_tag_value()),
            TagFilter::equals(tags::VPC_ID_TAG_KEY, vpc_id),
            TagFilter::present(tags::COUNTER_TAG_KEY),
            TagFilter::present(tags::MULTITENANT_DATABASE_ID_TAG_KEY),
        ];
        let resources = self
            .directory
            .find_resources_by_tags(&filters, &[tags::RDS_CLUSTER_RESOURCE_TYPE])
            .await
            .context_for(|| {
                format!("failed to scan tags for {database_type} clusters in vpc {vpc_id}")
            })?;

        let limit = self.limit_for(database_type) as i64;
        let mut candidates = Vec::new();
        for resource in resources {
            if !resource.arn.contains(tags::MULTITENANT_CLUSTER_ARN_MARKER) {
                continue;
            }
            let Some(counter) = resource.tag(tags::COUNTER_TAG_KEY).and_then(parse_counter) else {
                tracing::warn!("cluster {} has a malformed counter tag, skipping", resource.arn);
                continue;
            };
            if counter >= limit {
                continue;
            }
            if let Some(database) = self
                .register_discovered(&resource, vpc_id, database_type, limit)
                .await?
            {
                candidates.push(database);
            }
        }
        Ok(candidates)
    }

    /// Create or fetch the registry record of a tag-discovered cluster. Returns `None` if
    /// the cluster turns out not to be eligible.
    async fn register_discovered(
        &self,
        resource: &TaggedResource,
        vpc_id: &str,
        database_type: DatabaseType,
        limit: i64,
    ) -> Result<Option<MultitenantDatabase>, PlacementError> {
        let Some(database_id) = resource.tag(tags::MULTITENANT_DATABASE_ID_TAG_KEY) else {
            return Ok(None);
        };
        let rds_cluster_id = cluster_id_from_arn(&resource.arn)
            .context_for(|| format!("discovered cluster {database_id}"))?;

        let endpoints = self
            .directory
            .describe_cluster_endpoints(rds_cluster_id)
            .await
            .context_for(|| format!("failed to describe endpoints of cluster {rds_cluster_id}"))?;
        if endpoints.is_empty() || endpoints.iter().any(|e| e.status != CLUSTER_STATUS_AVAILABLE) {
            tracing::info!("cluster {rds_cluster_id} has endpoints that are not available, skipping");
            return Ok(None);
        }

        let existing = self
            .registry
            .get_multitenant_database(database_id)
            .await
            .context_for(|| format!("failed to get multitenant database {database_id}"))?;
        let database = match existing {
            Some(database) => database,
            None => {
                let mut database = MultitenantDatabase::new(
                    database_id.to_string(),
                    rds_cluster_id.to_string(),
                    vpc_id.to_string(),
                    database_type,
                    self.max_installations_per_logical_database,
                );
                match self.registry.create_multitenant_database(&mut database).await {
                    Ok(()) => {
                        tracing::info!(
                            "registered discovered {database_type} cluster {rds_cluster_id} as multitenant database {database_id}"
                        );
                        database
                    }
                    // Another controller registered it first.
                    Err(RegistryError::AlreadyExists { .. }) => {
                        match self.registry.get_multitenant_database(database_id).await {
                            Ok(Some(database)) => database,
                            Ok(None) => return Ok(None),
                            Err(e) => {
                                return Err(e).context_for(|| {
                                    format!("failed to get multitenant database {database_id}")
                                });
                            }
                        }
                    }
                    Err(e) => {
                        return Err(e).context_for(|| {
                            format!("failed to register multitenant database {database_id}")
                        });
                    }
                }
            }
        };

        if database.is_deleted()
            || database.database_type != database_type
            || database.vpc_id != vpc_id
            || !self.has_room(&database, limit).await?
        {
            return Ok(None);
        }
        Ok(Some(database))
    }

    /// Usage below the limit, measured the way the counter tag is.
    async fn has_room(&self, database: &MultitenantDatabase, limit: i64) -> Result<bool, PlacementError> {
        Ok(self.counters.counter_value(&database.installations).await? < limit)
    }
}
