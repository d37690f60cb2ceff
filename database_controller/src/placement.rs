//! Claiming a shared cluster: discovery, locking, and re-validation after the lock is held.

use std::sync::Arc;

use database_api::models::{DatabaseType, MultitenantDatabase};

use crate::capacity::CounterTags;
use crate::cloud::{ClusterDescription, ResourceDirectory};
use crate::discovery::{Candidates, Discovery};
use crate::error::{PlacementError, ResultExt};
use crate::lock::{DatabaseLocker, LockedDatabase};
use crate::registry::Registry;

/// A cluster whose registry record is locked by this controller, together with the
/// record and the cluster's live description as read after the lock was taken.
pub struct ClaimedDatabase {
    pub database: MultitenantDatabase,
    pub cluster: ClusterDescription,
    pub lock: LockedDatabase,
}

impl ClaimedDatabase {
    pub async fn release(self) {
        self.lock.release().await;
    }
}

pub struct Placement {
    registry: Arc<dyn Registry>,
    directory: Arc<dyn ResourceDirectory>,
    discovery: Discovery,
    locker: DatabaseLocker,
    counters: Arc<CounterTags>,
}

impl Placement {
    pub fn new(
        registry: Arc<dyn Registry>,
        directory: Arc<dyn ResourceDirectory>,
        discovery: Discovery,
        locker: DatabaseLocker,
        counters: Arc<CounterTags>,
    ) -> Self {
        Self {
            registry,
            directory,
            discovery,
            locker,
            counters,
        }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn locker(&self) -> &DatabaseLocker {
        &self.locker
    }

    /// Lock the cluster the installation is assigned to, or return `None` if it has none.
    /// Contention fails outward: there is no other candidate to try.
    pub async fn get_and_lock_assigned(
        &self,
        installation_id: &str,
    ) -> Result<Option<ClaimedDatabase>, PlacementError> {
        let Some(assigned) = self.discovery.find_assigned(installation_id).await? else {
            return Ok(None);
        };
        self.claim(&assigned.id, |database| {
            if database.installations.contains(installation_id) {
                Ok(())
            } else {
                Err(format!(
                    "installation {installation_id} was removed before the lock was acquired"
                ))
            }
        })
        .await
        .map(Some)
    }

    /// Lock a cluster by registry ID, without membership expectations. Used by migrations,
    /// which name their clusters explicitly.
    pub async fn claim_by_id(&self, database_id: &str) -> Result<ClaimedDatabase, PlacementError> {
        self.claim(database_id, |_| Ok(())).await
    }

    /// Lock several clusters in the given order and validate each. On any failure every
    /// lock taken so far is released.
    pub async fn claim_all(
        &self,
        database_ids: &[&str],
    ) -> Result<Vec<ClaimedDatabase>, PlacementError> {
        let locks = self.locker.lock_all(database_ids).await?;
        let mut claimed = Vec::with_capacity(locks.len());
        let mut failure = None;
        for lock in locks {
            if failure.is_some() {
                lock.release().await;
                continue;
            }
            let database_id = lock.database_id().to_string();
            match self.validate_locked(&database_id, |_| Ok(())).await {
                Ok((database, cluster)) => claimed.push(ClaimedDatabase {
                    database,
                    cluster,
                    lock,
                }),
                Err(e) => {
                    lock.release().await;
                    failure = Some(e);
                }
            }
        }
        match failure {
            None => Ok(claimed),
            Some(e) => {
                for database in claimed {
                    database.release().await;
                }
                Err(e)
            }
        }
    }

    /// Find a cluster for the installation and lock it. If the installation is already
    /// assigned, that cluster is locked. Otherwise candidates are tried fullest first;
    /// contended or stale candidates are skipped.
    #[tracing::instrument(skip_all, fields(%installation_id, %database_type))]
    pub async fn select_and_lock(
        &self,
        installation_id: &str,
        vpc_id: &str,
        database_type: DatabaseType,
    ) -> Result<ClaimedDatabase, PlacementError> {
        let candidates = match self
            .discovery
            .find_candidates(installation_id, vpc_id, database_type)
            .await?
        {
            Candidates::Assigned(assigned) => {
                tracing::info!(
                    "installation {installation_id} is already assigned to multitenant database {}",
                    assigned.id
                );
                return self
                    .get_and_lock_assigned(installation_id)
                    .await?
                    .ok_or_else(|| {
                        PlacementError::NotAssigned(format!(
                            "installation {installation_id} was unassigned during placement"
                        ))
                    });
            }
            Candidates::Available(candidates) => candidates,
        };

        let limit = self.discovery.limit_for(database_type) as i64;
        for candidate in candidates {
            match self.claim_candidate(&candidate, limit).await {
                Ok(claimed) => {
                    let claimed = self.recheck_unassigned(claimed, installation_id).await?;
                    tracing::info!(
                        "selected multitenant database {} ({}) for installation {installation_id}",
                        claimed.database.id,
                        claimed.database.rds_cluster_id
                    );
                    return Ok(claimed);
                }
                Err(e) if e.is_candidate_skippable() => {
                    tracing::info!("skipping multitenant database {}: {e}", candidate.id);
                }
                Err(e) => return Err(e),
            }
        }

        Err(PlacementError::CapacityExhausted {
            installation_id: installation_id.to_string(),
            database_type,
            vpc_id: vpc_id.to_string(),
        })
    }

    /// Discovery ran before the lock, so another placement of the same installation may
    /// have assigned it elsewhere in between. Give the candidate back if so.
    async fn recheck_unassigned(
        &self,
        claimed: ClaimedDatabase,
        installation_id: &str,
    ) -> Result<ClaimedDatabase, PlacementError> {
        match self.discovery.find_assigned(installation_id).await {
            Ok(Some(assigned)) if assigned.id != claimed.database.id => {
                claimed.release().await;
                Err(PlacementError::ConcurrentAssignment {
                    installation_id: installation_id.to_string(),
                    database_id: assigned.id,
                })
            }
            Ok(_) => Ok(claimed),
            Err(e) => {
                claimed.release().await;
                Err(e)
            }
        }
    }

    /// Lock a discovered candidate and check that nothing changed since it was read.
    async fn claim_candidate(
        &self,
        candidate: &MultitenantDatabase,
        limit: i64,
    ) -> Result<ClaimedDatabase, PlacementError> {
        let claimed = self
            .claim(&candidate.id, |database| {
                if database.installations != candidate.installations {
                    return Err(format!(
                        "membership changed from {} to {} installations before the lock was acquired",
                        candidate.installations.len(),
                        database.installations.len()
                    ));
                }
                Ok(())
            })
            .await?;

        let usage = match self
            .counters
            .counter_value(&claimed.database.installations)
            .await
        {
            Ok(usage) => usage,
            Err(e) => {
                claimed.release().await;
                return Err(e);
            }
        };
        if usage >= limit {
            let id = claimed.database.id.clone();
            claimed.release().await;
            return Err(PlacementError::validation(
                &id,
                format!("usage {usage} has reached the limit of {limit}"),
            ));
        }
        Ok(claimed)
    }

    /// Lock `database_id`, re-read its record, run `verify` on it, and check that the
    /// cluster is available. Any failure after locking releases the lock.
    async fn claim<V>(&self, database_id: &str, verify: V) -> Result<ClaimedDatabase, PlacementError>
    where
        V: FnOnce(&MultitenantDatabase) -> Result<(), String>,
    {
        let lock = self.locker.lock(database_id).await?;
        match self.validate_locked(database_id, verify).await {
            Ok((database, cluster)) => Ok(ClaimedDatabase {
                database,
                cluster,
                lock,
            }),
            Err(e) => {
                lock.release().await;
                Err(e)
            }
        }
    }

    async fn validate_locked<V>(
        &self,
        database_id: &str,
        verify: V,
    ) -> Result<(MultitenantDatabase, ClusterDescription), PlacementError>
    where
        V: FnOnce(&MultitenantDatabase) -> Result<(), String>,
    {
        let database = self
            .registry
            .get_multitenant_database(database_id)
            .await
            .context_for(|| format!("failed to re-read multitenant database {database_id}"))?
            .ok_or_else(|| PlacementError::validation(database_id, "record no longer exists"))?;
        if database.is_deleted() {
            return Err(PlacementError::validation(database_id, "record is deleted"));
        }
        verify(&database).map_err(|reason| PlacementError::validation(database_id, reason))?;

        let cluster = self
            .directory
            .describe_cluster(&database.rds_cluster_id)
            .await
            .context_for(|| format!("failed to describe cluster {}", database.rds_cluster_id))?;
        if !cluster.is_available() {
            return Err(PlacementError::validation(
                database_id,
                format!("cluster {} is {}", cluster.cluster_id, cluster.status),
            ));
        }
        Ok((database, cluster))
    }
}
