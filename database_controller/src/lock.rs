use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{PlacementError, ResultExt};
use crate::metrics::{LOCK_ACQUISITIONS, LOCK_RELEASE_FAILURES};
use crate::registry::Registry;

/// Takes advisory locks on registry records on behalf of one controller instance.
#[derive(Clone)]
pub struct DatabaseLocker {
    registry: Arc<dyn Registry>,
    holder: String,
    alert_threshold: Duration,
}

impl DatabaseLocker {
    pub fn new(registry: Arc<dyn Registry>, holder: String, alert_threshold: Duration) -> Self {
        Self {
            registry,
            holder,
            alert_threshold,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Fails with [`PlacementError::LockContention`] if any holder, this one included,
    /// already has the record locked.
    pub async fn lock(&self, database_id: &str) -> Result<LockedDatabase, PlacementError> {
        match self
            .registry
            .lock_multitenant_database(database_id, &self.holder)
            .await
        {
            Ok(true) => {
                LOCK_ACQUISITIONS.with_label_values(&["acquired"]).inc();
                tracing::debug!("locked multitenant database {database_id}");
                Ok(LockedDatabase {
                    registry: self.registry.clone(),
                    database_id: database_id.to_string(),
                    holder: self.holder.clone(),
                    acquired_at: Instant::now(),
                    alert_threshold: self.alert_threshold,
                    released: false,
                })
            }
            Ok(false) => {
                LOCK_ACQUISITIONS.with_label_values(&["contended"]).inc();
                Err(PlacementError::LockContention(database_id.to_string()))
            }
            Err(e) => {
                LOCK_ACQUISITIONS.with_label_values(&["error"]).inc();
                Err(e).context_for(|| format!("failed to lock multitenant database {database_id}"))
            }
        }
    }

    /// Lock several records in the given order. Callers must pass IDs in the same order
    /// every time to avoid deadlocking against each other. If any lock fails, the ones
    /// already taken are released before returning.
    pub async fn lock_all(&self, database_ids: &[&str]) -> Result<Vec<LockedDatabase>, PlacementError> {
        let mut locks = Vec::with_capacity(database_ids.len());
        for database_id in database_ids {
            match self.lock(database_id).await {
                Ok(lock) => locks.push(lock),
                Err(e) => {
                    while let Some(lock) = locks.pop() {
                        lock.release().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(locks)
    }
}

/// An advisory lock on one registry record.
///
/// Release it explicitly with [`LockedDatabase::release`]. If the guard is dropped
/// instead (early return with `?`, cancelled future), the unlock is spawned onto the
/// current runtime. Release failures are logged and counted, never returned: the lock
/// also expires on the registry side.
pub struct LockedDatabase {
    registry: Arc<dyn Registry>,
    database_id: String,
    holder: String,
    acquired_at: Instant,
    alert_threshold: Duration,
    released: bool,
}

impl LockedDatabase {
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub async fn release(mut self) {
        self.released = true;
        self.report_hold_time();
        unlock(&*self.registry, &self.database_id, &self.holder).await;
    }

    fn report_hold_time(&self) {
        let held = self.acquired_at.elapsed();
        if held > self.alert_threshold {
            tracing::warn!(
                "Lock on multitenant database {} was held for {:?}",
                self.database_id,
                held
            );
        }
    }
}

async fn unlock(registry: &dyn Registry, database_id: &str, holder: &str) {
    match registry
        .unlock_multitenant_database(database_id, holder, false)
        .await
    {
        Ok(true) => tracing::debug!("unlocked multitenant database {database_id}"),
        Ok(false) => {
            LOCK_RELEASE_FAILURES.inc();
            tracing::warn!(
                "multitenant database {database_id} was not locked by {holder} at release time"
            );
        }
        Err(e) => {
            LOCK_RELEASE_FAILURES.inc();
            tracing::warn!("failed to unlock multitenant database {database_id}: {e}");
        }
    }
}

impl Drop for LockedDatabase {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.report_hold_time();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                let database_id = std::mem::take(&mut self.database_id);
                let holder = std::mem::take(&mut self.holder);
                handle.spawn(async move {
                    unlock(&*registry, &database_id, &holder).await;
                });
            }
            Err(_) => {
                LOCK_RELEASE_FAILURES.inc();
                tracing::warn!(
                    "lock on multitenant database {} dropped outside a runtime, leaving it to expire",
                    self.database_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use database_api::models::{DatabaseType, MultitenantDatabase};

    use super::*;
    use crate::registry::{MemoryRegistry, Registry, RegistryOperation};

    async fn registry_with(ids: &[&str]) -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new());
        for id in ids {
            let mut db = MultitenantDatabase::new(
                id.to_string(),
                format!("rds-cluster-multitenant-{id}"),
                "vpc-1".to_string(),
                DatabaseType::MysqlAurora,
                0,
            );
            registry.create_multitenant_database(&mut db).await.unwrap();
        }
        registry
    }

    fn locker(registry: &Arc<MemoryRegistry>, holder: &str) -> DatabaseLocker {
        DatabaseLocker::new(registry.clone(), holder.to_string(), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn second_holder_sees_contention_until_release() {
        let registry = registry_with(&["db1"]).await;
        let a = locker(&registry, "a");
        let b = locker(&registry, "b");

        let lock = a.lock("db1").await.unwrap();
        let Err(err) = b.lock("db1").await else {
            panic!("second holder acquired a held lock");
        };
        assert!(matches!(err, PlacementError::LockContention(_)));

        lock.release().await;
        b.lock("db1").await.unwrap().release().await;
        assert!(!registry.peek_multitenant_database("db1").unwrap().is_locked());
    }

    #[tokio::test]
    async fn dropped_guard_unlocks_in_background() {
        let registry = registry_with(&["db1"]).await;
        let a = locker(&registry, "a");
        {
            let _lock = a.lock("db1").await.unwrap();
        }
        // Let the spawned unlock run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!registry.peek_multitenant_database("db1").unwrap().is_locked());
    }

    #[tokio::test]
    async fn lock_all_releases_partial_acquisitions() {
        let registry = registry_with(&["db1", "db2"]).await;
        let held = locker(&registry, "other").lock("db2").await.unwrap();

        let Err(err) = locker(&registry, "a").lock_all(&["db1", "db2"]).await else {
            panic!("lock_all succeeded while db2 was held");
        };
        assert!(err.is_candidate_skippable());
        assert!(!registry.peek_multitenant_database("db1").unwrap().is_locked());
        held.release().await;
    }

    #[tokio::test]
    async fn release_failure_is_not_fatal() {
        let registry = registry_with(&["db1"]).await;
        let lock = locker(&registry, "a").lock("db1").await.unwrap();
        registry.fail_next(RegistryOperation::UnlockMultitenantDatabase, 1);
        lock.release().await;
        assert!(registry.peek_multitenant_database("db1").unwrap().is_locked());
    }
}
