use std::collections::HashMap;

use async_trait::async_trait;
use database_api::models::{
    ClusterInstallation, DatabaseSchema, DatabaseSchemaFilter, InstallationIds, LogicalDatabase,
    LogicalDatabaseFilter, MultitenantDatabase, MultitenantDatabaseFilter,
    database_weight_for_state,
};
use parking_lot::Mutex;

use super::{
    DATABASE_SCHEMA, LOGICAL_DATABASE, MULTITENANT_DATABASE, Registry, RegistryError,
    RegistryOperation, now_millis,
};

#[derive(Default)]
struct State {
    /// Kept in creation order, which is the order callers observe.
    multitenant_databases: Vec<MultitenantDatabase>,
    logical_databases: Vec<LogicalDatabase>,
    database_schemas: Vec<DatabaseSchema>,
    cluster_installations: Vec<ClusterInstallation>,
    installation_states: HashMap<String, String>,
    mutations: usize,
    injected_failures: HashMap<RegistryOperation, usize>,
}

impl State {
    fn check(&mut self, operation: RegistryOperation) -> Result<(), RegistryError> {
        if let Some(remaining) = self.injected_failures.get_mut(&operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RegistryError::Query {
                    operation,
                    message: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }

    fn mutate(&mut self, operation: RegistryOperation) -> Result<(), RegistryError> {
        self.check(operation)?;
        self.mutations += 1;
        Ok(())
    }

    fn multitenant_database_mut(
        &mut self,
        id: &str,
    ) -> Result<&mut MultitenantDatabase, RegistryError> {
        self.multitenant_databases
            .iter_mut()
            .find(|db| db.id == id)
            .ok_or_else(|| RegistryError::NotFound {
                kind: MULTITENANT_DATABASE,
                id: id.to_string(),
            })
    }
}

/// A complete in-process [`Registry`]. Suitable for tests and for a single controller
/// process: locks are only visible within this process.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls served so far, successful or not.
    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }

    /// Make the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: RegistryOperation, times: usize) {
        self.state
            .lock()
            .injected_failures
            .insert(operation, times);
    }

    pub fn add_cluster_installation(&self, cluster_installation: ClusterInstallation) {
        self.state
            .lock()
            .cluster_installations
            .push(cluster_installation);
    }

    pub fn set_installation_state(&self, installation_id: &str, state: &str) {
        self.state
            .lock()
            .installation_states
            .insert(installation_id.to_string(), state.to_string());
    }

    /// Current record, bypassing failure injection and counters.
    pub fn peek_multitenant_database(&self, id: &str) -> Option<MultitenantDatabase> {
        self.state
            .lock()
            .multitenant_databases
            .iter()
            .find(|db| db.id == id)
            .cloned()
    }

    pub fn peek_multitenant_databases(&self) -> Vec<MultitenantDatabase> {
        self.state.lock().multitenant_databases.clone()
    }

    fn modify_membership<F>(
        &self,
        operation: RegistryOperation,
        database_id: &str,
        f: F,
    ) -> Result<InstallationIds, RegistryError>
    where
        F: FnOnce(&mut MultitenantDatabase) -> InstallationIds,
    {
        let mut state = self.state.lock();
        state.mutate(operation)?;
        let database = state.multitenant_database_mut(database_id)?;
        Ok(f(database))
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_multitenant_database(
        &self,
        id: &str,
    ) -> Result<Option<MultitenantDatabase>, RegistryError> {
        let mut state = self.state.lock();
        state.check(RegistryOperation::GetMultitenantDatabase)?;
        Ok(state
            .multitenant_databases
            .iter()
            .find(|db| db.id == id)
            .cloned())
    }

    async fn get_multitenant_databases(
        &self,
        filter: &MultitenantDatabaseFilter,
    ) -> Result<Vec<MultitenantDatabase>, RegistryError> {
        let mut state = self.state.lock();
        state.check(RegistryOperation::GetMultitenantDatabases)?;
        Ok(state
            .multitenant_databases
            .iter()
            .filter(|db| filter.matches(db))
            .cloned()
            .collect())
    }

    async fn create_multitenant_database(
        &self,
        database: &mut MultitenantDatabase,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.mutate(RegistryOperation::CreateMultitenantDatabase)?;
        if state
            .multitenant_databases
            .iter()
            .any(|db| db.id == database.id)
        {
            return Err(RegistryError::AlreadyExists {
                kind: MULTITENANT_DATABASE,
                id: database.id.clone(),
            });
        }
        database.create_at = now_millis();
        database.lock_acquired_by = None;
        database.lock_acquired_at = 0;
        state.multitenant_databases.push(database.clone());
        Ok(())
    }

    async fn update_multitenant_database(
        &self,
        database: &MultitenantDatabase,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.mutate(RegistryOperation::UpdateMultitenantDatabase)?;
        let existing = state.multitenant_database_mut(&database.id)?;
        let lock_acquired_by = existing.lock_acquired_by.take();
        let lock_acquired_at = existing.lock_acquired_at;
        *existing = MultitenantDatabase {
            lock_acquired_by,
            lock_acquired_at,
            ..database.clone()
        };
        Ok(())
    }

    async fn lock_multitenant_database(
        &self,
        id: &str,
        holder: &str,
    ) -> Result<bool, RegistryError> {
        let mut state = self.state.lock();
        state.mutate(RegistryOperation::LockMultitenantDatabase)?;
        let database = state.multitenant_database_mut(id)?;
        if database.is_locked() {
            return Ok(false);
        }
        database.lock_acquired_by = Some(holder.to_string());
        database.lock_acquired_at = now_millis().max(1);
        Ok(true)
    }

    async fn unlock_multitenant_database(
        &self,
        id: &str,
        holder: &str,
        force: bool,
    ) -> Result<bool, RegistryError> {
        let mut state = self.state.lock();
        state.mutate(RegistryOperation::UnlockMultitenantDatabase)?;
        let database = state.multitenant_database_mut(id)?;
        if !database.is_locked() {
            return Ok(false);
        }
        if !force && database.lock_acquired_by.as_deref() != Some(holder) {
            return Ok(false);
        }
        database.lock_acquired_by = None;
        database.lock_acquired_at = 0;
        Ok(true)
    }

    async fn add_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError> {
        self.modify_membership(RegistryOperation::AddInstallationId, database_id, |db| {
            db.installations.add(installation_id);
            db.installations.clone()
        })
    }

    async fn remove_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError> {
        self.modify_membership(RegistryOperation::RemoveInstallationId, database_id, |db| {
            db.installations.remove(installation_id);
            db.installations.clone()
        })
    }

    async fn remove_migrated_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError> {
        self.modify_membership(
            RegistryOperation::RemoveMigratedInstallationId,
            database_id,
            |db| {
                db.migrated_installations.remove(installation_id);
                db.migrated_installations.clone()
            },
        )
    }

    async fn get_logical_databases(
        &self,
        filter: &LogicalDatabaseFilter,
    ) -> Result<Vec<LogicalDatabase>, RegistryError> {
        let mut state = self.state.lock();
        state.check(RegistryOperation::GetLogicalDatabases)?;
        Ok(state
            .logical_databases
            .iter()
            .filter(|ld| filter.matches(ld))
            .cloned()
            .collect())
    }

    async fn get_logical_database(
        &self,
        id: &str,
    ) -> Result<Option<LogicalDatabase>, RegistryError> {
        let mut state = self.state.lock();
        state.check(RegistryOperation::GetLogicalDatabase)?;
        Ok(state
            .logical_databases
            .iter()
            .find(|ld| ld.id == id)
            .cloned())
    }

    async fn create_logical_database(
        &self,
        logical_database: &mut LogicalDatabase,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.mutate(RegistryOperation::CreateLogicalDatabase)?;
        if state
            .logical_databases
            .iter()
            .any(|ld| ld.id == logical_database.id)
        {
            return Err(RegistryError::AlreadyExists {
                kind: LOGICAL_DATABASE,
                id: logical_database.id.clone(),
            });
        }
        logical_database.create_at = now_millis();
        state.logical_databases.push(logical_database.clone());
        Ok(())
    }

    async fn get_database_schemas(
        &self,
        filter: &DatabaseSchemaFilter,
    ) -> Result<Vec<DatabaseSchema>, RegistryError> {
        let mut state = self.state.lock();
        state.check(RegistryOperation::GetDatabaseSchemas)?;
        Ok(state
            .database_schemas
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn create_database_schema(
        &self,
        schema: &mut DatabaseSchema,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.mutate(RegistryOperation::CreateDatabaseSchema)?;
        if state.database_schemas.iter().any(|s| s.id == schema.id) {
            return Err(RegistryError::AlreadyExists {
                kind: DATABASE_SCHEMA,
                id: schema.id.clone(),
            });
        }
        schema.create_at = now_millis();
        state.database_schemas.push(schema.clone());
        Ok(())
    }

    async fn delete_database_schema(&self, id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.mutate(RegistryOperation::DeleteDatabaseSchema)?;
        let schema = state
            .database_schemas
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| RegistryError::NotFound {
                kind: DATABASE_SCHEMA,
                id: id.to_string(),
            })?;
        if schema.delete_at == 0 {
            schema.delete_at = now_millis().max(1);
        }
        Ok(())
    }

    async fn get_cluster_installations(
        &self,
        installation_id: &str,
    ) -> Result<Vec<ClusterInstallation>, RegistryError> {
        let mut state = self.state.lock();
        state.check(RegistryOperation::GetClusterInstallations)?;
        Ok(state
            .cluster_installations
            .iter()
            .filter(|ci| ci.installation_id == installation_id)
            .cloned()
            .collect())
    }

    async fn get_installations_total_database_weight(
        &self,
        installation_ids: &[String],
    ) -> Result<f64, RegistryError> {
        let mut state = self.state.lock();
        state.check(RegistryOperation::GetInstallationsTotalDatabaseWeight)?;
        Ok(installation_ids
            .iter()
            .map(|id| match state.installation_states.get(id) {
                Some(s) => database_weight_for_state(s),
                None => database_weight_for_state(""),
            })
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use database_api::models::DatabaseType;

    use super::*;

    fn database(id: &str) -> MultitenantDatabase {
        MultitenantDatabase::new(
            id.to_string(),
            format!("rds-cluster-multitenant-{id}"),
            "vpc-1".to_string(),
            DatabaseType::PostgresAurora,
            0,
        )
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_not_reentrant() {
        let registry = MemoryRegistry::new();
        registry
            .create_multitenant_database(&mut database("db1"))
            .await
            .unwrap();

        assert!(registry.lock_multitenant_database("db1", "a").await.unwrap());
        assert!(!registry.lock_multitenant_database("db1", "a").await.unwrap());
        assert!(!registry.lock_multitenant_database("db1", "b").await.unwrap());

        assert!(!registry.unlock_multitenant_database("db1", "b", false).await.unwrap());
        assert!(registry.unlock_multitenant_database("db1", "a", false).await.unwrap());
        assert!(!registry.unlock_multitenant_database("db1", "a", false).await.unwrap());

        assert!(registry.lock_multitenant_database("db1", "b").await.unwrap());
        assert!(registry.unlock_multitenant_database("db1", "a", true).await.unwrap());
    }

    #[tokio::test]
    async fn update_preserves_lock_columns() {
        let registry = MemoryRegistry::new();
        let mut db = database("db1");
        registry.create_multitenant_database(&mut db).await.unwrap();
        assert!(registry.lock_multitenant_database("db1", "a").await.unwrap());

        db.writer_endpoint = "writer".to_string();
        registry.update_multitenant_database(&db).await.unwrap();

        let stored = registry.peek_multitenant_database("db1").unwrap();
        assert_eq!(stored.writer_endpoint, "writer");
        assert_eq!(stored.lock_acquired_by.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn membership_changes_return_updated_set() {
        let registry = MemoryRegistry::new();
        registry
            .create_multitenant_database(&mut database("db1"))
            .await
            .unwrap();
        registry.add_installation_id("db1", "a").await.unwrap();
        let ids = registry.add_installation_id("db1", "b").await.unwrap();
        assert_eq!(ids.as_slice(), &["a", "b"]);
        let ids = registry.remove_installation_id("db1", "a").await.unwrap();
        assert_eq!(ids.as_slice(), &["b"]);
        assert!(registry.add_installation_id("nope", "a").await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let registry = MemoryRegistry::new();
        registry.fail_next(RegistryOperation::GetMultitenantDatabases, 1);
        let filter = MultitenantDatabaseFilter::default();
        assert!(registry.get_multitenant_databases(&filter).await.is_err());
        assert!(registry.get_multitenant_databases(&filter).await.is_ok());
    }

    #[tokio::test]
    async fn weights_follow_installation_state() {
        let registry = MemoryRegistry::new();
        registry.set_installation_state("a", "hibernating");
        registry.set_installation_state("b", "stable");
        let weight = registry
            .get_installations_total_database_weight(&[
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(weight, 2.75);
    }
}
