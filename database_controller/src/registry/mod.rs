//! The registry is the source of truth for which installations live on which shared
//! cluster. It also carries the advisory lock that serializes mutations per cluster.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use database_api::models::{
    ClusterInstallation, DatabaseSchema, DatabaseSchemaFilter, InstallationIds, LogicalDatabase,
    LogicalDatabaseFilter, MultitenantDatabase, MultitenantDatabaseFilter,
};

pub use memory::MemoryRegistry;
pub use postgres::PostgresRegistry;

/// Labels registry calls in metrics and errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum RegistryOperation {
    GetMultitenantDatabase,
    GetMultitenantDatabases,
    CreateMultitenantDatabase,
    UpdateMultitenantDatabase,
    LockMultitenantDatabase,
    UnlockMultitenantDatabase,
    AddInstallationId,
    RemoveInstallationId,
    RemoveMigratedInstallationId,
    GetLogicalDatabases,
    GetLogicalDatabase,
    CreateLogicalDatabase,
    GetDatabaseSchemas,
    CreateDatabaseSchema,
    DeleteDatabaseSchema,
    GetClusterInstallations,
    GetInstallationsTotalDatabaseWeight,
    Migrate,
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("registry connection error: {0}")]
    Connection(String),
    #[error("registry {operation} failed: {message}")]
    Query {
        operation: RegistryOperation,
        message: String,
    },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },
    #[error("corrupt registry record: {0}")]
    Decode(String),
}

pub(crate) const MULTITENANT_DATABASE: &str = "multitenant database";
pub(crate) const LOGICAL_DATABASE: &str = "logical database";
pub(crate) const DATABASE_SCHEMA: &str = "database schema";

/// Milliseconds since the epoch, the timestamp format of every registry record.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
pub trait Registry: Send + Sync {
    async fn get_multitenant_database(
        &self,
        id: &str,
    ) -> Result<Option<MultitenantDatabase>, RegistryError>;

    async fn get_multitenant_databases(
        &self,
        filter: &MultitenantDatabaseFilter,
    ) -> Result<Vec<MultitenantDatabase>, RegistryError>;

    /// Persists a new record and sets its creation time. Fails if the ID is taken.
    async fn create_multitenant_database(
        &self,
        database: &mut MultitenantDatabase,
    ) -> Result<(), RegistryError>;

    /// Overwrites everything except the lock columns. Callers must hold the lock.
    async fn update_multitenant_database(
        &self,
        database: &MultitenantDatabase,
    ) -> Result<(), RegistryError>;

    /// Returns false if the record is already locked by anyone, including `holder`.
    async fn lock_multitenant_database(&self, id: &str, holder: &str)
    -> Result<bool, RegistryError>;

    /// Returns false if the record was not locked by `holder` (unless `force` is set).
    async fn unlock_multitenant_database(
        &self,
        id: &str,
        holder: &str,
        force: bool,
    ) -> Result<bool, RegistryError>;

    /// Atomically adds to the active membership and returns the updated set.
    async fn add_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError>;

    /// Atomically removes from the active membership and returns the updated set.
    async fn remove_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError>;

    async fn remove_migrated_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError>;

    async fn get_logical_databases(
        &self,
        filter: &LogicalDatabaseFilter,
    ) -> Result<Vec<LogicalDatabase>, RegistryError>;

    async fn get_logical_database(&self, id: &str)
    -> Result<Option<LogicalDatabase>, RegistryError>;

    async fn create_logical_database(
        &self,
        logical_database: &mut LogicalDatabase,
    ) -> Result<(), RegistryError>;

    async fn get_database_schemas(
        &self,
        filter: &DatabaseSchemaFilter,
    ) -> Result<Vec<DatabaseSchema>, RegistryError>;

    async fn create_database_schema(&self, schema: &mut DatabaseSchema)
    -> Result<(), RegistryError>;

    /// Soft delete.
    async fn delete_database_schema(&self, id: &str) -> Result<(), RegistryError>;

    /// Workload cluster placements of an installation. Read-only.
    async fn get_cluster_installations(
        &self,
        installation_id: &str,
    ) -> Result<Vec<ClusterInstallation>, RegistryError>;

    /// Sum of database weights of the given installations, see
    /// [`database_api::models::database_weight_for_state`]. Unknown installations weigh 1.0.
    async fn get_installations_total_database_weight(
        &self,
        installation_ids: &[String],
    ) -> Result<f64, RegistryError>;

    /// The live schema of an installation, if it has one.
    async fn get_database_schema_for_installation(
        &self,
        installation_id: &str,
    ) -> Result<Option<DatabaseSchema>, RegistryError> {
        let schemas = self
            .get_database_schemas(&DatabaseSchemaFilter {
                installation_id: Some(installation_id.to_string()),
                ..Default::default()
            })
            .await?;
        match schemas.len() {
            0 | 1 => Ok(schemas.into_iter().next()),
            n => Err(RegistryError::Decode(format!(
                "installation {installation_id} has {n} live database schemas"
            ))),
        }
    }
}
