use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::tags;

/// Weight of an installation that is actively serving traffic.
pub const DEFAULT_DATABASE_WEIGHT: f64 = 1.0;
/// Weight of a hibernating installation: its schema stays on the cluster but it
/// generates far less load, so more of them fit under the same limit.
pub const HIBERNATING_DATABASE_WEIGHT: f64 = 0.75;

/// Database weight for an installation in the given lifecycle state.
pub fn database_weight_for_state(installation_state: &str) -> f64 {
    match installation_state {
        "hibernating" | "hibernation-in-progress" => HIBERNATING_DATABASE_WEIGHT,
        _ => DEFAULT_DATABASE_WEIGHT,
    }
}

/// Engine and topology of a shared cluster.
///
/// The string forms are the values of the [`tags::DATABASE_TYPE_TAG_KEY`] cloud tag,
/// and are also persisted in the registry.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    #[serde(rename = "multitenant-rds")]
    MysqlAurora,
    #[serde(rename = "multitenant-rds-postgres")]
    PostgresAurora,
    #[serde(rename = "multitenant-rds-postgres-pgbouncer")]
    PostgresPgbouncerAurora,
}

impl DatabaseType {
    pub const ALL: [DatabaseType; 3] = [
        DatabaseType::MysqlAurora,
        DatabaseType::PostgresAurora,
        DatabaseType::PostgresPgbouncerAurora,
    ];

    pub fn as_tag_value(&self) -> &'static str {
        match self {
            DatabaseType::MysqlAurora => tags::DATABASE_TYPE_MYSQL,
            DatabaseType::PostgresAurora => tags::DATABASE_TYPE_POSTGRES,
            DatabaseType::PostgresPgbouncerAurora => tags::DATABASE_TYPE_POSTGRES_PGBOUNCER,
        }
    }

    pub fn engine(&self) -> DatabaseEngine {
        match self {
            DatabaseType::MysqlAurora => DatabaseEngine::MySql,
            DatabaseType::PostgresAurora | DatabaseType::PostgresPgbouncerAurora => {
                DatabaseEngine::Postgres
            }
        }
    }

    /// Proxied clusters are reached through PGBouncer and group installations into
    /// shared logical databases.
    pub fn is_proxied(&self) -> bool {
        matches!(self, DatabaseType::PostgresPgbouncerAurora)
    }
}

impl Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag_value())
    }
}

impl FromStr for DatabaseType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatabaseType::ALL
            .into_iter()
            .find(|t| t.as_tag_value() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown multitenant database type '{s}'"))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum DatabaseEngine {
    MySql,
    Postgres,
}

impl DatabaseEngine {
    pub fn default_port(&self) -> u16 {
        match self {
            DatabaseEngine::MySql => 3306,
            DatabaseEngine::Postgres => 5432,
        }
    }
}

/// Proxied clusters start out in [`MultitenantDatabaseState::ProvisioningRequested`] until
/// the cluster-wide PGBouncer auth setup has run once. Everything else is `Stable`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MultitenantDatabaseState {
    ProvisioningRequested,
    Stable,
}

impl FromStr for MultitenantDatabaseState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning-requested" => Ok(Self::ProvisioningRequested),
            "stable" => Ok(Self::Stable),
            _ => Err(anyhow::anyhow!("Unknown multitenant database state '{s}'")),
        }
    }
}

impl From<MultitenantDatabaseState> for String {
    fn from(value: MultitenantDatabaseState) -> String {
        use MultitenantDatabaseState::*;
        match value {
            ProvisioningRequested => "provisioning-requested",
            Stable => "stable",
        }
        .to_string()
    }
}

/// An ordered set of installation IDs. Insertion order is kept so that adding and
/// removing members is deterministic and diffs of two snapshots are meaningful.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct InstallationIds(Vec<String>);

impl InstallationIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the ID was already present.
    pub fn add(&mut self, installation_id: &str) -> bool {
        if self.contains(installation_id) {
            return false;
        }
        self.0.push(installation_id.to_string());
        true
    }

    /// Returns false if the ID was not present.
    pub fn remove(&mut self, installation_id: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|id| id != installation_id);
        before != self.0.len()
    }

    pub fn contains(&self, installation_id: &str) -> bool {
        self.0.iter().any(|id| id == installation_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// A copy of this set with `installation_id` added.
    pub fn with(&self, installation_id: &str) -> Self {
        let mut ids = self.clone();
        ids.add(installation_id);
        ids
    }

    /// A copy of this set with `installation_id` removed.
    pub fn without(&self, installation_id: &str) -> Self {
        let mut ids = self.clone();
        ids.remove(installation_id);
        ids
    }
}

impl<S: Into<String>> FromIterator<S> for InstallationIds {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut ids = InstallationIds::new();
        for id in iter {
            ids.add(&id.into());
        }
        ids
    }
}

/// A shared cluster known to the registry.
///
/// Records are never hard-deleted by the controller: a cluster whose last installation
/// was torn down stays a valid placement target.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MultitenantDatabase {
    pub id: String,
    pub rds_cluster_id: String,
    pub vpc_id: String,
    pub database_type: DatabaseType,
    pub state: MultitenantDatabaseState,
    pub installations: InstallationIds,
    /// Installations migrated away whose old schema has not been torn down yet.
    pub migrated_installations: InstallationIds,
    pub writer_endpoint: String,
    pub reader_endpoint: String,
    /// Only meaningful for proxied clusters.
    pub max_installations_per_logical_database: i64,
    pub create_at: i64,
    pub delete_at: i64,
    pub lock_acquired_by: Option<String>,
    pub lock_acquired_at: i64,
}

impl MultitenantDatabase {
    /// A freshly discovered cluster, not yet persisted.
    pub fn new(
        id: String,
        rds_cluster_id: String,
        vpc_id: String,
        database_type: DatabaseType,
        max_installations_per_logical_database: i64,
    ) -> Self {
        let state = if database_type.is_proxied() {
            MultitenantDatabaseState::ProvisioningRequested
        } else {
            MultitenantDatabaseState::Stable
        };
        Self {
            id,
            rds_cluster_id,
            vpc_id,
            database_type,
            state,
            installations: InstallationIds::new(),
            migrated_installations: InstallationIds::new(),
            writer_endpoint: String::new(),
            reader_endpoint: String::new(),
            max_installations_per_logical_database,
            create_at: 0,
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_at != 0
    }

    pub fn is_locked(&self) -> bool {
        self.lock_acquired_at != 0
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct MultitenantDatabaseFilter {
    pub database_type: Option<DatabaseType>,
    pub vpc_id: Option<String>,
    /// Match records whose active membership contains this installation.
    pub installation_id: Option<String>,
    /// Match records whose migrated-out membership contains this installation.
    pub migrated_installation_id: Option<String>,
    /// Match records with strictly fewer active installations than this.
    pub max_installations_limit: Option<usize>,
    pub include_deleted: bool,
}

impl MultitenantDatabaseFilter {
    pub fn for_installation(installation_id: &str) -> Self {
        Self {
            installation_id: Some(installation_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, database: &MultitenantDatabase) -> bool {
        if !self.include_deleted && database.is_deleted() {
            return false;
        }
        if let Some(database_type) = self.database_type {
            if database.database_type != database_type {
                return false;
            }
        }
        if let Some(vpc_id) = &self.vpc_id {
            if &database.vpc_id != vpc_id {
                return false;
            }
        }
        if let Some(installation_id) = &self.installation_id {
            if !database.installations.contains(installation_id) {
                return false;
            }
        }
        if let Some(installation_id) = &self.migrated_installation_id {
            if !database.migrated_installations.contains(installation_id) {
                return false;
            }
        }
        if let Some(limit) = self.max_installations_limit {
            if database.installations.len() >= limit {
                return false;
            }
        }
        true
    }
}

/// A grouping unit inside a proxied cluster that holds the schemas of several installations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LogicalDatabase {
    pub id: String,
    pub multitenant_database_id: String,
    pub name: String,
    pub create_at: i64,
    pub delete_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LogicalDatabaseFilter {
    pub multitenant_database_id: Option<String>,
    pub include_deleted: bool,
}

impl LogicalDatabaseFilter {
    pub fn matches(&self, logical_database: &LogicalDatabase) -> bool {
        if !self.include_deleted && logical_database.delete_at != 0 {
            return false;
        }
        match &self.multitenant_database_id {
            Some(id) => &logical_database.multitenant_database_id == id,
            None => true,
        }
    }
}

/// The per-installation schema inside a [`LogicalDatabase`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DatabaseSchema {
    pub id: String,
    pub logical_database_id: String,
    pub installation_id: String,
    pub name: String,
    pub create_at: i64,
    pub delete_at: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DatabaseSchemaFilter {
    pub logical_database_id: Option<String>,
    pub installation_id: Option<String>,
    pub include_deleted: bool,
}

impl DatabaseSchemaFilter {
    pub fn matches(&self, schema: &DatabaseSchema) -> bool {
        if !self.include_deleted && schema.delete_at != 0 {
            return false;
        }
        if let Some(id) = &self.logical_database_id {
            if &schema.logical_database_id != id {
                return false;
            }
        }
        if let Some(id) = &self.installation_id {
            if &schema.installation_id != id {
                return false;
            }
        }
        true
    }
}

/// Placement of an installation onto a workload cluster. The controller only reads these
/// to resolve which VPC an installation lives in.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClusterInstallation {
    pub id: String,
    pub cluster_id: String,
    pub installation_id: String,
}

/// One side of a database migration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct MigrationTarget {
    pub database_type: DatabaseType,
    pub multitenant_database_id: String,
}

/// Moves an installation's database from `source` to `destination`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DatabaseMigration {
    pub installation_id: String,
    pub source: MigrationTarget,
    pub destination: MigrationTarget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_type_tag_values_round_trip() {
        for database_type in DatabaseType::ALL {
            let parsed: DatabaseType = database_type.as_tag_value().parse().unwrap();
            assert_eq!(parsed, database_type);
            let json = serde_json::to_string(&database_type).unwrap();
            assert_eq!(json, format!("\"{}\"", database_type.as_tag_value()));
        }
        assert!("mysql".parse::<DatabaseType>().is_err());
    }

    #[test]
    fn installation_ids_keep_order_and_uniqueness() {
        let mut ids: InstallationIds = ["a", "b"].into_iter().collect();
        assert!(!ids.add("a"));
        assert!(ids.add("c"));
        assert_eq!(ids.as_slice(), &["a", "b", "c"]);
        assert!(ids.remove("b"));
        assert!(!ids.remove("b"));
        assert_eq!(ids.as_slice(), &["a", "c"]);
        assert_eq!(ids.without("a").as_slice(), &["c"]);
        assert_eq!(ids.with("d").len(), 3);
    }

    #[test]
    fn filter_matches_on_capacity_and_membership() {
        let mut db = MultitenantDatabase::new(
            "db1".to_string(),
            "rds-cluster-multitenant-1".to_string(),
            "vpc-1".to_string(),
            DatabaseType::PostgresAurora,
            0,
        );
        db.installations.add("inst-a");

        let filter = MultitenantDatabaseFilter {
            database_type: Some(DatabaseType::PostgresAurora),
            vpc_id: Some("vpc-1".to_string()),
            max_installations_limit: Some(1),
            ..Default::default()
        };
        assert!(!filter.matches(&db));

        let filter = MultitenantDatabaseFilter {
            max_installations_limit: Some(2),
            ..filter
        };
        assert!(filter.matches(&db));
        assert!(MultitenantDatabaseFilter::for_installation("inst-a").matches(&db));
        assert!(!MultitenantDatabaseFilter::for_installation("inst-b").matches(&db));

        db.delete_at = 1;
        assert!(!filter.matches(&db));
    }

    #[test]
    fn proxied_clusters_start_in_provisioning_requested() {
        let db = MultitenantDatabase::new(
            "db1".to_string(),
            "c".to_string(),
            "vpc".to_string(),
            DatabaseType::PostgresPgbouncerAurora,
            10,
        );
        assert_eq!(db.state, MultitenantDatabaseState::ProvisioningRequested);
        let state: String = db.state.into();
        assert_eq!(state.parse::<MultitenantDatabaseState>().unwrap(), db.state);
    }

    #[test]
    fn hibernating_installations_weigh_less() {
        assert_eq!(database_weight_for_state("stable"), DEFAULT_DATABASE_WEIGHT);
        assert_eq!(
            database_weight_for_state("hibernating"),
            HIBERNATING_DATABASE_WEIGHT
        );
    }
}
