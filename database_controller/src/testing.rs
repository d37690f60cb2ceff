//! In-memory stand-ins for the cloud, the secret store and the SQL engines.
//!
//! The SQL fake understands exactly the statements the controller issues and keeps enough
//! state (databases, users, grants, schemas, the PGBouncer auth table) for tests to
//! assert on the effects of an operation rather than on the statements themselves.
//!
//! Every call yields to the scheduler before touching shared state, so operations joined
//! on one task interleave at each cloud, secret and SQL round trip.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use database_api::models::{DatabaseEngine, DatabaseType};
use database_api::secret::RdsSecret;
use database_api::tags;
use parking_lot::Mutex;

use crate::cloud::{
    CLUSTER_STATUS_AVAILABLE, CloudError, ClusterDescription, EndpointStatus, ResourceDirectory,
    TagFilter, TaggedResource,
};
use crate::secrets::{SecretError, SecretStore, validate};
use crate::sql::{ConnectionTarget, SqlConnector, SqlError, SqlExecutor, SqlRow, SqlValue};

pub const TEST_RDS_ARN_PREFIX: &str = "arn:aws:rds:us-east-1:123456789012:cluster:";
pub const TEST_VPC_ARN_PREFIX: &str = "arn:aws:ec2:us-east-1:123456789012:vpc/";

pub fn cluster_arn(cluster_id: &str) -> String {
    format!("{TEST_RDS_ARN_PREFIX}{cluster_id}")
}

pub fn writer_endpoint(cluster_id: &str) -> String {
    format!("{cluster_id}.cluster-c0ffee.us-east-1.rds.amazonaws.com")
}

pub fn reader_endpoint(cluster_id: &str) -> String {
    format!("{cluster_id}.cluster-ro-c0ffee.us-east-1.rds.amazonaws.com")
}

struct MockCluster {
    description: ClusterDescription,
    tags: HashMap<String, String>,
    endpoints: Vec<EndpointStatus>,
}

#[derive(Default)]
struct CloudState {
    clusters: Vec<MockCluster>,
    vpcs: Vec<TaggedResource>,
    tag_writes: usize,
    failing_tag_writes: usize,
}

impl CloudState {
    fn cluster_by_arn(&mut self, arn: &str) -> Result<&mut MockCluster, CloudError> {
        self.clusters
            .iter_mut()
            .find(|c| c.description.arn == arn)
            .ok_or_else(|| CloudError::InvalidResource(format!("unknown resource {arn}")))
    }

    fn cluster(&mut self, cluster_id: &str) -> Result<&mut MockCluster, CloudError> {
        self.clusters
            .iter_mut()
            .find(|c| c.description.cluster_id == cluster_id)
            .ok_or_else(|| CloudError::ClusterNotFound(cluster_id.to_string()))
    }
}

/// Clusters and VPCs with tags. Resources are returned in the order they were added.
#[derive(Default)]
pub struct MockCloud {
    state: Mutex<CloudState>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// A VPC claimed by workload cluster `cloud_cluster_id`.
    pub fn add_vpc(&self, vpc_id: &str, cloud_cluster_id: &str) {
        self.state.lock().vpcs.push(TaggedResource {
            arn: format!("{TEST_VPC_ARN_PREFIX}{vpc_id}"),
            tags: HashMap::from([(
                tags::CLOUD_CLUSTER_ID_TAG_KEY.to_string(),
                cloud_cluster_id.to_string(),
            )]),
        });
    }

    /// A shared cluster tagged the way the infrastructure tooling tags them, with a zero
    /// counter. Returns the RDS cluster ID.
    pub fn add_cluster(&self, database_id: &str, vpc_id: &str, database_type: DatabaseType) -> String {
        let cluster_id = format!("rds-cluster-multitenant-{database_id}");
        let tags = HashMap::from(
            [
                (tags::PURPOSE_TAG_KEY, tags::PURPOSE_TAG_VALUE),
                (tags::OWNER_TAG_KEY, tags::OWNER_TAG_VALUE),
                (tags::TERRAFORM_TAG_KEY, tags::TERRAFORM_TAG_VALUE),
                (tags::DATABASE_TYPE_TAG_KEY, database_type.as_tag_value()),
                (tags::VPC_ID_TAG_KEY, vpc_id),
                (tags::COUNTER_TAG_KEY, "0"),
                (tags::MULTITENANT_DATABASE_ID_TAG_KEY, database_id),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        self.add_cluster_with_tags(&cluster_id, tags);
        cluster_id
    }

    pub fn add_cluster_with_tags(&self, cluster_id: &str, tags: HashMap<String, String>) {
        let available = |endpoint_type: &str| EndpointStatus {
            endpoint_type: endpoint_type.to_string(),
            status: CLUSTER_STATUS_AVAILABLE.to_string(),
        };
        self.state.lock().clusters.push(MockCluster {
            description: ClusterDescription {
                cluster_id: cluster_id.to_string(),
                arn: cluster_arn(cluster_id),
                status: CLUSTER_STATUS_AVAILABLE.to_string(),
                writer_endpoint: writer_endpoint(cluster_id),
                reader_endpoint: reader_endpoint(cluster_id),
            },
            tags,
            endpoints: vec![available("WRITER"), available("READER")],
        });
    }

    pub fn counter(&self, cluster_id: &str) -> Option<String> {
        let mut state = self.state.lock();
        let cluster = state.cluster(cluster_id).ok()?;
        cluster.tags.get(tags::COUNTER_TAG_KEY).cloned()
    }

    pub fn set_tag(&self, cluster_id: &str, key: &str, value: &str) {
        if let Ok(cluster) = self.state.lock().cluster(cluster_id) {
            cluster.tags.insert(key.to_string(), value.to_string());
        }
    }

    pub fn set_status(&self, cluster_id: &str, status: &str) {
        if let Ok(cluster) = self.state.lock().cluster(cluster_id) {
            cluster.description.status = status.to_string();
        }
    }

    pub fn set_endpoint_status(&self, cluster_id: &str, status: &str) {
        if let Ok(cluster) = self.state.lock().cluster(cluster_id) {
            for endpoint in &mut cluster.endpoints {
                endpoint.status = status.to_string();
            }
        }
    }

    pub fn set_endpoints(&self, cluster_id: &str, writer: &str, reader: &str) {
        if let Ok(cluster) = self.state.lock().cluster(cluster_id) {
            cluster.description.writer_endpoint = writer.to_string();
            cluster.description.reader_endpoint = reader.to_string();
        }
    }

    /// Tag and untag calls served so far, successful or not.
    pub fn tag_writes(&self) -> usize {
        self.state.lock().tag_writes
    }

    /// Make the next `times` tag writes fail.
    pub fn fail_next_tag_writes(&self, times: usize) {
        self.state.lock().failing_tag_writes = times;
    }
}

#[async_trait]
impl ResourceDirectory for MockCloud {
    async fn find_resources_by_tags(
        &self,
        filters: &[TagFilter],
        resource_types: &[&str],
    ) -> Result<Vec<TaggedResource>, CloudError> {
        tokio::task::yield_now().await;
        let state = self.state.lock();
        let matches = |tags: &HashMap<String, String>| filters.iter().all(|f| f.matches(tags));
        let mut resources = Vec::new();
        if resource_types.contains(&tags::RDS_CLUSTER_RESOURCE_TYPE) {
            resources.extend(
                state
                    .clusters
                    .iter()
                    .filter(|c| matches(&c.tags))
                    .map(|c| TaggedResource {
                        arn: c.description.arn.clone(),
                        tags: c.tags.clone(),
                    }),
            );
        }
        if resource_types.contains(&tags::VPC_RESOURCE_TYPE) {
            resources.extend(state.vpcs.iter().filter(|v| matches(&v.tags)).cloned());
        }
        Ok(resources)
    }

    async fn tag_resource(
        &self,
        arn: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), CloudError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.tag_writes += 1;
        if state.failing_tag_writes > 0 {
            state.failing_tag_writes -= 1;
            return Err(CloudError::Api {
                operation: "TagResources",
                message: "injected failure".to_string(),
            });
        }
        let cluster = state.cluster_by_arn(arn)?;
        cluster
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn untag_resource(&self, arn: &str, keys: &[String]) -> Result<(), CloudError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.tag_writes += 1;
        let cluster = state.cluster_by_arn(arn)?;
        for key in keys {
            cluster.tags.remove(key);
        }
        Ok(())
    }

    async fn describe_cluster(&self, cluster_id: &str) -> Result<ClusterDescription, CloudError> {
        tokio::task::yield_now().await;
        Ok(self.state.lock().cluster(cluster_id)?.description.clone())
    }

    async fn describe_cluster_endpoints(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<EndpointStatus>, CloudError> {
        tokio::task::yield_now().await;
        Ok(self.state.lock().cluster(cluster_id)?.endpoints.clone())
    }
}

#[derive(Default)]
struct SecretState {
    secrets: BTreeMap<String, (RdsSecret, Vec<(String, String)>)>,
    mutations: usize,
}

#[derive(Default)]
pub struct MockSecretStore {
    state: Mutex<SecretState>,
}

impl MockSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a secret without counting it as a mutation.
    pub fn put(&self, name: &str, secret: RdsSecret) {
        self.state
            .lock()
            .secrets
            .insert(name.to_string(), (secret, Vec::new()));
    }

    pub fn get(&self, name: &str) -> Option<RdsSecret> {
        self.state.lock().secrets.get(name).map(|(s, _)| s.clone())
    }

    pub fn tags(&self, name: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .secrets
            .get(name)
            .map(|(_, tags)| tags.clone())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.state.lock().secrets.keys().cloned().collect()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations
    }
}

#[async_trait]
impl SecretStore for MockSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<RdsSecret>, SecretError> {
        tokio::task::yield_now().await;
        let secret = self.get(name);
        if let Some(secret) = &secret {
            validate(name, secret)?;
        }
        Ok(secret)
    }

    async fn create_secret(
        &self,
        name: &str,
        secret: &RdsSecret,
        tags: &[(String, String)],
    ) -> Result<(), SecretError> {
        validate(name, secret)?;
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.mutations += 1;
        if state.secrets.contains_key(name) {
            return Err(SecretError::Api {
                operation: "CreateSecret",
                name: name.to_string(),
                message: "ResourceExistsException".to_string(),
            });
        }
        state
            .secrets
            .insert(name.to_string(), (secret.clone(), tags.to_vec()));
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), SecretError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.mutations += 1;
        state.secrets.remove(name);
        Ok(())
    }
}

#[derive(Default)]
struct HostState {
    databases: BTreeSet<String>,
    /// User name to password.
    users: BTreeMap<String, String>,
    /// (database, user) pairs with privileges on the database.
    privileges: BTreeSet<(String, String)>,
    owners: BTreeMap<String, String>,
    /// Database to schema to owner.
    schemas: BTreeMap<String, BTreeMap<String, Option<String>>>,
    /// Database to `schema.table`.
    tables: BTreeMap<String, BTreeSet<String>>,
    functions: BTreeSet<String>,
    settings: BTreeMap<String, Vec<String>>,
    auth_rows: BTreeMap<String, String>,
}

impl HostState {
    fn new(engine: DatabaseEngine) -> Self {
        let mut host = Self::default();
        if engine == DatabaseEngine::Postgres {
            host.databases.insert("postgres".to_string());
        }
        host
    }
}

#[derive(Default)]
struct SqlState {
    hosts: HashMap<String, HostState>,
    statements: Vec<String>,
    opened: usize,
    closed: usize,
    failures: Vec<(String, usize)>,
}

/// A fake SQL server per host. Connecting to a host creates it on first use.
#[derive(Clone, Default)]
pub struct MockSqlServer {
    state: Arc<Mutex<SqlState>>,
}

impl MockSqlServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` statements containing `fragment` fail with an error whose
    /// message includes the full statement text.
    pub fn fail_statements_containing(&self, fragment: &str, times: usize) {
        self.state
            .lock()
            .failures
            .push((fragment.to_string(), times));
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn open_connections(&self) -> usize {
        let state = self.state.lock();
        state.opened - state.closed
    }

    fn with_host<R>(&self, host: &str, f: impl FnOnce(&HostState) -> R) -> Option<R> {
        self.state.lock().hosts.get(host).map(f)
    }

    pub fn has_database(&self, host: &str, database: &str) -> bool {
        self.with_host(host, |h| h.databases.contains(database))
            .unwrap_or(false)
    }

    pub fn databases(&self, host: &str) -> Vec<String> {
        self.with_host(host, |h| h.databases.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_user(&self, host: &str, user: &str) -> bool {
        self.with_host(host, |h| h.users.contains_key(user))
            .unwrap_or(false)
    }

    pub fn user_password(&self, host: &str, user: &str) -> Option<String> {
        self.with_host(host, |h| h.users.get(user).cloned()).flatten()
    }

    pub fn has_privileges(&self, host: &str, database: &str, user: &str) -> bool {
        self.with_host(host, |h| {
            h.privileges
                .contains(&(database.to_string(), user.to_string()))
        })
        .unwrap_or(false)
    }

    pub fn has_schema(&self, host: &str, database: &str, schema: &str) -> bool {
        self.with_host(host, |h| {
            h.schemas
                .get(database)
                .is_some_and(|s| s.contains_key(schema))
        })
        .unwrap_or(false)
    }

    pub fn has_table(&self, host: &str, database: &str, table: &str) -> bool {
        self.with_host(host, |h| h.tables.get(database).is_some_and(|t| t.contains(table)))
            .unwrap_or(false)
    }

    pub fn has_function(&self, host: &str, function: &str) -> bool {
        self.with_host(host, |h| h.functions.contains(function))
            .unwrap_or(false)
    }

    pub fn database_settings(&self, host: &str, database: &str) -> Vec<String> {
        self.with_host(host, |h| h.settings.get(database).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn auth_row(&self, host: &str, user: &str) -> Option<String> {
        self.with_host(host, |h| h.auth_rows.get(user).cloned()).flatten()
    }
}

#[async_trait]
impl SqlConnector for MockSqlServer {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn SqlExecutor>, SqlError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        let host = state
            .hosts
            .entry(target.host.clone())
            .or_insert_with(|| HostState::new(target.engine));
        let database = match &target.database {
            Some(database) => {
                if !host.databases.contains(database) {
                    return Err(SqlError::Connect {
                        target: target.describe(),
                        message: format!("database \"{database}\" does not exist"),
                    });
                }
                Some(database.clone())
            }
            None => None,
        };
        state.opened += 1;
        Ok(Box::new(MockExecutor {
            state: self.state.clone(),
            engine: target.engine,
            host: target.host.clone(),
            database: database.unwrap_or_else(|| match target.engine {
                DatabaseEngine::Postgres => "postgres".to_string(),
                DatabaseEngine::MySql => String::new(),
            }),
        }))
    }
}

struct MockExecutor {
    state: Arc<Mutex<SqlState>>,
    engine: DatabaseEngine,
    host: String,
    database: String,
}

/// Contents of every quoted token, in order: `"x"`, `` `x` `` and `'x'`, with doubled
/// quote characters unescaped.
fn quoted_tokens(query: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        if !matches!(c, '"' | '`' | '\'') {
            continue;
        }
        let mut token = String::new();
        while let Some(next) = chars.next() {
            if next == c {
                if chars.peek() == Some(&c) {
                    chars.next();
                    token.push(c);
                    continue;
                }
                break;
            }
            token.push(next);
        }
        tokens.push(token);
    }
    tokens
}

fn text_param(params: &[SqlValue], idx: usize) -> Result<String, SqlError> {
    match params.get(idx) {
        Some(SqlValue::Text(s)) => Ok(s.clone()),
        other => Err(SqlError::Query(format!("expected text parameter ${}, got {other:?}", idx + 1))),
    }
}

fn one_row(found: bool) -> Vec<SqlRow> {
    if found {
        vec![SqlRow::new(vec!["?column?".to_string()], vec![SqlValue::Int(1)])]
    } else {
        Vec::new()
    }
}

impl MockExecutor {
    fn run(&self, state: &mut SqlState, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SqlError> {
        if let Some((_, remaining)) = state
            .failures
            .iter_mut()
            .find(|(fragment, remaining)| *remaining > 0 && query.contains(fragment.as_str()))
        {
            *remaining -= 1;
            return Err(SqlError::Query(format!("mock failure executing: {query}")));
        }

        let database = self.database.clone();
        let host = state
            .hosts
            .get_mut(&self.host)
            .ok_or(SqlError::Closed)?;
        let tokens = quoted_tokens(query);
        let token = |idx: usize| -> Result<String, SqlError> {
            tokens
                .get(idx)
                .cloned()
                .ok_or_else(|| SqlError::Query(format!("missing identifier in: {query}")))
        };

        // Lookups.
        if query.starts_with("SELECT 1 FROM pg_database") || query.starts_with("SELECT SCHEMA_NAME") {
            return Ok(one_row(host.databases.contains(&text_param(params, 0)?)));
        }
        if query.starts_with("SELECT 1 FROM pg_roles") || query.starts_with("SELECT User FROM") {
            return Ok(one_row(host.users.contains_key(&text_param(params, 0)?)));
        }
        if query.starts_with("SELECT 1 FROM information_schema.tables") {
            let table = format!("{}.{}", text_param(params, 0)?, text_param(params, 1)?);
            return Ok(one_row(
                host.tables.get(&database).is_some_and(|t| t.contains(&table)),
            ));
        }
        if query.starts_with("SELECT pg_terminate_backend") {
            return Ok(Vec::new());
        }

        // Databases.
        if query.starts_with("CREATE DATABASE ") {
            let name = token(0)?;
            if !host.databases.insert(name.clone()) {
                return Err(SqlError::Query(format!("database {name} already exists")));
            }
            return Ok(Vec::new());
        }
        if query.starts_with("DROP DATABASE IF EXISTS ") {
            let name = token(0)?;
            host.databases.remove(&name);
            host.privileges.retain(|(db, _)| *db != name);
            host.owners.remove(&name);
            host.schemas.remove(&name);
            host.tables.remove(&name);
            host.settings.remove(&name);
            return Ok(Vec::new());
        }
        if query.starts_with("ALTER DATABASE ") && query.contains(" OWNER TO ") {
            let (name, owner) = (token(0)?, token(1)?);
            host.owners.insert(name, owner);
            return Ok(Vec::new());
        }
        if query.starts_with("ALTER DATABASE ") && query.contains(" SET ") {
            let name = token(0)?;
            let setting = query
                .split_once(" SET ")
                .map(|(_, s)| s.to_string())
                .unwrap_or_default();
            let settings = host.settings.entry(name).or_default();
            if !settings.contains(&setting) {
                settings.push(setting);
            }
            return Ok(Vec::new());
        }

        // Users.
        if query.starts_with("CREATE ROLE ") || query.starts_with("CREATE USER ") {
            let name = token(0)?;
            let password = tokens
                .last()
                .cloned()
                .ok_or_else(|| SqlError::Query(format!("missing password in: {query}")))?;
            if host.users.contains_key(&name) {
                return Err(SqlError::Query(format!("role {name} already exists")));
            }
            host.users.insert(name, password);
            return Ok(Vec::new());
        }
        if query.starts_with("DROP ROLE IF EXISTS ") || query.starts_with("DROP USER IF EXISTS ") {
            let name = token(0)?;
            if !host.users.contains_key(&name) {
                return Ok(Vec::new());
            }
            if self.engine == DatabaseEngine::Postgres
                && (host.owners.values().any(|o| *o == name)
                    || host.privileges.iter().any(|(_, u)| *u == name))
            {
                return Err(SqlError::Query(format!(
                    "role {name} cannot be dropped because some objects depend on it"
                )));
            }
            host.users.remove(&name);
            host.privileges.retain(|(_, u)| *u != name);
            return Ok(Vec::new());
        }
        if query.starts_with("DROP OWNED BY ") {
            let name = token(0)?;
            host.privileges.retain(|(_, u)| *u != name);
            if let Some(schemas) = host.schemas.get_mut(&database) {
                schemas.retain(|_, owner| owner.as_deref() != Some(name.as_str()));
            }
            return Ok(Vec::new());
        }

        // Privileges.
        if query.starts_with("GRANT ALL PRIVILEGES ON ") || query.starts_with("GRANT CONNECT ON DATABASE ") {
            let (db, user) = (token(0)?, token(1)?);
            if !host.users.contains_key(&user) {
                return Err(SqlError::Query(format!("role {user} does not exist")));
            }
            host.privileges.insert((db, user));
            return Ok(Vec::new());
        }
        if query.starts_with("GRANT ") && query.ends_with(" TO CURRENT_USER") {
            let user = token(0)?;
            if !host.users.contains_key(&user) {
                return Err(SqlError::Query(format!("role {user} does not exist")));
            }
            return Ok(Vec::new());
        }
        if query.starts_with("REVOKE ALL ON ")
            || query.starts_with("GRANT USAGE ON SCHEMA ")
            || query.starts_with("GRANT EXECUTE ON FUNCTION ")
        {
            return Ok(Vec::new());
        }

        // Schemas, tables and functions.
        if query.starts_with("CREATE SCHEMA IF NOT EXISTS ") {
            let rest = &query["CREATE SCHEMA IF NOT EXISTS ".len()..];
            let (name, owner) = match tokens.as_slice() {
                [] => (rest.trim().to_string(), None),
                [name] => (name.clone(), None),
                [name, owner, ..] => (name.clone(), Some(owner.clone())),
            };
            host.schemas
                .entry(database)
                .or_default()
                .entry(name)
                .or_insert(owner);
            return Ok(Vec::new());
        }
        if query.starts_with("DROP SCHEMA IF EXISTS ") {
            let name = token(0)?;
            if let Some(schemas) = host.schemas.get_mut(&database) {
                schemas.remove(&name);
            }
            return Ok(Vec::new());
        }
        if query.starts_with("CREATE TABLE pgbouncer.pgbouncer_users") {
            let tables = host.tables.entry(database).or_default();
            if !tables.insert("pgbouncer.pgbouncer_users".to_string()) {
                return Err(SqlError::Query("relation pgbouncer_users already exists".to_string()));
            }
            return Ok(Vec::new());
        }
        if query.starts_with("CREATE OR REPLACE FUNCTION pgbouncer.get_auth") {
            host.functions.insert("pgbouncer.get_auth".to_string());
            return Ok(Vec::new());
        }

        // Auth table rows.
        if query.starts_with("INSERT INTO pgbouncer.pgbouncer_users") {
            host.auth_rows
                .insert(text_param(params, 0)?, text_param(params, 1)?);
            return Ok(Vec::new());
        }
        if query.starts_with("DELETE FROM pgbouncer.pgbouncer_users") {
            host.auth_rows.remove(&text_param(params, 0)?);
            return Ok(Vec::new());
        }

        Err(SqlError::Query(format!("unsupported statement: {query}")))
    }
}

#[async_trait]
impl SqlExecutor for MockExecutor {
    async fn execute(&mut self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, SqlError> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        state.statements.push(query.to_string());
        self.run(&mut state, query, params)
    }

    async fn close(self: Box<Self>) -> Result<(), SqlError> {
        self.state.lock().closed += 1;
        Ok(())
    }
}
