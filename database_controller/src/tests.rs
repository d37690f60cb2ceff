use std::sync::Arc;

use database_api::models::{
    ClusterInstallation, DatabaseMigration, DatabaseSchemaFilter, DatabaseType,
    LogicalDatabaseFilter, MigrationTarget, MultitenantDatabaseState,
};
use database_api::secret::RdsSecret;
use rstest::rstest;

use crate::config::{Config, CounterMode};
use crate::context::{Collaborators, Context};
use crate::error::PlacementError;
use crate::k8s_secret::{DB_CONNECTION_CHECK_URL, DB_CONNECTION_STRING, DB_READ_REPLICAS};
use crate::multitenant::{InstallationDatabase, installation_database};
use crate::naming;
use crate::registry::{MemoryRegistry, Registry, RegistryOperation};
use crate::testing::{MockCloud, MockSecretStore, MockSqlServer, writer_endpoint};

const VPC: &str = "vpc-0a1b2c";
const CLOUD_CLUSTER: &str = "workload-1";
const MASTER_USERNAME: &str = "admin";
const MASTER_PASSWORD: &str = "master-password";

struct TestEnv {
    registry: Arc<MemoryRegistry>,
    cloud: Arc<MockCloud>,
    secrets: Arc<MockSecretStore>,
    sql: Arc<MockSqlServer>,
    ctx: Arc<Context>,
}

impl TestEnv {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let cloud = Arc::new(MockCloud::new());
        let secrets = Arc::new(MockSecretStore::new());
        let sql = Arc::new(MockSqlServer::new());
        cloud.add_vpc(VPC, CLOUD_CLUSTER);
        let ctx = Context::new(
            Collaborators {
                registry: registry.clone(),
                directory: cloud.clone(),
                secrets: secrets.clone(),
                connector: sql.clone(),
            },
            config,
        );
        Self {
            registry,
            cloud,
            secrets,
            sql,
            ctx,
        }
    }

    /// A tagged shared cluster with master credentials. Returns its RDS cluster ID.
    fn add_shared_cluster(&self, database_id: &str, database_type: DatabaseType) -> String {
        let cluster_id = self.cloud.add_cluster(database_id, VPC, database_type);
        self.secrets.put(
            &naming::master_secret_name(&cluster_id),
            RdsSecret::new(MASTER_USERNAME, MASTER_PASSWORD),
        );
        cluster_id
    }

    fn add_installation(&self, installation_id: &str) {
        self.registry.add_cluster_installation(ClusterInstallation {
            id: format!("ci-{installation_id}"),
            cluster_id: CLOUD_CLUSTER.to_string(),
            installation_id: installation_id.to_string(),
        });
    }

    fn database(&self, database_type: DatabaseType) -> Box<dyn InstallationDatabase> {
        installation_database(self.ctx.clone(), database_type)
    }

    fn members(&self, database_id: &str) -> Vec<String> {
        self.registry
            .peek_multitenant_database(database_id)
            .map(|db| db.installations.as_slice().to_vec())
            .unwrap_or_default()
    }

    fn counter(&self, cluster_id: &str) -> String {
        self.cloud.counter(cluster_id).unwrap_or_default()
    }

    fn installation_password(&self, installation_id: &str) -> String {
        self.secrets
            .get(&naming::installation_secret_name(installation_id))
            .map(|s| s.master_password)
            .unwrap_or_default()
    }
}

fn migration(
    installation_id: &str,
    source: (&str, DatabaseType),
    destination: (&str, DatabaseType),
) -> DatabaseMigration {
    DatabaseMigration {
        installation_id: installation_id.to_string(),
        source: MigrationTarget {
            database_type: source.1,
            multitenant_database_id: source.0.to_string(),
        },
        destination: MigrationTarget {
            database_type: destination.1,
            multitenant_database_id: destination.0.to_string(),
        },
    }
}

#[rstest]
#[case::mysql(DatabaseType::MysqlAurora)]
#[case::postgres(DatabaseType::PostgresAurora)]
#[tokio::test]
async fn provision_discovers_cluster_then_reuses_registry_record(#[case] database_type: DatabaseType) {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", database_type);
    let host = writer_endpoint(&cluster_id);
    env.add_installation("inst-a");
    env.add_installation("inst-b");
    let database = env.database(database_type);

    // Nothing in the registry yet: found through tags and registered.
    database.provision("inst-a").await.unwrap();
    let record = env.registry.peek_multitenant_database("db1").unwrap();
    assert_eq!(record.rds_cluster_id, cluster_id);
    assert_eq!(record.database_type, database_type);
    assert_eq!(record.vpc_id, VPC);
    assert_eq!(record.writer_endpoint, host);
    assert!(!record.is_locked());
    assert_eq!(env.members("db1"), vec!["inst-a"]);
    assert_eq!(env.counter(&cluster_id), "1");

    // Now found through the registry.
    database.provision("inst-b").await.unwrap();
    assert_eq!(env.members("db1"), vec!["inst-a", "inst-b"]);
    assert_eq!(env.counter(&cluster_id), "2");

    for installation_id in ["inst-a", "inst-b"] {
        let database_name = naming::database_name(installation_id);
        let username = naming::database_username(installation_id);
        assert!(env.sql.has_database(&host, &database_name));
        assert_eq!(
            env.sql.user_password(&host, &username),
            Some(env.installation_password(installation_id))
        );
        assert!(env.sql.has_privileges(&host, &database_name, &username));
    }
    assert_eq!(env.sql.open_connections(), 0);
}

#[rstest]
#[case::mysql(DatabaseType::MysqlAurora)]
#[case::postgres(DatabaseType::PostgresAurora)]
#[tokio::test]
async fn provision_is_idempotent(#[case] database_type: DatabaseType) {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", database_type);
    env.add_installation("inst-a");
    let database = env.database(database_type);

    database.provision("inst-a").await.unwrap();
    let password = env.installation_password("inst-a");
    let secret_writes = env.secrets.mutation_count();

    database.provision("inst-a").await.unwrap();
    assert_eq!(env.installation_password("inst-a"), password);
    assert_eq!(env.secrets.mutation_count(), secret_writes);
    assert_eq!(env.members("db1"), vec!["inst-a"]);
    assert_eq!(env.counter(&cluster_id), "1");
}

#[tokio::test]
async fn interrupted_provision_completes_on_reentry() {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.add_installation("inst-a");
    let database = env.database(DatabaseType::MysqlAurora);

    // Membership is persisted, then the counter write fails.
    env.cloud.fail_next_tag_writes(1);
    let err = database.provision("inst-a").await.unwrap_err();
    assert!(matches!(err, PlacementError::Cloud { .. }), "{err}");
    assert_eq!(env.members("db1"), vec!["inst-a"]);
    assert_eq!(env.counter(&cluster_id), "0");
    assert!(!env.registry.peek_multitenant_database("db1").unwrap().is_locked());

    database.provision("inst-a").await.unwrap();
    assert_eq!(env.members("db1"), vec!["inst-a"]);
    assert_eq!(env.counter(&cluster_id), "1");
}

#[tokio::test]
async fn teardown_with_keep_data_changes_nothing() {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::PostgresAurora);
    env.add_installation("inst-a");
    let database = env.database(DatabaseType::PostgresAurora);
    database.provision("inst-a").await.unwrap();

    let registry_mutations = env.registry.mutation_count();
    let tag_writes = env.cloud.tag_writes();
    let secret_mutations = env.secrets.mutation_count();
    let statements = env.sql.statements().len();

    database.teardown("inst-a", true).await.unwrap();

    assert_eq!(env.registry.mutation_count(), registry_mutations);
    assert_eq!(env.cloud.tag_writes(), tag_writes);
    assert_eq!(env.secrets.mutation_count(), secret_mutations);
    assert_eq!(env.sql.statements().len(), statements);
    assert_eq!(env.members("db1"), vec!["inst-a"]);
    assert!(env.sql.has_database(&writer_endpoint(&cluster_id), "cloud_inst-a"));
}

#[rstest]
#[case::mysql(DatabaseType::MysqlAurora)]
#[case::postgres(DatabaseType::PostgresAurora)]
#[tokio::test]
async fn teardown_is_idempotent(#[case] database_type: DatabaseType) {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", database_type);
    let host = writer_endpoint(&cluster_id);
    env.add_installation("inst-a");
    env.add_installation("inst-b");
    let database = env.database(database_type);
    database.provision("inst-a").await.unwrap();
    database.provision("inst-b").await.unwrap();

    database.teardown("inst-a", false).await.unwrap();
    let after_first = env.registry.peek_multitenant_database("db1").unwrap();
    assert_eq!(env.members("db1"), vec!["inst-b"]);
    assert_eq!(env.counter(&cluster_id), "1");
    assert!(!env.sql.has_database(&host, "cloud_inst-a"));
    assert!(!env.sql.has_user(&host, "user_inst-a"));
    assert!(env.secrets.get("rds-multitenant-inst-a").is_none());
    assert!(env.sql.has_database(&host, "cloud_inst-b"));

    let databases = env.sql.databases(&host);
    database.teardown("inst-a", false).await.unwrap();
    assert_eq!(env.registry.peek_multitenant_database("db1").unwrap(), after_first);
    assert_eq!(env.counter(&cluster_id), "1");
    assert_eq!(env.sql.databases(&host), databases);
}

#[tokio::test]
async fn teardown_of_unknown_installation_is_a_no_op() {
    let env = TestEnv::new();
    env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.database(DatabaseType::MysqlAurora)
        .teardown("inst-z", false)
        .await
        .unwrap();
    assert_eq!(env.registry.mutation_count(), 0);
    assert_eq!(env.cloud.tag_writes(), 0);
}

#[rstest]
#[case::count(CounterMode::Count, "4")]
#[case::weighted(CounterMode::Weighted, "3")]
#[tokio::test]
async fn counter_follows_membership(#[case] mode: CounterMode, #[case] expected: &str) {
    let env = TestEnv::with_config(Config {
        counter_mode: mode,
        ..Config::default()
    });
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    let database = env.database(DatabaseType::MysqlAurora);
    let installations = ["inst-a", "inst-b", "inst-c", "inst-d"];
    for installation_id in installations {
        env.add_installation(installation_id);
        env.registry
            .set_installation_state(installation_id, "hibernating");
        database.provision(installation_id).await.unwrap();
    }
    // 4 installations weighing 0.75 each.
    assert_eq!(env.counter(&cluster_id), expected);

    for installation_id in installations {
        database.teardown(installation_id, false).await.unwrap();
    }
    assert_eq!(env.counter(&cluster_id), "0");
    assert!(env.members("db1").is_empty());
}

#[tokio::test]
async fn capacity_limit_is_enforced() {
    let mut config = Config::default();
    config.limits.mysql = 2;
    let env = TestEnv::with_config(config);
    let first = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    let second = env.add_shared_cluster("db2", DatabaseType::MysqlAurora);
    let database = env.database(DatabaseType::MysqlAurora);

    for installation_id in ["inst-1", "inst-2", "inst-3", "inst-4", "inst-5"] {
        env.add_installation(installation_id);
    }
    for installation_id in ["inst-1", "inst-2", "inst-3", "inst-4"] {
        database.provision(installation_id).await.unwrap();
    }
    // The fuller cluster is filled first.
    assert_eq!(env.members("db1"), vec!["inst-1", "inst-2"]);
    assert_eq!(env.members("db2"), vec!["inst-3", "inst-4"]);
    assert_eq!(env.counter(&first), "2");
    assert_eq!(env.counter(&second), "2");

    let err = database.provision("inst-5").await.unwrap_err();
    assert!(matches!(err, PlacementError::CapacityExhausted { .. }), "{err}");
    assert!(env.secrets.get("rds-multitenant-inst-5").is_none());
}

#[tokio::test]
async fn cluster_with_counter_at_limit_is_not_discovered() {
    let mut config = Config::default();
    config.limits.mysql = 3;
    let env = TestEnv::with_config(config);
    let full = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.cloud.set_tag(&full, "Counter", "3");
    let broken = env.add_shared_cluster("db2", DatabaseType::MysqlAurora);
    env.cloud.set_tag(&broken, "Counter", "lots");
    env.add_installation("inst-a");

    let err = env
        .database(DatabaseType::MysqlAurora)
        .provision("inst-a")
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::CapacityExhausted { .. }), "{err}");
    assert!(env.registry.peek_multitenant_databases().is_empty());
}

#[tokio::test]
async fn clusters_of_other_types_and_vpcs_are_ignored() {
    let env = TestEnv::new();
    env.add_shared_cluster("pg", DatabaseType::PostgresAurora);
    env.cloud
        .add_cluster("elsewhere", "vpc-other", DatabaseType::MysqlAurora);
    env.add_installation("inst-a");

    let err = env
        .database(DatabaseType::MysqlAurora)
        .provision("inst-a")
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::CapacityExhausted { .. }), "{err}");
}

#[tokio::test]
async fn locked_candidate_is_skipped() {
    let env = TestEnv::new();
    env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.add_shared_cluster("db2", DatabaseType::MysqlAurora);
    env.add_installation("inst-a");
    env.add_installation("inst-b");
    let database = env.database(DatabaseType::MysqlAurora);
    database.provision("inst-a").await.unwrap();
    assert_eq!(env.members("db1"), vec!["inst-a"]);

    // Another controller holds the fuller cluster.
    assert!(env
        .registry
        .lock_multitenant_database("db1", "other-controller")
        .await
        .unwrap());
    database.provision("inst-b").await.unwrap();
    assert_eq!(env.members("db2"), vec!["inst-b"]);
    assert!(env.registry.peek_multitenant_database("db1").unwrap().is_locked());
}

#[tokio::test]
async fn unavailable_candidate_is_skipped() {
    let env = TestEnv::new();
    let first = env.add_shared_cluster("db1", DatabaseType::PostgresAurora);
    env.add_shared_cluster("db2", DatabaseType::PostgresAurora);
    env.add_installation("inst-a");
    env.cloud.set_status(&first, "modifying");

    env.database(DatabaseType::PostgresAurora)
        .provision("inst-a")
        .await
        .unwrap();
    assert!(env.members("db1").is_empty());
    assert_eq!(env.members("db2"), vec!["inst-a"]);
    assert!(!env.registry.peek_multitenant_database("db1").unwrap().is_locked());
}

#[tokio::test]
async fn cluster_with_unavailable_endpoints_is_not_registered() {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.cloud.set_endpoint_status(&cluster_id, "creating");
    env.add_installation("inst-a");

    let err = env
        .database(DatabaseType::MysqlAurora)
        .provision("inst-a")
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::CapacityExhausted { .. }), "{err}");
    assert!(env.registry.peek_multitenant_database("db1").is_none());
}

#[tokio::test]
async fn contention_on_assigned_cluster_fails_outward() {
    let env = TestEnv::new();
    env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.add_shared_cluster("db2", DatabaseType::MysqlAurora);
    env.add_installation("inst-a");
    let database = env.database(DatabaseType::MysqlAurora);
    database.provision("inst-a").await.unwrap();

    env.registry
        .lock_multitenant_database("db1", "other-controller")
        .await
        .unwrap();
    let err = database.teardown("inst-a", false).await.unwrap_err();
    assert!(matches!(err, PlacementError::LockContention(_)), "{err}");
    let err = database.provision("inst-a").await.unwrap_err();
    assert!(matches!(err, PlacementError::LockContention(_)), "{err}");
    assert_eq!(env.members("db1"), vec!["inst-a"]);
    assert!(env.members("db2").is_empty());
}

#[rstest]
#[case::mysql(DatabaseType::MysqlAurora, "CREATE USER")]
#[case::postgres(DatabaseType::PostgresAurora, "CREATE ROLE")]
#[case::pgbouncer(DatabaseType::PostgresPgbouncerAurora, "CREATE ROLE \"id_")]
#[tokio::test]
async fn user_creation_errors_do_not_leak_passwords(
    #[case] database_type: DatabaseType,
    #[case] statement: &str,
) {
    let env = TestEnv::new();
    env.add_shared_cluster("db1", database_type);
    env.add_installation("inst-a");
    env.sql.fail_statements_containing(statement, 1);

    let err = env.database(database_type).provision("inst-a").await.unwrap_err();
    let password = env.installation_password("inst-a");
    assert!(!password.is_empty());
    let message = format!("{err} {err:?}");
    assert!(!message.contains(&password), "{message}");
    assert!(message.contains("driver error suppressed"), "{message}");
    assert!(env.members("db1").is_empty());
    assert_eq!(env.sql.open_connections(), 0);
}

#[tokio::test]
async fn counter_is_rolled_back_when_membership_removal_fails() {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.add_installation("inst-a");
    env.add_installation("inst-b");
    let database = env.database(DatabaseType::MysqlAurora);
    database.provision("inst-a").await.unwrap();
    database.provision("inst-b").await.unwrap();

    env.registry
        .fail_next(RegistryOperation::RemoveInstallationId, 1);
    let err = database.teardown("inst-a", false).await.unwrap_err();
    assert!(matches!(err, PlacementError::Registry { .. }), "{err}");
    assert_eq!(env.members("db1"), vec!["inst-a", "inst-b"]);
    assert_eq!(env.counter(&cluster_id), "2");
    assert!(!env.registry.peek_multitenant_database("db1").unwrap().is_locked());

    database.teardown("inst-a", false).await.unwrap();
    assert_eq!(env.members("db1"), vec!["inst-b"]);
    assert_eq!(env.counter(&cluster_id), "1");
}

#[tokio::test]
async fn installation_must_run_on_exactly_one_cluster() {
    let env = TestEnv::new();
    env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    let database = env.database(DatabaseType::MysqlAurora);

    let err = database.provision("inst-a").await.unwrap_err();
    assert!(matches!(err, PlacementError::InvalidInstallation(_)), "{err}");

    env.add_installation("inst-a");
    env.registry.add_cluster_installation(ClusterInstallation {
        id: "ci-second".to_string(),
        cluster_id: "workload-2".to_string(),
        installation_id: "inst-a".to_string(),
    });
    let err = database.provision("inst-a").await.unwrap_err();
    assert!(matches!(err, PlacementError::InvalidInstallation(_)), "{err}");
    assert!(env.registry.peek_multitenant_databases().is_empty());
}

#[rstest]
#[case("")]
#[case("Inst-A")]
#[case("inst;drop")]
#[case("an-installation-id-that-is-too-long")]
#[tokio::test]
async fn malformed_installation_ids_are_rejected(#[case] installation_id: &str) {
    let env = TestEnv::new();
    env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    let err = env
        .database(DatabaseType::MysqlAurora)
        .provision(installation_id)
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::InvalidInstallation(_)), "{err}");
}

#[tokio::test]
async fn installation_cannot_be_placed_on_two_database_types() {
    let env = TestEnv::new();
    env.add_shared_cluster("my", DatabaseType::MysqlAurora);
    env.add_shared_cluster("pg", DatabaseType::PostgresAurora);
    env.add_installation("inst-a");
    env.database(DatabaseType::MysqlAurora)
        .provision("inst-a")
        .await
        .unwrap();

    let err = env
        .database(DatabaseType::PostgresAurora)
        .provision("inst-a")
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::InvalidInstallation(_)), "{err}");
    assert!(env.registry.peek_multitenant_database("pg").is_none());
}

#[rstest]
#[case::mysql(DatabaseType::MysqlAurora, true)]
#[case::postgres(DatabaseType::PostgresAurora, true)]
#[case::pgbouncer(DatabaseType::PostgresPgbouncerAurora, false)]
#[tokio::test]
async fn database_secret_exposes_connection_strings(
    #[case] database_type: DatabaseType,
    #[case] has_check_url: bool,
) {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", database_type);
    env.add_installation("inst-a");
    let database = env.database(database_type);

    let err = database.generate_database_secret("inst-a").await.unwrap_err();
    assert!(matches!(err, PlacementError::NotAssigned(_)), "{err}");

    database.provision("inst-a").await.unwrap();
    let secret = database.generate_database_secret("inst-a").await.unwrap();
    assert_eq!(secret.metadata.name.as_deref(), Some("inst-a-rds-value"));
    let data = secret.string_data.unwrap();
    let password = env.installation_password("inst-a");
    assert!(data[DB_CONNECTION_STRING].contains(&password));
    assert!(data.contains_key(DB_READ_REPLICAS));
    assert_eq!(data.contains_key(DB_CONNECTION_CHECK_URL), has_check_url);
    if database_type.is_proxied() {
        assert!(data[DB_CONNECTION_STRING].contains(&env.ctx.config().pgbouncer.host));
    } else {
        assert!(data[DB_CONNECTION_STRING].contains(&writer_endpoint(&cluster_id)));
    }
}

#[tokio::test]
async fn resource_metadata_refresh_persists_new_endpoints() {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::PostgresAurora);
    env.add_installation("inst-a");
    let database = env.database(DatabaseType::PostgresAurora);
    database.provision("inst-a").await.unwrap();

    env.cloud
        .set_endpoints(&cluster_id, "writer.new.example", "reader.new.example");
    database.refresh_resource_metadata("inst-a").await.unwrap();
    let record = env.registry.peek_multitenant_database("db1").unwrap();
    assert_eq!(record.writer_endpoint, "writer.new.example");
    assert_eq!(record.reader_endpoint, "reader.new.example");
    assert!(!record.is_locked());
}

#[tokio::test]
async fn snapshots_are_unsupported() {
    let env = TestEnv::new();
    for database_type in DatabaseType::ALL {
        let err = env.database(database_type).snapshot("inst-a").await.unwrap_err();
        assert!(matches!(err, PlacementError::Unsupported(_)), "{err}");
    }
}

/// Two MySQL clusters with `inst-a` provisioned on `db1`. Returns both cluster IDs.
async fn migration_env() -> (TestEnv, String, String) {
    let env = TestEnv::new();
    let source = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    let destination = env.add_shared_cluster("db2", DatabaseType::MysqlAurora);
    env.add_installation("inst-a");
    env.database(DatabaseType::MysqlAurora)
        .provision("inst-a")
        .await
        .unwrap();
    assert_eq!(env.members("db1"), vec!["inst-a"]);
    (env, source, destination)
}

#[tokio::test]
async fn migrated_data_is_kept_until_teardown_migrated() {
    let (env, source, destination) = migration_env().await;
    let database = env.database(DatabaseType::MysqlAurora);
    let migration = migration(
        "inst-a",
        ("db1", DatabaseType::MysqlAurora),
        ("db2", DatabaseType::MysqlAurora),
    );
    let password = env.installation_password("inst-a");

    database.migrate_out(&migration).await.unwrap();
    let record = env.registry.peek_multitenant_database("db1").unwrap();
    assert!(record.installations.is_empty());
    assert!(record.migrated_installations.contains("inst-a"));
    assert_eq!(env.counter(&source), "0");
    assert!(env.sql.has_database(&writer_endpoint(&source), "cloud_inst-a"));

    // Repeating is harmless.
    database.migrate_out(&migration).await.unwrap();

    database.migrate_to(&migration).await.unwrap();
    assert_eq!(env.members("db2"), vec!["inst-a"]);
    assert_eq!(env.counter(&destination), "1");
    let destination_host = writer_endpoint(&destination);
    assert!(env.sql.has_database(&destination_host, "cloud_inst-a"));
    assert_eq!(
        env.sql.user_password(&destination_host, "user_inst-a"),
        Some(password.clone())
    );
    assert_eq!(env.installation_password("inst-a"), password);
    assert!(env.sql.has_database(&writer_endpoint(&source), "cloud_inst-a"));

    let secret = database.generate_database_secret("inst-a").await.unwrap();
    assert!(secret.string_data.unwrap()[DB_CONNECTION_STRING].contains(&destination_host));

    database.teardown_migrated(&migration).await.unwrap();
    let record = env.registry.peek_multitenant_database("db1").unwrap();
    assert!(record.migrated_installations.is_empty());
    assert!(!env.sql.has_database(&writer_endpoint(&source), "cloud_inst-a"));
    assert!(!env.sql.has_user(&writer_endpoint(&source), "user_inst-a"));
    assert!(env.sql.has_database(&destination_host, "cloud_inst-a"));
    assert!(env.secrets.get("rds-multitenant-inst-a").is_some());

    // Nothing left to tear down.
    database.teardown_migrated(&migration).await.unwrap();
}

#[tokio::test]
async fn migrate_to_requires_the_installation_to_leave_its_source() {
    let (env, _, _) = migration_env().await;
    let migration = migration(
        "inst-a",
        ("db1", DatabaseType::MysqlAurora),
        ("db2", DatabaseType::MysqlAurora),
    );
    let err = env
        .database(DatabaseType::MysqlAurora)
        .migrate_to(&migration)
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::InvalidInstallation(_)), "{err}");
    assert!(env.members("db2").is_empty());
}

#[tokio::test]
async fn migrate_to_checks_destination_capacity() {
    let mut config = Config::default();
    config.limits.mysql = 1;
    let env = TestEnv::with_config(config);
    env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.add_shared_cluster("db2", DatabaseType::MysqlAurora);
    env.add_installation("inst-a");
    env.add_installation("inst-b");
    let database = env.database(DatabaseType::MysqlAurora);
    database.provision("inst-a").await.unwrap();
    database.provision("inst-b").await.unwrap();
    assert_eq!(env.members("db2"), vec!["inst-b"]);

    let migration = migration(
        "inst-a",
        ("db1", DatabaseType::MysqlAurora),
        ("db2", DatabaseType::MysqlAurora),
    );
    database.migrate_out(&migration).await.unwrap();
    let err = database.migrate_to(&migration).await.unwrap_err();
    assert!(matches!(err, PlacementError::CapacityExhausted { .. }), "{err}");
    assert_eq!(env.members("db2"), vec!["inst-b"]);
}

#[tokio::test]
async fn rollback_restores_the_source_assignment() {
    let (env, source, destination) = migration_env().await;
    let database = env.database(DatabaseType::MysqlAurora);
    let migration = migration(
        "inst-a",
        ("db1", DatabaseType::MysqlAurora),
        ("db2", DatabaseType::MysqlAurora),
    );
    database.migrate_out(&migration).await.unwrap();
    database.migrate_to(&migration).await.unwrap();

    database.rollback_migration(&migration).await.unwrap();
    let record = env.registry.peek_multitenant_database("db1").unwrap();
    assert_eq!(record.installations.as_slice(), ["inst-a"]);
    assert!(record.migrated_installations.is_empty());
    assert!(env.members("db2").is_empty());
    assert_eq!(env.counter(&source), "1");
    assert_eq!(env.counter(&destination), "0");
    assert!(env.sql.has_database(&writer_endpoint(&source), "cloud_inst-a"));
    assert!(!env.sql.has_database(&writer_endpoint(&destination), "cloud_inst-a"));
    for id in ["db1", "db2"] {
        assert!(!env.registry.peek_multitenant_database(id).unwrap().is_locked());
    }
}

#[tokio::test]
async fn rollback_fails_without_partial_locks_when_contended() {
    let (env, _, _) = migration_env().await;
    let database = env.database(DatabaseType::MysqlAurora);
    let migration = migration(
        "inst-a",
        ("db1", DatabaseType::MysqlAurora),
        ("db2", DatabaseType::MysqlAurora),
    );
    database.migrate_out(&migration).await.unwrap();
    database.migrate_to(&migration).await.unwrap();

    env.registry
        .lock_multitenant_database("db1", "other-controller")
        .await
        .unwrap();
    let err = database.rollback_migration(&migration).await.unwrap_err();
    assert!(matches!(err, PlacementError::LockContention(_)), "{err}");
    // The destination was locked first and has been released again.
    assert!(!env.registry.peek_multitenant_database("db2").unwrap().is_locked());
    assert_eq!(env.members("db2"), vec!["inst-a"]);
}

#[tokio::test]
async fn cross_type_rollback_is_unsupported() {
    let (env, _, _) = migration_env().await;
    env.add_shared_cluster("pg", DatabaseType::PostgresAurora);
    let migration = migration(
        "inst-a",
        ("db1", DatabaseType::MysqlAurora),
        ("pg", DatabaseType::PostgresAurora),
    );
    let mutations = env.registry.mutation_count();
    for database_type in [DatabaseType::MysqlAurora, DatabaseType::PostgresAurora] {
        let err = env
            .database(database_type)
            .rollback_migration(&migration)
            .await
            .unwrap_err();
        assert!(matches!(err, PlacementError::Unsupported(_)), "{err}");
    }
    assert_eq!(env.registry.mutation_count(), mutations);
}

#[tokio::test]
async fn pgbouncer_databases_do_not_migrate() {
    let env = TestEnv::new();
    let database = env.database(DatabaseType::PostgresPgbouncerAurora);
    let migration = migration(
        "inst-a",
        ("db1", DatabaseType::PostgresPgbouncerAurora),
        ("db2", DatabaseType::PostgresPgbouncerAurora),
    );
    for result in [
        database.migrate_out(&migration).await,
        database.migrate_to(&migration).await,
        database.teardown_migrated(&migration).await,
        database.rollback_migration(&migration).await,
    ] {
        assert!(matches!(result, Err(PlacementError::Unsupported(_))));
    }
}

#[tokio::test]
async fn pgbouncer_provision_sets_up_cluster_and_schemas() {
    let mut config = Config::default();
    config.max_installations_per_logical_database = 2;
    let env = TestEnv::with_config(config);
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::PostgresPgbouncerAurora);
    let host = writer_endpoint(&cluster_id);
    let database = env.database(DatabaseType::PostgresPgbouncerAurora);
    for installation_id in ["inst-a", "inst-b", "inst-c"] {
        env.add_installation(installation_id);
        database.provision(installation_id).await.unwrap();
    }

    let record = env.registry.peek_multitenant_database("db1").unwrap();
    assert_eq!(record.state, MultitenantDatabaseState::Stable);
    assert_eq!(env.counter(&cluster_id), "3");

    // Cluster-wide auth objects.
    let auth_secret = env
        .secrets
        .get(&naming::pgbouncer_auth_secret_name(VPC))
        .unwrap();
    assert_eq!(auth_secret.master_username, "pgbouncer");
    assert_eq!(
        env.sql.user_password(&host, "pgbouncer"),
        Some(auth_secret.master_password)
    );
    assert!(env.sql.has_schema(&host, "postgres", "pgbouncer"));
    assert!(env.sql.has_table(&host, "postgres", "pgbouncer.pgbouncer_users"));
    assert!(env.sql.has_function(&host, "pgbouncer.get_auth"));

    // Two schemas per logical database.
    let logical_databases = env
        .registry
        .get_logical_databases(&LogicalDatabaseFilter {
            multitenant_database_id: Some("db1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(logical_databases.len(), 2);
    for logical_database in &logical_databases {
        assert!(env.sql.has_database(&host, &logical_database.name));
        let settings = env.sql.database_settings(&host, &logical_database.name);
        assert!(settings.iter().any(|s| s.starts_with("default_text_search_config")));
        assert!(settings.iter().any(|s| s.starts_with("search_path")));
    }

    for installation_id in ["inst-a", "inst-b", "inst-c"] {
        let schema = env
            .registry
            .get_database_schema_for_installation(installation_id)
            .await
            .unwrap()
            .unwrap();
        let logical_database = logical_databases
            .iter()
            .find(|l| l.id == schema.logical_database_id)
            .unwrap();
        let username = naming::pgbouncer_username(installation_id);
        let password = env.installation_password(installation_id);
        assert!(env.sql.has_schema(&host, &logical_database.name, &schema.name));
        assert!(env.sql.has_user(&host, &username));
        assert_eq!(
            env.sql.auth_row(&host, &username),
            Some(postgres_protocol::password::md5(password.as_bytes(), &username))
        );
    }
    let first_schemas = env
        .registry
        .get_database_schemas(&DatabaseSchemaFilter {
            logical_database_id: Some(logical_databases[0].id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first_schemas.len(), 2);
    assert_eq!(env.sql.open_connections(), 0);
}

#[tokio::test]
async fn pgbouncer_reprovision_reuses_schema() {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::PostgresPgbouncerAurora);
    env.add_installation("inst-a");
    let database = env.database(DatabaseType::PostgresPgbouncerAurora);
    database.provision("inst-a").await.unwrap();
    let schema = env
        .registry
        .get_database_schema_for_installation("inst-a")
        .await
        .unwrap()
        .unwrap();

    database.provision("inst-a").await.unwrap();
    let again = env
        .registry
        .get_database_schema_for_installation("inst-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, schema.id);
    assert_eq!(env.counter(&cluster_id), "1");
}

#[tokio::test]
async fn pgbouncer_teardown_removes_installation_objects() {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::PostgresPgbouncerAurora);
    let host = writer_endpoint(&cluster_id);
    let database = env.database(DatabaseType::PostgresPgbouncerAurora);
    for installation_id in ["inst-a", "inst-b"] {
        env.add_installation(installation_id);
        database.provision(installation_id).await.unwrap();
    }
    let schema = env
        .registry
        .get_database_schema_for_installation("inst-a")
        .await
        .unwrap()
        .unwrap();
    let logical_database = env
        .registry
        .get_logical_database(&schema.logical_database_id)
        .await
        .unwrap()
        .unwrap();

    database.teardown("inst-a", false).await.unwrap();
    assert!(!env.sql.has_schema(&host, &logical_database.name, "id_inst-a"));
    assert!(!env.sql.has_user(&host, "id_inst-a"));
    assert!(env.sql.auth_row(&host, "id_inst-a").is_none());
    assert!(env.secrets.get("rds-multitenant-inst-a").is_none());
    assert!(env
        .registry
        .get_database_schema_for_installation("inst-a")
        .await
        .unwrap()
        .is_none());
    assert_eq!(env.members("db1"), vec!["inst-b"]);
    assert_eq!(env.counter(&cluster_id), "1");

    // The shared logical database and the other installation are untouched.
    assert!(env.sql.has_database(&host, &logical_database.name));
    assert!(env.sql.has_schema(&host, &logical_database.name, "id_inst-b"));
    assert!(env.sql.auth_row(&host, "id_inst-b").is_some());

    database.teardown("inst-a", false).await.unwrap();
    assert_eq!(env.members("db1"), vec!["inst-b"]);
}

fn holders(env: &TestEnv, installation_id: &str) -> Vec<String> {
    env.registry
        .peek_multitenant_databases()
        .into_iter()
        .filter(|db| db.installations.contains(installation_id))
        .map(|db| db.id)
        .collect()
}

#[tokio::test]
async fn concurrent_provisions_of_one_installation_assign_it_once() {
    let env = TestEnv::new();
    let clusters = [
        ("db1", env.add_shared_cluster("db1", DatabaseType::MysqlAurora)),
        ("db2", env.add_shared_cluster("db2", DatabaseType::MysqlAurora)),
    ];
    env.add_installation("inst-seed");
    env.add_installation("inst-a");
    let first = env.database(DatabaseType::MysqlAurora);
    let second = env.database(DatabaseType::MysqlAurora);
    // Registers both clusters and makes db1 the fuller one, so the loser of db1's lock
    // moves on to db2.
    first.provision("inst-seed").await.unwrap();

    let (a, b) = tokio::join!(first.provision("inst-a"), second.provision("inst-a"));
    let lost = match (a, b) {
        (Ok(()), Err(e)) | (Err(e), Ok(())) => e,
        (a, b) => panic!("expected exactly one provision to succeed, got {a:?} and {b:?}"),
    };
    assert!(matches!(lost, PlacementError::ConcurrentAssignment { .. }), "{lost}");

    let assigned = holders(&env, "inst-a");
    assert_eq!(assigned.len(), 1, "inst-a is active on {assigned:?}");
    let database_name = naming::database_name("inst-a");
    for (database_id, cluster_id) in &clusters {
        let record = env.registry.peek_multitenant_database(database_id).unwrap();
        assert!(!record.is_locked());
        assert_eq!(env.counter(cluster_id), record.installations.len().to_string());
        // The losing side dropped what it created.
        assert_eq!(
            env.sql.has_database(&writer_endpoint(cluster_id), &database_name),
            assigned[0] == *database_id
        );
    }

    // A retry of the losing call finds the assignment.
    second.provision("inst-a").await.unwrap();
    assert_eq!(holders(&env, "inst-a"), assigned);
}

#[tokio::test]
async fn contending_provisions_on_one_cluster_take_turns() {
    let env = TestEnv::new();
    let cluster_id = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    env.add_installation("inst-a");
    env.add_installation("inst-b");
    let first = env.database(DatabaseType::MysqlAurora);
    let second = env.database(DatabaseType::MysqlAurora);

    let (a, b) = tokio::join!(first.provision("inst-a"), second.provision("inst-b"));
    assert!(a.is_ok() || b.is_ok());
    let mut provisioned = Vec::new();
    for (installation_id, result) in [("inst-a", a), ("inst-b", b)] {
        match result {
            Ok(()) => provisioned.push(installation_id),
            // The only candidate was held by the other call.
            Err(e) => assert!(matches!(e, PlacementError::CapacityExhausted { .. }), "{e}"),
        }
    }
    let mut members = env.members("db1");
    members.sort();
    assert_eq!(members, provisioned);
    assert_eq!(env.counter(&cluster_id), provisioned.len().to_string());
    assert!(!env.registry.peek_multitenant_database("db1").unwrap().is_locked());

    for installation_id in ["inst-a", "inst-b"] {
        env.database(DatabaseType::MysqlAurora)
            .provision(installation_id)
            .await
            .unwrap();
    }
    let mut members = env.members("db1");
    members.sort();
    assert_eq!(members, vec!["inst-a", "inst-b"]);
    assert_eq!(env.counter(&cluster_id), "2");
}

#[rstest]
#[case::count(CounterMode::Count, "db2")]
#[case::weighted(CounterMode::Weighted, "db1")]
#[tokio::test]
async fn hibernating_installations_leave_room_when_weighted(
    #[case] mode: CounterMode,
    #[case] expected: &str,
) {
    let mut config = Config {
        counter_mode: mode,
        ..Config::default()
    };
    config.limits.mysql = 4;
    let env = TestEnv::with_config(config);
    let first = env.add_shared_cluster("db1", DatabaseType::MysqlAurora);
    let second = env.add_shared_cluster("db2", DatabaseType::MysqlAurora);
    let database = env.database(DatabaseType::MysqlAurora);

    let hibernating = ["inst-a", "inst-b", "inst-c", "inst-d"];
    for installation_id in hibernating {
        env.add_installation(installation_id);
        env.registry
            .set_installation_state(installation_id, "hibernating");
        database.provision(installation_id).await.unwrap();
    }
    assert_eq!(env.members("db1"), hibernating);

    // Four members weighing 3 in total still leave room for one more.
    env.add_installation("inst-e");
    database.provision("inst-e").await.unwrap();
    assert!(env.members(expected).contains(&"inst-e".to_string()));

    if mode == CounterMode::Weighted {
        assert_eq!(env.counter(&first), "4");
        env.add_installation("inst-f");
        database.provision("inst-f").await.unwrap();
        assert_eq!(env.members("db2"), vec!["inst-f"]);
        assert_eq!(env.counter(&second), "1");
    }
}
