use async_trait::async_trait;
use database_api::models::{
    ClusterInstallation, DatabaseSchema, DatabaseSchemaFilter, InstallationIds, LogicalDatabase,
    LogicalDatabaseFilter, MultitenantDatabase, MultitenantDatabaseFilter,
    database_weight_for_state,
};
use futures::future::BoxFuture;
use postgres_native_tls::MakeTlsConnector;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Row};

use super::{
    DATABASE_SCHEMA, LOGICAL_DATABASE, MULTITENANT_DATABASE, Registry, RegistryError,
    RegistryOperation, now_millis,
};
use crate::metrics::{REGISTRY_OPERATION_ERRORS, REGISTRY_OPERATION_LATENCY};

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS multitenant_database (
    id TEXT PRIMARY KEY,
    rds_cluster_id TEXT NOT NULL,
    vpc_id TEXT NOT NULL,
    database_type TEXT NOT NULL,
    state TEXT NOT NULL,
    installations TEXT NOT NULL DEFAULT '[]',
    migrated_installations TEXT NOT NULL DEFAULT '[]',
    writer_endpoint TEXT NOT NULL DEFAULT '',
    reader_endpoint TEXT NOT NULL DEFAULT '',
    max_installations_per_logical_database BIGINT NOT NULL DEFAULT 0,
    create_at BIGINT NOT NULL,
    delete_at BIGINT NOT NULL DEFAULT 0,
    lock_acquired_by TEXT,
    lock_acquired_at BIGINT NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS multitenant_database_type_vpc_idx
    ON multitenant_database (database_type, vpc_id);

CREATE TABLE IF NOT EXISTS logical_database (
    id TEXT PRIMARY KEY,
    multitenant_database_id TEXT NOT NULL,
    name TEXT NOT NULL,
    create_at BIGINT NOT NULL,
    delete_at BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS database_schema (
    id TEXT PRIMARY KEY,
    logical_database_id TEXT NOT NULL,
    installation_id TEXT NOT NULL,
    name TEXT NOT NULL,
    create_at BIGINT NOT NULL,
    delete_at BIGINT NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS database_schema_installation_idx
    ON database_schema (installation_id);
"#;

const MULTITENANT_DATABASE_COLUMNS: &str = "id, rds_cluster_id, vpc_id, database_type, state, \
    installations, migrated_installations, writer_endpoint, reader_endpoint, \
    max_installations_per_logical_database, create_at, delete_at, lock_acquired_by, lock_acquired_at";

const LOGICAL_DATABASE_COLUMNS: &str = "id, multitenant_database_id, name, create_at, delete_at";

const DATABASE_SCHEMA_COLUMNS: &str =
    "id, logical_database_id, installation_id, name, create_at, delete_at";

enum QueryError {
    Postgres(tokio_postgres::Error),
    Registry(RegistryError),
}

impl From<tokio_postgres::Error> for QueryError {
    fn from(e: tokio_postgres::Error) -> Self {
        QueryError::Postgres(e)
    }
}

impl From<RegistryError> for QueryError {
    fn from(e: RegistryError) -> Self {
        QueryError::Registry(e)
    }
}

type QueryResult<T> = Result<T, QueryError>;

/// Accumulates `WHERE` clauses with positional parameters.
#[derive(Default)]
struct WhereClause {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl WhereClause {
    /// `template` refers to its parameter as `{}`.
    fn push(&mut self, template: &str, param: Box<dyn ToSql + Sync + Send>) {
        self.params.push(param);
        let placeholder = format!("${}", self.params.len());
        self.clauses.push(template.replace("{}", &placeholder));
    }

    fn push_raw(&mut self, clause: &str) {
        self.clauses.push(clause.to_string());
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    fn params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

fn decode_ids(operation: &str, raw: &str) -> Result<InstallationIds, RegistryError> {
    serde_json::from_str(raw)
        .map_err(|e| RegistryError::Decode(format!("{operation}: installation list: {e}")))
}

fn encode_ids(ids: &InstallationIds) -> Result<String, RegistryError> {
    serde_json::to_string(ids).map_err(|e| RegistryError::Decode(e.to_string()))
}

fn decode_multitenant_database(row: &Row) -> Result<MultitenantDatabase, RegistryError> {
    let id: String = row.get(0);
    let database_type: String = row.get(3);
    let state: String = row.get(4);
    let installations: String = row.get(5);
    let migrated_installations: String = row.get(6);
    Ok(MultitenantDatabase {
        database_type: database_type
            .parse()
            .map_err(|e| RegistryError::Decode(format!("{id}: {e}")))?,
        state: state
            .parse()
            .map_err(|e| RegistryError::Decode(format!("{id}: {e}")))?,
        installations: decode_ids(&id, &installations)?,
        migrated_installations: decode_ids(&id, &migrated_installations)?,
        rds_cluster_id: row.get(1),
        vpc_id: row.get(2),
        writer_endpoint: row.get(7),
        reader_endpoint: row.get(8),
        max_installations_per_logical_database: row.get(9),
        create_at: row.get(10),
        delete_at: row.get(11),
        lock_acquired_by: row.get(12),
        lock_acquired_at: row.get(13),
        id,
    })
}

fn decode_logical_database(row: &Row) -> LogicalDatabase {
    LogicalDatabase {
        id: row.get(0),
        multitenant_database_id: row.get(1),
        name: row.get(2),
        create_at: row.get(3),
        delete_at: row.get(4),
    }
}

fn decode_database_schema(row: &Row) -> DatabaseSchema {
    DatabaseSchema {
        id: row.get(0),
        logical_database_id: row.get(1),
        installation_id: row.get(2),
        name: row.get(3),
        create_at: row.get(4),
        delete_at: row.get(5),
    }
}

/// [`Registry`] stored in Postgres, shared by every controller instance.
///
/// The `installation` and `cluster_installation` tables belong to the wider control plane
/// and are only read here.
pub struct PostgresRegistry {
    database_url: String,
    tls: MakeTlsConnector,
    client: Mutex<Option<Client>>,
}

impl PostgresRegistry {
    pub async fn connect(database_url: &str) -> Result<Self, RegistryError> {
        let connector = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| RegistryError::Connection(e.to_string()))?;
        let registry = Self {
            database_url: database_url.to_string(),
            tls: MakeTlsConnector::new(connector),
            client: Mutex::new(None),
        };
        let client = registry.open_client().await?;
        *registry.client.lock().await = Some(client);
        Ok(registry)
    }

    async fn open_client(&self) -> Result<Client, RegistryError> {
        let (client, connection) = tokio_postgres::connect(&self.database_url, self.tls.clone())
            .await
            .map_err(|e| RegistryError::Connection(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!("registry connection closed: {e}");
            }
        });
        Ok(client)
    }

    /// Create the tables owned by the controller, if missing.
    pub async fn migrate(&self) -> Result<(), RegistryError> {
        self.with_measured_conn(RegistryOperation::Migrate, |client| {
            Box::pin(async move {
                client.batch_execute(MIGRATIONS).await?;
                Ok(())
            })
        })
        .await
    }

    /// Run `func` on the shared connection, reconnecting first if it was lost, and
    /// record latency and errors for `op`.
    async fn with_measured_conn<F, R>(&self, op: RegistryOperation, func: F) -> Result<R, RegistryError>
    where
        F: for<'a> FnOnce(&'a mut Client) -> BoxFuture<'a, QueryResult<R>> + Send,
        R: Send,
    {
        let label = op.to_string();
        let _timer = REGISTRY_OPERATION_LATENCY
            .with_label_values(&[&label])
            .start_timer();

        let res = async {
            let mut guard = self.client.lock().await;
            if guard.as_ref().is_none_or(|c| c.is_closed()) {
                *guard = Some(self.open_client().await?);
            }
            let Some(client) = guard.as_mut() else {
                return Err(RegistryError::Connection("no registry connection".to_string()));
            };
            func(client).await.map_err(|e| match e {
                QueryError::Postgres(e) => RegistryError::Query {
                    operation: op,
                    message: e.to_string(),
                },
                QueryError::Registry(e) => e,
            })
        }
        .await;

        if res.is_err() {
            REGISTRY_OPERATION_ERRORS.with_label_values(&[&label]).inc();
        }
        res
    }

    /// Read-modify-write of one membership column under `SELECT ... FOR UPDATE`.
    async fn modify_membership<M>(
        &self,
        op: RegistryOperation,
        column: &'static str,
        database_id: &str,
        modify: M,
    ) -> Result<InstallationIds, RegistryError>
    where
        M: FnOnce(&mut InstallationIds) + Send + 'static,
    {
        let database_id = database_id.to_string();
        self.with_measured_conn(op, move |client| {
            Box::pin(async move {
                let tx = client.transaction().await?;
                let row = tx
                    .query_opt(
                        &format!("SELECT {column} FROM multitenant_database WHERE id = $1 FOR UPDATE"),
                        &[&database_id],
                    )
                    .await?
                    .ok_or_else(|| RegistryError::NotFound {
                        kind: MULTITENANT_DATABASE,
                        id: database_id.clone(),
                    })?;
                let raw: String = row.get(0);
                let mut ids = decode_ids(&database_id, &raw)?;
                modify(&mut ids);
                tx.execute(
                    &format!("UPDATE multitenant_database SET {column} = $2 WHERE id = $1"),
                    &[&database_id, &encode_ids(&ids)?],
                )
                .await?;
                tx.commit().await?;
                Ok(ids)
            })
        })
        .await
    }
}

async fn query_multitenant_databases(
    client: &Client,
    filter: &MultitenantDatabaseFilter,
) -> QueryResult<Vec<MultitenantDatabase>> {
    let mut w = WhereClause::default();
    if let Some(database_type) = filter.database_type {
        w.push("database_type = {}", Box::new(database_type.to_string()));
    }
    if let Some(vpc_id) = &filter.vpc_id {
        w.push("vpc_id = {}", Box::new(vpc_id.clone()));
    }
    if let Some(installation_id) = &filter.installation_id {
        w.push("installations::jsonb ? {}", Box::new(installation_id.clone()));
    }
    if let Some(installation_id) = &filter.migrated_installation_id {
        w.push(
            "migrated_installations::jsonb ? {}",
            Box::new(installation_id.clone()),
        );
    }
    if let Some(limit) = filter.max_installations_limit {
        w.push(
            "jsonb_array_length(installations::jsonb) < {}",
            Box::new(i32::try_from(limit).unwrap_or(i32::MAX)),
        );
    }
    if !filter.include_deleted {
        w.push_raw("delete_at = 0");
    }
    let query = format!(
        "SELECT {MULTITENANT_DATABASE_COLUMNS} FROM multitenant_database{} ORDER BY create_at, id",
        w.sql()
    );
    let rows = client.query(&query, &w.params()).await?;
    Ok(rows
        .iter()
        .map(decode_multitenant_database)
        .collect::<Result<_, _>>()?)
}

#[async_trait]
impl Registry for PostgresRegistry {
    async fn get_multitenant_database(
        &self,
        id: &str,
    ) -> Result<Option<MultitenantDatabase>, RegistryError> {
        let id = id.to_string();
        self.with_measured_conn(RegistryOperation::GetMultitenantDatabase, move |client| {
            Box::pin(async move {
                let row = client
                    .query_opt(
                        &format!(
                            "SELECT {MULTITENANT_DATABASE_COLUMNS} FROM multitenant_database WHERE id = $1"
                        ),
                        &[&id],
                    )
                    .await?;
                Ok(row.as_ref().map(decode_multitenant_database).transpose()?)
            })
        })
        .await
    }

    async fn get_multitenant_databases(
        &self,
        filter: &MultitenantDatabaseFilter,
    ) -> Result<Vec<MultitenantDatabase>, RegistryError> {
        let filter = filter.clone();
        self.with_measured_conn(RegistryOperation::GetMultitenantDatabases, move |client| {
            Box::pin(async move { query_multitenant_databases(&*client, &filter).await })
        })
        .await
    }

    async fn create_multitenant_database(
        &self,
        database: &mut MultitenantDatabase,
    ) -> Result<(), RegistryError> {
        let mut record = database.clone();
        record.create_at = now_millis();
        record.lock_acquired_by = None;
        record.lock_acquired_at = 0;
        let created = self
            .with_measured_conn(RegistryOperation::CreateMultitenantDatabase, move |client| {
                Box::pin(async move {
                    let inserted = client
                        .execute(
                            &format!(
                                "INSERT INTO multitenant_database ({MULTITENANT_DATABASE_COLUMNS}) \
                                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
                                 ON CONFLICT (id) DO NOTHING"
                            ),
                            &[
                                &record.id,
                                &record.rds_cluster_id,
                                &record.vpc_id,
                                &record.database_type.to_string(),
                                &String::from(record.state),
                                &encode_ids(&record.installations)?,
                                &encode_ids(&record.migrated_installations)?,
                                &record.writer_endpoint,
                                &record.reader_endpoint,
                                &record.max_installations_per_logical_database,
                                &record.create_at,
                                &record.delete_at,
                                &record.lock_acquired_by,
                                &record.lock_acquired_at,
                            ],
                        )
                        .await?;
                    if inserted == 0 {
                        return Err(RegistryError::AlreadyExists {
                            kind: MULTITENANT_DATABASE,
                            id: record.id.clone(),
                        }
                        .into());
                    }
                    Ok(record)
                })
            })
            .await?;
        *database = created;
        Ok(())
    }

    async fn update_multitenant_database(
        &self,
        database: &MultitenantDatabase,
    ) -> Result<(), RegistryError> {
        let record = database.clone();
        self.with_measured_conn(RegistryOperation::UpdateMultitenantDatabase, move |client| {
            Box::pin(async move {
                let updated = client
                    .execute(
                        "UPDATE multitenant_database SET rds_cluster_id = $2, vpc_id = $3, \
                         database_type = $4, state = $5, installations = $6, \
                         migrated_installations = $7, writer_endpoint = $8, reader_endpoint = $9, \
                         max_installations_per_logical_database = $10, delete_at = $11 \
                         WHERE id = $1",
                        &[
                            &record.id,
                            &record.rds_cluster_id,
                            &record.vpc_id,
                            &record.database_type.to_string(),
                            &String::from(record.state),
                            &encode_ids(&record.installations)?,
                            &encode_ids(&record.migrated_installations)?,
                            &record.writer_endpoint,
                            &record.reader_endpoint,
                            &record.max_installations_per_logical_database,
                            &record.delete_at,
                        ],
                    )
                    .await?;
                if updated == 0 {
                    return Err(RegistryError::NotFound {
                        kind: MULTITENANT_DATABASE,
                        id: record.id.clone(),
                    }
                    .into());
                }
                Ok(())
            })
        })
        .await
    }

    async fn lock_multitenant_database(
        &self,
        id: &str,
        holder: &str,
    ) -> Result<bool, RegistryError> {
        let id = id.to_string();
        let holder = holder.to_string();
        self.with_measured_conn(RegistryOperation::LockMultitenantDatabase, move |client| {
            Box::pin(async move {
                let updated = client
                    .execute(
                        "UPDATE multitenant_database SET lock_acquired_by = $2, lock_acquired_at = $3 \
                         WHERE id = $1 AND lock_acquired_at = 0",
                        &[&id, &holder, &now_millis()],
                    )
                    .await?;
                Ok(updated == 1)
            })
        })
        .await
    }

    async fn unlock_multitenant_database(
        &self,
        id: &str,
        holder: &str,
        force: bool,
    ) -> Result<bool, RegistryError> {
        let id = id.to_string();
        let holder = holder.to_string();
        self.with_measured_conn(RegistryOperation::UnlockMultitenantDatabase, move |client| {
            Box::pin(async move {
                let updated = client
                    .execute(
                        "UPDATE multitenant_database SET lock_acquired_by = NULL, lock_acquired_at = 0 \
                         WHERE id = $1 AND lock_acquired_at <> 0 AND (lock_acquired_by = $2 OR $3)",
                        &[&id, &holder, &force],
                    )
                    .await?;
                Ok(updated == 1)
            })
        })
        .await
    }

    async fn add_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError> {
        let installation_id = installation_id.to_string();
        self.modify_membership(
            RegistryOperation::AddInstallationId,
            "installations",
            database_id,
            move |ids| {
                ids.add(&installation_id);
            },
        )
        .await
    }

    async fn remove_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError> {
        let installation_id = installation_id.to_string();
        self.modify_membership(
            RegistryOperation::RemoveInstallationId,
            "installations",
            database_id,
            move |ids| {
                ids.remove(&installation_id);
            },
        )
        .await
    }

    async fn remove_migrated_installation_id(
        &self,
        database_id: &str,
        installation_id: &str,
    ) -> Result<InstallationIds, RegistryError> {
        let installation_id = installation_id.to_string();
        self.modify_membership(
            RegistryOperation::RemoveMigratedInstallationId,
            "migrated_installations",
            database_id,
            move |ids| {
                ids.remove(&installation_id);
            },
        )
        .await
    }

    async fn get_logical_databases(
        &self,
        filter: &LogicalDatabaseFilter,
    ) -> Result<Vec<LogicalDatabase>, RegistryError> {
        let filter = filter.clone();
        self.with_measured_conn(RegistryOperation::GetLogicalDatabases, move |client| {
            Box::pin(async move {
                let mut w = WhereClause::default();
                if let Some(id) = &filter.multitenant_database_id {
                    w.push("multitenant_database_id = {}", Box::new(id.clone()));
                }
                if !filter.include_deleted {
                    w.push_raw("delete_at = 0");
                }
                let query = format!(
                    "SELECT {LOGICAL_DATABASE_COLUMNS} FROM logical_database{} ORDER BY create_at, id",
                    w.sql()
                );
                let rows = client.query(&query, &w.params()).await?;
                Ok(rows.iter().map(decode_logical_database).collect())
            })
        })
        .await
    }

    async fn get_logical_database(
        &self,
        id: &str,
    ) -> Result<Option<LogicalDatabase>, RegistryError> {
        let id = id.to_string();
        self.with_measured_conn(RegistryOperation::GetLogicalDatabase, move |client| {
            Box::pin(async move {
                let row = client
                    .query_opt(
                        &format!("SELECT {LOGICAL_DATABASE_COLUMNS} FROM logical_database WHERE id = $1"),
                        &[&id],
                    )
                    .await?;
                Ok(row.as_ref().map(decode_logical_database))
            })
        })
        .await
    }

    async fn create_logical_database(
        &self,
        logical_database: &mut LogicalDatabase,
    ) -> Result<(), RegistryError> {
        let mut record = logical_database.clone();
        record.create_at = now_millis();
        let created = self
            .with_measured_conn(RegistryOperation::CreateLogicalDatabase, move |client| {
                Box::pin(async move {
                    let inserted = client
                        .execute(
                            &format!(
                                "INSERT INTO logical_database ({LOGICAL_DATABASE_COLUMNS}) \
                                 VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING"
                            ),
                            &[
                                &record.id,
                                &record.multitenant_database_id,
                                &record.name,
                                &record.create_at,
                                &record.delete_at,
                            ],
                        )
                        .await?;
                    if inserted == 0 {
                        return Err(RegistryError::AlreadyExists {
                            kind: LOGICAL_DATABASE,
                            id: record.id.clone(),
                        }
                        .into());
                    }
                    Ok(record)
                })
            })
            .await?;
        *logical_database = created;
        Ok(())
    }

    async fn get_database_schemas(
        &self,
        filter: &DatabaseSchemaFilter,
    ) -> Result<Vec<DatabaseSchema>, RegistryError> {
        let filter = filter.clone();
        self.with_measured_conn(RegistryOperation::GetDatabaseSchemas, move |client| {
            Box::pin(async move {
                let mut w = WhereClause::default();
                if let Some(id) = &filter.logical_database_id {
                    w.push("logical_database_id = {}", Box::new(id.clone()));
                }
                if let Some(id) = &filter.installation_id {
                    w.push("installation_id = {}", Box::new(id.clone()));
                }
                if !filter.include_deleted {
                    w.push_raw("delete_at = 0");
                }
                let query = format!(
                    "SELECT {DATABASE_SCHEMA_COLUMNS} FROM database_schema{} ORDER BY create_at, id",
                    w.sql()
                );
                let rows = client.query(&query, &w.params()).await?;
                Ok(rows.iter().map(decode_database_schema).collect())
            })
        })
        .await
    }

    async fn create_database_schema(
        &self,
        schema: &mut DatabaseSchema,
    ) -> Result<(), RegistryError> {
        let mut record = schema.clone();
        record.create_at = now_millis();
        let created = self
            .with_measured_conn(RegistryOperation::CreateDatabaseSchema, move |client| {
                Box::pin(async move {
                    let inserted = client
                        .execute(
                            &format!(
                                "INSERT INTO database_schema ({DATABASE_SCHEMA_COLUMNS}) \
                                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING"
                            ),
                            &[
                                &record.id,
                                &record.logical_database_id,
                                &record.installation_id,
                                &record.name,
                                &record.create_at,
                                &record.delete_at,
                            ],
                        )
                        .await?;
                    if inserted == 0 {
                        return Err(RegistryError::AlreadyExists {
                            kind: DATABASE_SCHEMA,
                            id: record.id.clone(),
                        }
                        .into());
                    }
                    Ok(record)
                })
            })
            .await?;
        *schema = created;
        Ok(())
    }

    async fn delete_database_schema(&self, id: &str) -> Result<(), RegistryError> {
        let id = id.to_string();
        self.with_measured_conn(RegistryOperation::DeleteDatabaseSchema, move |client| {
            Box::pin(async move {
                let updated = client
                    .execute(
                        "UPDATE database_schema SET delete_at = $2 WHERE id = $1 AND delete_at = 0",
                        &[&id, &now_millis()],
                    )
                    .await?;
                if updated == 0 {
                    let exists = client
                        .query_opt("SELECT 1 FROM database_schema WHERE id = $1", &[&id])
                        .await?
                        .is_some();
                    if !exists {
                        return Err(RegistryError::NotFound {
                            kind: DATABASE_SCHEMA,
                            id: id.clone(),
                        }
                        .into());
                    }
                }
                Ok(())
            })
        })
        .await
    }

    async fn get_cluster_installations(
        &self,
        installation_id: &str,
    ) -> Result<Vec<ClusterInstallation>, RegistryError> {
        let installation_id = installation_id.to_string();
        self.with_measured_conn(RegistryOperation::GetClusterInstallations, move |client| {
            Box::pin(async move {
                let rows = client
                    .query(
                        "SELECT id, cluster_id, installation_id FROM cluster_installation \
                         WHERE installation_id = $1 AND delete_at = 0",
                        &[&installation_id],
                    )
                    .await?;
                Ok(rows
                    .iter()
                    .map(|row| ClusterInstallation {
                        id: row.get(0),
                        cluster_id: row.get(1),
                        installation_id: row.get(2),
                    })
                    .collect())
            })
        })
        .await
    }

    async fn get_installations_total_database_weight(
        &self,
        installation_ids: &[String],
    ) -> Result<f64, RegistryError> {
        let installation_ids = installation_ids.to_vec();
        self.with_measured_conn(
            RegistryOperation::GetInstallationsTotalDatabaseWeight,
            move |client| {
                Box::pin(async move {
                    let rows = client
                        .query(
                            "SELECT id, state FROM installation WHERE id = ANY($1)",
                            &[&installation_ids],
                        )
                        .await?;
                    let states: std::collections::HashMap<String, String> = rows
                        .iter()
                        .map(|row| (row.get(0), row.get(1)))
                        .collect();
                    Ok(installation_ids
                        .iter()
                        .map(|id| database_weight_for_state(states.get(id).map_or("", String::as_str)))
                        .sum())
                })
            },
        )
        .await
    }
}
