use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use aws_config::BehaviorVersion;
use clap::{Args, Parser, Subcommand};
use database_api::models::{DatabaseMigration, DatabaseType, MigrationTarget};
use database_controller::cloud::aws::AwsResourceDirectory;
use database_controller::config::Config;
use database_controller::context::{Collaborators, Context};
use database_controller::logging::{self, LogFormat};
use database_controller::metrics::preinitialize_metrics;
use database_controller::multitenant::installation_database;
use database_controller::registry::PostgresRegistry;
use database_controller::secrets::aws::AwsSecretStore;
use database_controller::sql::EngineConnector;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help(true))]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// URL of the registry database, like postgresql://localhost:5432/cloud.
    /// Overrides `registry_database_url` from the config file.
    #[arg(long, env = "DATABASE_CONTROLLER_REGISTRY_URL")]
    registry_database_url: Option<String>,

    /// One of plain, json, test. Overrides `log_format` from the config file.
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place an installation on a shared cluster and create its database.
    Provision(InstallationArgs),
    /// Remove an installation's database from its shared cluster.
    Teardown {
        #[command(flatten)]
        installation: InstallationArgs,
        /// Leave the database, user and secret in place.
        #[arg(long)]
        keep_data: bool,
    },
    /// Print the Kubernetes secret with the installation's connection strings as JSON.
    GenerateSecret(InstallationArgs),
    /// Re-read the cluster endpoints of an installation's shared cluster.
    RefreshMetadata(InstallationArgs),
    /// Move an installation into the migrated set of its source cluster.
    MigrateOut(MigrationArgs),
    /// Assign an installation to the destination cluster and create its database there.
    MigrateTo(MigrationArgs),
    /// Drop the installation's data left behind on the source cluster.
    TeardownMigrated(MigrationArgs),
    /// Make the source cluster active again and drop the destination copy.
    RollbackMigration(MigrationArgs),
    /// Create the registry tables owned by the controller.
    MigrateRegistry,
}

#[derive(Args)]
struct InstallationArgs {
    /// multitenant-rds, multitenant-rds-postgres or multitenant-rds-postgres-pgbouncer
    #[arg(long)]
    database_type: DatabaseType,
    installation_id: String,
}

#[derive(Args)]
struct MigrationArgs {
    installation_id: String,
    #[arg(long)]
    source_database_id: String,
    #[arg(long)]
    source_database_type: DatabaseType,
    #[arg(long)]
    destination_database_id: String,
    #[arg(long)]
    destination_database_type: DatabaseType,
}

impl MigrationArgs {
    fn to_migration(&self) -> DatabaseMigration {
        DatabaseMigration {
            installation_id: self.installation_id.clone(),
            source: MigrationTarget {
                database_type: self.source_database_type,
                multitenant_database_id: self.source_database_id.clone(),
            },
            destination: MigrationTarget {
                database_type: self.destination_database_type,
                multitenant_database_id: self.destination_database_id.clone(),
            },
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(url) = &args.registry_database_url {
        config.registry_database_url = Some(url.clone());
    }
    if let Some(log_format) = &args.log_format {
        config.log_format = LogFormat::from_config(log_format)?;
    }

    logging::init(config.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async_main(args.command, config))
}

async fn async_main(command: Command, config: Config) -> anyhow::Result<()> {
    preinitialize_metrics();
    tracing::info!(
        "starting database controller {} as {}",
        env!("CARGO_PKG_VERSION"),
        config.instance_id
    );

    let registry_url = config
        .registry_database_url
        .clone()
        .context("a registry database URL is required, set registry_database_url or --registry-database-url")?;
    let registry = Arc::new(
        PostgresRegistry::connect(&registry_url)
            .await
            .context("failed to connect to the registry")?,
    );

    if let Command::MigrateRegistry = command {
        registry.migrate().await?;
        tracing::info!("registry tables are up to date");
        return Ok(());
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &config.aws_region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    let sdk_config = loader.load().await;

    let ctx = Context::new(
        Collaborators {
            registry,
            directory: Arc::new(AwsResourceDirectory::new(&sdk_config)),
            secrets: Arc::new(AwsSecretStore::new(&sdk_config)),
            connector: Arc::new(EngineConnector::new()?),
        },
        config,
    );

    match command {
        Command::Provision(args) => {
            installation_database(ctx, args.database_type)
                .provision(&args.installation_id)
                .await?
        }
        Command::Teardown {
            installation,
            keep_data,
        } => {
            installation_database(ctx, installation.database_type)
                .teardown(&installation.installation_id, keep_data)
                .await?
        }
        Command::GenerateSecret(args) => {
            let secret = installation_database(ctx, args.database_type)
                .generate_database_secret(&args.installation_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&secret)?);
        }
        Command::RefreshMetadata(args) => {
            installation_database(ctx, args.database_type)
                .refresh_resource_metadata(&args.installation_id)
                .await?
        }
        Command::MigrateOut(args) => {
            installation_database(ctx, args.source_database_type)
                .migrate_out(&args.to_migration())
                .await?
        }
        Command::MigrateTo(args) => {
            installation_database(ctx, args.destination_database_type)
                .migrate_to(&args.to_migration())
                .await?
        }
        Command::TeardownMigrated(args) => {
            installation_database(ctx, args.source_database_type)
                .teardown_migrated(&args.to_migration())
                .await?
        }
        Command::RollbackMigration(args) => {
            installation_database(ctx, args.destination_database_type)
                .rollback_migration(&args.to_migration())
                .await?
        }
        Command::MigrateRegistry => {}
    }
    Ok(())
}
