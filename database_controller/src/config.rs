use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use database_api::models::DatabaseType;
use serde::Deserialize;

use crate::logging::LogFormat;

pub const DEFAULT_SQL_QUERY_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_LOCK_HOLD_ALERT_THRESHOLD: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_INSTALLATIONS_PER_LOGICAL_DATABASE: i64 = 10;
pub const DEFAULT_PGBOUNCER_HOST: &str = "pgbouncer.pgbouncer.svc.cluster.local";
pub const DEFAULT_PGBOUNCER_PORT: u16 = 5432;

/// How the counter tag and capacity checks account for installations.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CounterMode {
    /// Sum of per-installation weights, rounded up. Admission uses the same value, so
    /// hibernating installations leave room for more members than the limit.
    Weighted,
    /// Plain number of assigned installations.
    Count,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CapacityLimits {
    pub mysql: usize,
    pub postgres: usize,
    pub postgres_pgbouncer: usize,
}

impl Default for CapacityLimits {
    fn default() -> Self {
        Self {
            mysql: 10,
            postgres: 300,
            postgres_pgbouncer: 1000,
        }
    }
}

impl CapacityLimits {
    pub fn for_type(&self, database_type: DatabaseType) -> usize {
        match database_type {
            DatabaseType::MysqlAurora => self.mysql,
            DatabaseType::PostgresAurora => self.postgres,
            DatabaseType::PostgresPgbouncerAurora => self.postgres_pgbouncer,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PgbouncerConfig {
    /// In-cluster address of the pooler that installations connect through.
    pub host: String,
    pub port: u16,
}

impl Default for PgbouncerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_PGBOUNCER_HOST.to_string(),
            port: DEFAULT_PGBOUNCER_PORT,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Holder ID written into registry locks. Must be unique per running process.
    pub instance_id: String,
    pub aws_region: Option<String>,
    pub registry_database_url: Option<String>,
    pub counter_mode: CounterMode,
    #[serde(with = "humantime_serde")]
    pub sql_query_timeout: Duration,
    /// Locks held for longer than this are reported at release time.
    #[serde(with = "humantime_serde")]
    pub lock_hold_alert_threshold: Duration,
    pub limits: CapacityLimits,
    pub max_installations_per_logical_database: i64,
    pub pgbouncer: PgbouncerConfig,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            aws_region: None,
            registry_database_url: None,
            counter_mode: CounterMode::Weighted,
            sql_query_timeout: DEFAULT_SQL_QUERY_TIMEOUT,
            lock_hold_alert_threshold: DEFAULT_LOCK_HOLD_ALERT_THRESHOLD,
            limits: CapacityLimits::default(),
            max_installations_per_logical_database:
                DEFAULT_MAX_INSTALLATIONS_PER_LOGICAL_DATABASE,
            pgbouncer: PgbouncerConfig::default(),
            log_format: LogFormat::Plain,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Config> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.instance_id.is_empty(), "instance_id must not be empty");
        anyhow::ensure!(
            !self.sql_query_timeout.is_zero(),
            "sql_query_timeout must be positive"
        );
        anyhow::ensure!(
            self.max_installations_per_logical_database > 0,
            "max_installations_per_logical_database must be positive"
        );
        for database_type in DatabaseType::ALL {
            anyhow::ensure!(
                self.limits.for_type(database_type) > 0,
                "capacity limit for {database_type} must be positive"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.counter_mode, CounterMode::Weighted);
        assert_eq!(config.sql_query_timeout, Duration::from_secs(15));
        assert_eq!(config.limits.for_type(DatabaseType::MysqlAurora), 10);
        assert_eq!(config.limits.for_type(DatabaseType::PostgresAurora), 300);
        assert_eq!(config.pgbouncer.host, DEFAULT_PGBOUNCER_HOST);
        assert!(!config.instance_id.is_empty());
    }

    #[test]
    fn parses_overrides() {
        let config = Config::parse(
            r#"
instance_id = "controller-1"
counter_mode = "count"
sql_query_timeout = "3s"
log_format = "json"

[limits]
postgres_pgbouncer = 50

[pgbouncer]
port = 6432
"#,
        )
        .unwrap();
        assert_eq!(config.instance_id, "controller-1");
        assert_eq!(config.counter_mode, CounterMode::Count);
        assert_eq!(config.sql_query_timeout, Duration::from_secs(3));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.limits.postgres_pgbouncer, 50);
        assert_eq!(config.limits.mysql, 10);
        assert_eq!(config.pgbouncer.port, 6432);
    }

    #[test]
    fn rejects_unknown_and_invalid_fields() {
        assert!(Config::parse("no_such_field = 1").is_err());
        assert!(Config::parse("[limits]\nmysql = 0").is_err());
    }
}
