//! Cloud tag contract. Clusters created by the infrastructure tooling carry these tags,
//! and the controller relies on them to find shared clusters before the registry knows
//! about them.

pub const DATABASE_TYPE_TAG_KEY: &str = "DatabaseType";
pub const DATABASE_TYPE_MYSQL: &str = "multitenant-rds";
pub const DATABASE_TYPE_POSTGRES: &str = "multitenant-rds-postgres";
pub const DATABASE_TYPE_POSTGRES_PGBOUNCER: &str = "multitenant-rds-postgres-pgbouncer";

pub const VPC_ID_TAG_KEY: &str = "VpcID";

pub const PURPOSE_TAG_KEY: &str = "Purpose";
pub const PURPOSE_TAG_VALUE: &str = "provisioning";

pub const OWNER_TAG_KEY: &str = "Owner";
pub const OWNER_TAG_VALUE: &str = "platform-team";

pub const TERRAFORM_TAG_KEY: &str = "Terraform";
pub const TERRAFORM_TAG_VALUE: &str = "true";

/// Holds the decimal installation count (or ceiling of weight) of a cluster.
pub const COUNTER_TAG_KEY: &str = "Counter";

/// Registry ID of the cluster.
pub const MULTITENANT_DATABASE_ID_TAG_KEY: &str = "MultitenantDatabaseID";

/// Tagged onto a VPC once a workload cluster has claimed it.
pub const CLOUD_CLUSTER_ID_TAG_KEY: &str = "CloudClusterID";

pub const RDS_CLUSTER_RESOURCE_TYPE: &str = "rds:cluster";
pub const VPC_RESOURCE_TYPE: &str = "ec2:vpc";

/// Only clusters whose ARN contains this marker are placement candidates.
pub const MULTITENANT_CLUSTER_ARN_MARKER: &str = "cluster:rds-cluster-multitenant";

/// Set on installation secrets so that they can be traced back to their owner.
pub const INSTALLATION_ID_TAG_KEY: &str = "InstallationID";
