//! Names of every object the controller creates on behalf of an installation. These are
//! part of the operational contract with already provisioned clusters: renaming anything
//! here orphans existing databases, users and secrets.

use uuid::Uuid;

use crate::error::PlacementError;

const MAX_INSTALLATION_ID_LEN: usize = 26;

pub const INSTALLATION_SECRET_PREFIX: &str = "rds-multitenant-";
pub const PGBOUNCER_AUTH_USERNAME: &str = "pgbouncer";
pub const PGBOUNCER_AUTH_SCHEMA: &str = "pgbouncer";
pub const PGBOUNCER_USERS_TABLE: &str = "pgbouncer_users";
pub const PGBOUNCER_AUTH_FUNCTION: &str = "get_auth";
/// Cluster-level objects of the PGBouncer overlay live in this database.
pub const PGBOUNCER_ADMIN_DATABASE: &str = "postgres";

/// Installation IDs end up interpolated into identifiers, so they are restricted to a
/// conservative alphabet.
pub fn validate_installation_id(installation_id: &str) -> Result<(), PlacementError> {
    if installation_id.is_empty() || installation_id.len() > MAX_INSTALLATION_ID_LEN {
        return Err(PlacementError::InvalidInstallation(format!(
            "installation ID '{installation_id}' must be 1 to {MAX_INSTALLATION_ID_LEN} characters long"
        )));
    }
    if let Some(c) = installation_id
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '_'))
    {
        return Err(PlacementError::InvalidInstallation(format!(
            "installation ID '{installation_id}' contains invalid character '{c}'"
        )));
    }
    Ok(())
}

/// Database (MySQL) or database (Postgres) holding a non-proxied installation's data.
pub fn database_name(installation_id: &str) -> String {
    format!("cloud_{installation_id}")
}

pub fn database_username(installation_id: &str) -> String {
    format!("user_{installation_id}")
}

/// Schema and role of a proxied installation. Both share the same name so that the
/// role's default `search_path` of `"$user"` resolves to its own schema.
pub fn pgbouncer_schema_name(installation_id: &str) -> String {
    format!("id_{installation_id}")
}

pub fn pgbouncer_username(installation_id: &str) -> String {
    pgbouncer_schema_name(installation_id)
}

pub fn logical_database_name(id: Uuid) -> String {
    format!("cloud_{}", id.simple())
}

pub fn installation_secret_name(installation_id: &str) -> String {
    format!("{INSTALLATION_SECRET_PREFIX}{installation_id}")
}

/// The master credentials of a cluster are stored under the cluster identifier.
pub fn master_secret_name(rds_cluster_id: &str) -> String {
    rds_cluster_id.to_string()
}

pub fn pgbouncer_auth_secret_name(vpc_id: &str) -> String {
    format!("{INSTALLATION_SECRET_PREFIX}pgbouncer-{vpc_id}")
}

pub fn kubernetes_secret_name(installation_id: &str) -> String {
    format!("{installation_id}-rds-value")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installation_id_validation() {
        assert!(validate_installation_id("inst-a").is_ok());
        assert!(validate_installation_id("abcdefghijklmnopqrstuvwxyz").is_ok());
        assert!(validate_installation_id("").is_err());
        assert!(validate_installation_id("abcdefghijklmnopqrstuvwxyz0").is_err());
        assert!(validate_installation_id("Inst").is_err());
        assert!(validate_installation_id("a;drop").is_err());
        assert!(validate_installation_id("a\"b").is_err());
    }

    #[test]
    fn derived_names() {
        assert_eq!(database_name("inst-a"), "cloud_inst-a");
        assert_eq!(database_username("inst-a"), "user_inst-a");
        assert_eq!(pgbouncer_schema_name("inst-a"), "id_inst-a");
        assert_eq!(installation_secret_name("inst-a"), "rds-multitenant-inst-a");
        assert_eq!(
            pgbouncer_auth_secret_name("vpc-1"),
            "rds-multitenant-pgbouncer-vpc-1"
        );
        assert_eq!(kubernetes_secret_name("inst-a"), "inst-a-rds-value");
        let name = logical_database_name(Uuid::nil());
        assert_eq!(name, "cloud_00000000000000000000000000000000");
    }
}
