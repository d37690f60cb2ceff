use std::fmt::Display;

use database_api::models::DatabaseType;

use crate::cloud::CloudError;
use crate::registry::RegistryError;
use crate::secrets::SecretError;
use crate::sql::SqlError;

/// Errors surfaced by the placement engine and the provisioning state machine.
///
/// Capability errors are always wrapped with a context string naming the cluster and
/// installation involved, so that a log line on its own is enough to locate the problem.
#[derive(thiserror::Error, Debug)]
pub enum PlacementError {
    /// No cluster with room was found across all discovery tiers. Safe to retry later.
    #[error(
        "no {database_type} multitenant database with free capacity in vpc {vpc_id} for installation {installation_id}"
    )]
    CapacityExhausted {
        installation_id: String,
        database_type: DatabaseType,
        vpc_id: String,
    },

    #[error("multitenant database {0} is locked by another holder")]
    LockContention(String),

    /// The record changed between selection and locking, or the cluster is not available.
    #[error("multitenant database {database_id} failed validation: {reason}")]
    Validation { database_id: String, reason: String },

    #[error("invalid installation: {0}")]
    InvalidInstallation(String),

    /// Another operation assigned the installation to a different cluster while this one
    /// was placing it. A retry finds that assignment.
    #[error(
        "installation {installation_id} was assigned to multitenant database {database_id} by a concurrent operation"
    )]
    ConcurrentAssignment {
        installation_id: String,
        database_id: String,
    },

    #[error("{0}")]
    NotAssigned(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("{context}: {source}")]
    Registry {
        context: String,
        #[source]
        source: RegistryError,
    },

    #[error("{context}: {source}")]
    Cloud {
        context: String,
        #[source]
        source: CloudError,
    },

    #[error("{context}: {source}")]
    Secret {
        context: String,
        #[source]
        source: SecretError,
    },

    #[error("{context}: {source}")]
    Sql {
        context: String,
        #[source]
        source: SqlError,
    },
}

impl PlacementError {
    /// Lock contention and stale-read validation failures mean "try the next candidate".
    /// Everything else fails the operation.
    pub fn is_candidate_skippable(&self) -> bool {
        matches!(
            self,
            PlacementError::LockContention(_) | PlacementError::Validation { .. }
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PlacementError::CapacityExhausted { .. } => "capacity_exhausted",
            PlacementError::LockContention(_) => "lock_contention",
            PlacementError::Validation { .. } => "validation",
            PlacementError::InvalidInstallation(_) => "invalid_installation",
            PlacementError::ConcurrentAssignment { .. } => "concurrent_assignment",
            PlacementError::NotAssigned(_) => "not_assigned",
            PlacementError::Unsupported(_) => "unsupported",
            PlacementError::Registry { .. } => "registry",
            PlacementError::Cloud { .. } => "cloud",
            PlacementError::Secret { .. } => "secret",
            PlacementError::Sql { .. } => "sql",
        }
    }

    pub(crate) fn validation(database_id: &str, reason: impl Into<String>) -> Self {
        PlacementError::Validation {
            database_id: database_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// A capability error that can be lifted into a [`PlacementError`] once the caller
/// knows which cluster and installation it concerns.
pub(crate) trait CapabilityError {
    fn into_placement_error(self, context: String) -> PlacementError;
}

impl CapabilityError for RegistryError {
    fn into_placement_error(self, context: String) -> PlacementError {
        PlacementError::Registry {
            context,
            source: self,
        }
    }
}

impl CapabilityError for CloudError {
    fn into_placement_error(self, context: String) -> PlacementError {
        PlacementError::Cloud {
            context,
            source: self,
        }
    }
}

impl CapabilityError for SecretError {
    fn into_placement_error(self, context: String) -> PlacementError {
        PlacementError::Secret {
            context,
            source: self,
        }
    }
}

impl CapabilityError for SqlError {
    fn into_placement_error(self, context: String) -> PlacementError {
        PlacementError::Sql {
            context,
            source: self,
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Wrap a capability error with operation context, evaluated lazily.
    fn context_for<C, F>(self, f: F) -> Result<T, PlacementError>
    where
        C: Display,
        F: FnOnce() -> C;
}

impl<T, E: CapabilityError> ResultExt<T> for Result<T, E> {
    fn context_for<C, F>(self, f: F) -> Result<T, PlacementError>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into_placement_error(f().to_string()))
    }
}
