//! Counter tag bookkeeping.
//!
//! Each shared cluster carries a `Counter` tag mirroring how full it is. The registry's
//! membership list is authoritative; the tag is a cache used to admit clusters the
//! registry has never seen, and for operator visibility. It is only written by callers
//! holding the cluster's registry lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use database_api::models::InstallationIds;
use database_api::tags::COUNTER_TAG_KEY;

use crate::cloud::ResourceDirectory;
use crate::config::CounterMode;
use crate::error::{PlacementError, ResultExt};
use crate::metrics::COUNTER_TAG_ROLLBACKS;
use crate::registry::Registry;

pub struct CounterTags {
    registry: Arc<dyn Registry>,
    directory: Arc<dyn ResourceDirectory>,
    mode: CounterMode,
}

impl CounterTags {
    pub fn new(
        registry: Arc<dyn Registry>,
        directory: Arc<dyn ResourceDirectory>,
        mode: CounterMode,
    ) -> Self {
        Self {
            registry,
            directory,
            mode,
        }
    }

    pub fn mode(&self) -> CounterMode {
        self.mode
    }

    /// The counter value for a membership set: the plain count, or the summed database
    /// weight rounded up.
    pub async fn counter_value(&self, installations: &InstallationIds) -> Result<i64, PlacementError> {
        match self.mode {
            CounterMode::Count => Ok(installations.len() as i64),
            CounterMode::Weighted => {
                let weight = self
                    .registry
                    .get_installations_total_database_weight(installations.as_slice())
                    .await
                    .context_for(|| "failed to compute installation weights")?;
                Ok(weight.ceil() as i64)
            }
        }
    }

    pub async fn update_counter_tag(&self, cluster_arn: &str, value: i64) -> Result<(), PlacementError> {
        let tags = HashMap::from([(COUNTER_TAG_KEY.to_string(), value.to_string())]);
        self.directory
            .tag_resource(cluster_arn, &tags)
            .await
            .context_for(|| format!("failed to set counter tag of {cluster_arn} to {value}"))?;
        tracing::debug!("counter tag of {cluster_arn} set to {value}");
        Ok(())
    }

    /// Recompute the counter from `installations` and write it.
    pub async fn update_counter_tag_with_current_weight(
        &self,
        cluster_arn: &str,
        installations: &InstallationIds,
    ) -> Result<(), PlacementError> {
        let value = self.counter_value(installations).await?;
        self.update_counter_tag(cluster_arn, value).await
    }

    /// Removal path: write the counter for `next` first, then run `registry_write`. If the
    /// registry write fails, put the counter back to its value for `previous` and return
    /// the registry error. A failed rollback is logged and left for the next successful
    /// update to correct.
    pub async fn with_counter_rollback<T, F, Fut>(
        &self,
        cluster_arn: &str,
        previous: &InstallationIds,
        next: &InstallationIds,
        registry_write: F,
    ) -> Result<T, PlacementError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PlacementError>>,
    {
        let previous_value = self.counter_value(previous).await?;
        let next_value = self.counter_value(next).await?;
        self.update_counter_tag(cluster_arn, next_value).await?;

        match registry_write().await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(
                    "registry write failed after counter tag of {cluster_arn} was set to {next_value}, rolling back to {previous_value}: {e}"
                );
                match self.update_counter_tag(cluster_arn, previous_value).await {
                    Ok(()) => {
                        COUNTER_TAG_ROLLBACKS
                            .with_label_values(&["rolled_back"])
                            .inc();
                    }
                    Err(rollback_err) => {
                        COUNTER_TAG_ROLLBACKS
                            .with_label_values(&["rollback_failed"])
                            .inc();
                        tracing::error!(
                            "failed to roll back counter tag of {cluster_arn} to {previous_value}: {rollback_err}"
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

/// Parse a counter tag value. Malformed values make a cluster ineligible.
pub fn parse_counter(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|v| *v >= 0)
}
