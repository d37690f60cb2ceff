//! Tag-based resource discovery and cluster descriptions.
//!
//! The cloud provider has no way to query resources by custom fields, so tags act as a
//! secondary index over shared clusters. The tag contract itself lives in
//! [`database_api::tags`].

pub mod aws;

use std::collections::HashMap;

use async_trait::async_trait;
use database_api::tags;

pub const CLUSTER_STATUS_AVAILABLE: &str = "available";

#[derive(thiserror::Error, Debug)]
pub enum CloudError {
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
    #[error("cluster {0} not found")]
    ClusterNotFound(String),
    #[error("unexpected resource: {0}")]
    InvalidResource(String),
}

/// Matches resources carrying `key`. An empty `values` matches any value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub values: Vec<String>,
}

impl TagFilter {
    pub fn equals(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            values: vec![value.to_string()],
        }
    }

    pub fn present(key: &str) -> Self {
        Self {
            key: key.to_string(),
            values: Vec::new(),
        }
    }

    pub fn matches(&self, tags: &HashMap<String, String>) -> bool {
        match tags.get(&self.key) {
            Some(value) => self.values.is_empty() || self.values.contains(value),
            None => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedResource {
    pub arn: String,
    pub tags: HashMap<String, String>,
}

impl TaggedResource {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterDescription {
    pub cluster_id: String,
    pub arn: String,
    pub status: String,
    pub writer_endpoint: String,
    pub reader_endpoint: String,
}

impl ClusterDescription {
    pub fn is_available(&self) -> bool {
        self.status == CLUSTER_STATUS_AVAILABLE
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointStatus {
    pub endpoint_type: String,
    pub status: String,
}

#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    /// All resources matching every filter. Pagination is handled internally.
    async fn find_resources_by_tags(
        &self,
        filters: &[TagFilter],
        resource_types: &[&str],
    ) -> Result<Vec<TaggedResource>, CloudError>;

    async fn tag_resource(
        &self,
        arn: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), CloudError>;

    async fn untag_resource(&self, arn: &str, keys: &[String]) -> Result<(), CloudError>;

    async fn describe_cluster(&self, cluster_id: &str) -> Result<ClusterDescription, CloudError>;

    async fn describe_cluster_endpoints(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<EndpointStatus>, CloudError>;
}

/// `arn:aws:rds:us-east-1:123456789012:cluster:rds-cluster-multitenant-abc` -> `rds-cluster-multitenant-abc`
pub fn cluster_id_from_arn(arn: &str) -> Result<&str, CloudError> {
    match arn.split_once(":cluster:") {
        Some((_, id)) if !id.is_empty() => Ok(id),
        _ => Err(CloudError::InvalidResource(format!(
            "'{arn}' is not an RDS cluster ARN"
        ))),
    }
}

/// `arn:aws:ec2:us-east-1:123456789012:vpc/vpc-0abc` -> `vpc-0abc`
pub fn vpc_id_from_arn(arn: &str) -> Result<&str, CloudError> {
    match arn.rsplit_once(":vpc/") {
        Some((_, id)) if !id.is_empty() => Ok(id),
        _ => Err(CloudError::InvalidResource(format!("'{arn}' is not a VPC ARN"))),
    }
}

/// The VPC claimed by a workload cluster. Exactly one is expected.
pub async fn find_vpc_for_cluster(
    directory: &dyn ResourceDirectory,
    cloud_cluster_id: &str,
) -> Result<String, CloudError> {
    let vpcs = directory
        .find_resources_by_tags(
            &[TagFilter::equals(
                tags::CLOUD_CLUSTER_ID_TAG_KEY,
                cloud_cluster_id,
            )],
            &[tags::VPC_RESOURCE_TYPE],
        )
        .await?;
    match vpcs.as_slice() {
        [vpc] => Ok(vpc_id_from_arn(&vpc.arn)?.to_string()),
        _ => Err(CloudError::InvalidResource(format!(
            "expected one VPC claimed by cluster {cloud_cluster_id}, found {}",
            vpcs.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arn_parsing() {
        assert_eq!(
            cluster_id_from_arn("arn:aws:rds:us-east-1:1:cluster:rds-cluster-multitenant-1").unwrap(),
            "rds-cluster-multitenant-1"
        );
        assert!(cluster_id_from_arn("arn:aws:rds:us-east-1:1:db:foo").is_err());
        assert_eq!(
            vpc_id_from_arn("arn:aws:ec2:us-east-1:1:vpc/vpc-0abc").unwrap(),
            "vpc-0abc"
        );
        assert!(vpc_id_from_arn("arn:aws:ec2:us-east-1:1:subnet/s-1").is_err());
    }

    #[test]
    fn tag_filter_matching() {
        let tags: HashMap<String, String> =
            [("Counter".to_string(), "3".to_string())].into_iter().collect();
        assert!(TagFilter::present("Counter").matches(&tags));
        assert!(TagFilter::equals("Counter", "3").matches(&tags));
        assert!(!TagFilter::equals("Counter", "4").matches(&tags));
        assert!(!TagFilter::present("VpcID").matches(&tags));
    }
}
