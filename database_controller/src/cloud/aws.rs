use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_rds::error::DisplayErrorContext;
use aws_sdk_resourcegroupstagging::types::TagFilter as AwsTagFilter;

use super::{
    ClusterDescription, CloudError, EndpointStatus, ResourceDirectory, TagFilter, TaggedResource,
};

/// [`ResourceDirectory`] backed by the Resource Groups Tagging API and RDS.
pub struct AwsResourceDirectory {
    tagging: aws_sdk_resourcegroupstagging::Client,
    rds: aws_sdk_rds::Client,
}

impl AwsResourceDirectory {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            tagging: aws_sdk_resourcegroupstagging::Client::new(sdk_config),
            rds: aws_sdk_rds::Client::new(sdk_config),
        }
    }
}

fn api_error<E: std::error::Error>(operation: &'static str, e: E) -> CloudError {
    CloudError::Api {
        operation,
        message: DisplayErrorContext(e).to_string(),
    }
}

#[async_trait]
impl ResourceDirectory for AwsResourceDirectory {
    async fn find_resources_by_tags(
        &self,
        filters: &[TagFilter],
        resource_types: &[&str],
    ) -> Result<Vec<TaggedResource>, CloudError> {
        let tag_filters: Vec<AwsTagFilter> = filters
            .iter()
            .map(|f| {
                AwsTagFilter::builder()
                    .key(&f.key)
                    .set_values((!f.values.is_empty()).then(|| f.values.clone()))
                    .build()
            })
            .collect();
        let resource_types: Vec<String> = resource_types.iter().map(|t| t.to_string()).collect();

        let mut resources = Vec::new();
        let mut pagination_token: Option<String> = None;
        loop {
            let output = self
                .tagging
                .get_resources()
                .set_tag_filters(Some(tag_filters.clone()))
                .set_resource_type_filters(Some(resource_types.clone()))
                .set_pagination_token(pagination_token.take())
                .send()
                .await
                .map_err(|e| api_error("GetResources", e))?;

            for mapping in output.resource_tag_mapping_list() {
                let Some(arn) = mapping.resource_arn() else {
                    continue;
                };
                let tags = mapping
                    .tags()
                    .iter()
                    .map(|t| (t.key().to_string(), t.value().to_string()))
                    .collect();
                resources.push(TaggedResource {
                    arn: arn.to_string(),
                    tags,
                });
            }

            match output.pagination_token() {
                Some(token) if !token.is_empty() => pagination_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(resources)
    }

    async fn tag_resource(
        &self,
        arn: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), CloudError> {
        let output = self
            .tagging
            .tag_resources()
            .resource_arn_list(arn)
            .set_tags(Some(tags.clone()))
            .send()
            .await
            .map_err(|e| api_error("TagResources", e))?;
        if let Some(failure) = output.failed_resources_map().and_then(|m| m.get(arn)) {
            return Err(CloudError::Api {
                operation: "TagResources",
                message: format!(
                    "{arn}: {}",
                    failure.error_message().unwrap_or("unknown failure")
                ),
            });
        }
        Ok(())
    }

    async fn untag_resource(&self, arn: &str, keys: &[String]) -> Result<(), CloudError> {
        let output = self
            .tagging
            .untag_resources()
            .resource_arn_list(arn)
            .set_tag_keys(Some(keys.to_vec()))
            .send()
            .await
            .map_err(|e| api_error("UntagResources", e))?;
        if let Some(failure) = output.failed_resources_map().and_then(|m| m.get(arn)) {
            return Err(CloudError::Api {
                operation: "UntagResources",
                message: format!(
                    "{arn}: {}",
                    failure.error_message().unwrap_or("unknown failure")
                ),
            });
        }
        Ok(())
    }

    async fn describe_cluster(&self, cluster_id: &str) -> Result<ClusterDescription, CloudError> {
        let output = match self
            .rds
            .describe_db_clusters()
            .db_cluster_identifier(cluster_id)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_db_cluster_not_found_fault()) =>
            {
                return Err(CloudError::ClusterNotFound(cluster_id.to_string()));
            }
            Err(e) => return Err(api_error("DescribeDBClusters", e)),
        };

        let cluster = match output.db_clusters() {
            [cluster] => cluster,
            clusters => {
                return Err(CloudError::InvalidResource(format!(
                    "expected one cluster named {cluster_id}, found {}",
                    clusters.len()
                )));
            }
        };

        Ok(ClusterDescription {
            cluster_id: cluster_id.to_string(),
            arn: cluster.db_cluster_arn().unwrap_or_default().to_string(),
            status: cluster.status().unwrap_or_default().to_string(),
            writer_endpoint: cluster.endpoint().unwrap_or_default().to_string(),
            reader_endpoint: cluster.reader_endpoint().unwrap_or_default().to_string(),
        })
    }

    async fn describe_cluster_endpoints(
        &self,
        cluster_id: &str,
    ) -> Result<Vec<EndpointStatus>, CloudError> {
        let output = self
            .rds
            .describe_db_cluster_endpoints()
            .db_cluster_identifier(cluster_id)
            .send()
            .await
            .map_err(|e| api_error("DescribeDBClusterEndpoints", e))?;

        Ok(output
            .db_cluster_endpoints()
            .iter()
            .map(|e| EndpointStatus {
                endpoint_type: e.endpoint_type().unwrap_or_default().to_string(),
                status: e.status().unwrap_or_default().to_string(),
            })
            .collect())
    }
}
