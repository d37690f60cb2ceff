use async_trait::async_trait;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use aws_sdk_secretsmanager::types::Tag;
use database_api::secret::RdsSecret;

use super::{SecretError, SecretStore, validate};

/// [`SecretStore`] backed by AWS Secrets Manager. Payloads are stored as JSON.
pub struct AwsSecretStore {
    client: aws_sdk_secretsmanager::Client,
}

impl AwsSecretStore {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_secretsmanager::Client::new(sdk_config),
        }
    }
}

fn api_error<E: std::error::Error>(operation: &'static str, name: &str, e: E) -> SecretError {
    SecretError::Api {
        operation,
        name: name.to_string(),
        message: DisplayErrorContext(e).to_string(),
    }
}

#[async_trait]
impl SecretStore for AwsSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<RdsSecret>, SecretError> {
        let output = match self.client.get_secret_value().secret_id(name).send().await {
            Ok(output) => output,
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception()) =>
            {
                return Ok(None);
            }
            Err(e) => return Err(api_error("GetSecretValue", name, e)),
        };

        let payload = output.secret_string().ok_or_else(|| SecretError::Decode {
            name: name.to_string(),
            message: "secret has no string value".to_string(),
        })?;
        let secret: RdsSecret =
            serde_json::from_str(payload).map_err(|e| SecretError::Decode {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        validate(name, &secret)?;
        Ok(Some(secret))
    }

    async fn create_secret(
        &self,
        name: &str,
        secret: &RdsSecret,
        tags: &[(String, String)],
    ) -> Result<(), SecretError> {
        validate(name, secret)?;
        let payload = serde_json::to_string(secret).map_err(|e| SecretError::Decode {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        let tags = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();
        self.client
            .create_secret()
            .name(name)
            .secret_string(payload)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(|e| api_error("CreateSecret", name, e))?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), SecretError> {
        match self
            .client
            .delete_secret()
            .secret_id(name)
            .force_delete_without_recovery(true)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|e| e.is_resource_not_found_exception()) =>
            {
                tracing::info!("secret {name} already deleted");
                Ok(())
            }
            Err(e) => Err(api_error("DeleteSecret", name, e)),
        }
    }
}
