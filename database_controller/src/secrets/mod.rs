pub mod aws;

use async_trait::async_trait;
use database_api::secret::{RdsSecret, SecretValidationError};
use rand::Rng;
use rand::distributions::Alphanumeric;

const GENERATED_PASSWORD_LEN: usize = 40;

#[derive(thiserror::Error, Debug)]
pub enum SecretError {
    #[error("{operation} on secret {name} failed: {message}")]
    Api {
        operation: &'static str,
        name: String,
        message: String,
    },
    #[error("secret {name} is invalid: {source}")]
    Invalid {
        name: String,
        #[source]
        source: SecretValidationError,
    },
    #[error("secret {0} does not exist")]
    NotFound(String),
    #[error("secret {name} could not be decoded: {message}")]
    Decode { name: String, message: String },
}

/// Named credential records. Every payload is validated on read and on write.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `None` if no secret with this name exists.
    async fn get_secret(&self, name: &str) -> Result<Option<RdsSecret>, SecretError>;

    async fn create_secret(
        &self,
        name: &str,
        secret: &RdsSecret,
        tags: &[(String, String)],
    ) -> Result<(), SecretError>;

    /// Deletes immediately, without a recovery window. Succeeds if the secret is already gone.
    async fn delete_secret(&self, name: &str) -> Result<(), SecretError>;
}

pub fn validate(name: &str, secret: &RdsSecret) -> Result<(), SecretError> {
    secret.validate().map_err(|source| SecretError::Invalid {
        name: name.to_string(),
        source,
    })
}

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

/// Return the secret stored under `name`, creating one with a fresh password if none exists.
/// If another writer creates it first, theirs is returned.
pub async fn get_or_create_secret(
    store: &dyn SecretStore,
    name: &str,
    username: &str,
    tags: &[(String, String)],
) -> Result<RdsSecret, SecretError> {
    if let Some(existing) = store.get_secret(name).await? {
        return Ok(existing);
    }
    let secret = RdsSecret::new(username, generate_password());
    if let Err(e) = store.create_secret(name, &secret, tags).await {
        return match store.get_secret(name).await? {
            Some(existing) => {
                tracing::info!("secret {name} was created concurrently, using it");
                Ok(existing)
            }
            None => Err(e),
        };
    }
    tracing::info!("created secret {name}");
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockSecretStore;

    #[test]
    fn generated_passwords_are_strong_and_distinct() {
        let a = generate_password();
        let b = generate_password();
        assert_eq!(a.len(), GENERATED_PASSWORD_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn concurrent_creators_share_one_secret() {
        let store = MockSecretStore::new();
        let (a, b) = tokio::join!(
            get_or_create_secret(&store, "rds-multitenant-inst-a", "user", &[]),
            get_or_create_secret(&store, "rds-multitenant-inst-a", "user", &[]),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.master_password, b.master_password);
        assert_eq!(store.get("rds-multitenant-inst-a").unwrap().master_password, a.master_password);
    }
}
