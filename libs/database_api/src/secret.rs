use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SecretValidationError {
    #[error("secret is missing a username")]
    MissingUsername,
    #[error("secret is missing a password")]
    MissingPassword,
}

/// Credentials stored in the secret store, both for cluster master users and for
/// per-installation users. The field names match what the cloud console writes.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RdsSecret {
    #[serde(rename = "MasterUsername")]
    pub master_username: String,
    #[serde(rename = "MasterPassword")]
    pub master_password: String,
}

impl RdsSecret {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            master_username: username.into(),
            master_password: password.into(),
        }
    }

    pub fn validate(&self) -> Result<(), SecretValidationError> {
        if self.master_username.is_empty() {
            return Err(SecretValidationError::MissingUsername);
        }
        if self.master_password.is_empty() {
            return Err(SecretValidationError::MissingPassword);
        }
        Ok(())
    }
}

impl std::fmt::Debug for RdsSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdsSecret")
            .field("master_username", &self.master_username)
            .field("master_password", &"<redacted>")
            .finish()
    }
}
