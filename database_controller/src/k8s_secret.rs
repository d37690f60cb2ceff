use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::dialect::ConnectionStrings;
use crate::naming;

pub const DB_CONNECTION_STRING: &str = "DB_CONNECTION_STRING";
pub const DB_READ_REPLICAS: &str = "MM_SQLSETTINGS_DATASOURCEREPLICAS";
pub const DB_CONNECTION_CHECK_URL: &str = "DB_CONNECTION_CHECK_URL";

/// The secret object mounted into the installation's pods as environment variables.
pub fn database_secret(installation_id: &str, strings: &ConnectionStrings) -> Secret {
    let mut data = BTreeMap::from([
        (DB_CONNECTION_STRING.to_string(), strings.writer.clone()),
        (DB_READ_REPLICAS.to_string(), strings.readers.clone()),
    ]);
    if let Some(check_url) = &strings.check_url {
        data.insert(DB_CONNECTION_CHECK_URL.to_string(), check_url.clone());
    }

    Secret {
        metadata: ObjectMeta {
            name: Some(naming::kubernetes_secret_name(installation_id)),
            ..Default::default()
        },
        string_data: Some(data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_url_is_optional() {
        let mut strings = ConnectionStrings {
            writer: "postgres://w".to_string(),
            readers: "postgres://r".to_string(),
            check_url: None,
        };
        let secret = database_secret("inst-a", &strings);
        assert_eq!(secret.metadata.name.as_deref(), Some("inst-a-rds-value"));
        let data = secret.string_data.unwrap();
        assert_eq!(data[DB_CONNECTION_STRING], "postgres://w");
        assert_eq!(data[DB_READ_REPLICAS], "postgres://r");
        assert!(!data.contains_key(DB_CONNECTION_CHECK_URL));

        strings.check_url = Some("http://w:3306".to_string());
        let data = database_secret("inst-a", &strings).string_data.unwrap();
        assert_eq!(data[DB_CONNECTION_CHECK_URL], "http://w:3306");
    }
}
