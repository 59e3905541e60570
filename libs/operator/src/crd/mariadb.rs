//! Foreign custom resources of the mariadb-operator, declared only to the
//! depth this operator reads and writes them.

use crate::crd::SecretKeyRef;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Key read from a root password secret when the foreign CR does not name one.
pub const DEFAULT_ROOT_PASSWORD_KEY: &str = "password";

/// Reference from a provisioning CR to its MariaDB server.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MariaDbRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_for_it: Option<bool>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "k8s.mariadb.com",
    version = "v1alpha1",
    kind = "MariaDB",
    plural = "mariadbs",
    namespaced,
    status = "MariaDbResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MariaDBSpec {
    /// Root credential location. The operator resolves it for destructive
    /// site teardown; tenant pods never see it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_password_secret_key_ref: Option<SecretKeyRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<MariaDbStorage>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MariaDbStorage {
    pub size: String,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "k8s.mariadb.com",
    version = "v1alpha1",
    kind = "Database",
    plural = "databases",
    namespaced,
    status = "MariaDbResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    pub maria_db_ref: MariaDbRef,
    /// Logical database name; defaults to the CR name when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collate: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "k8s.mariadb.com",
    version = "v1alpha1",
    kind = "User",
    plural = "users",
    namespaced,
    status = "MariaDbResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    pub maria_db_ref: MariaDbRef,
    pub password_secret_key_ref: SecretKeyRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_user_connections: Option<i32>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "k8s.mariadb.com",
    version = "v1alpha1",
    kind = "Grant",
    plural = "grants",
    namespaced,
    status = "MariaDbResourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GrantSpec {
    pub maria_db_ref: MariaDbRef,
    pub privileges: Vec<String>,
    pub database: String,
    pub table: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default)]
    pub grant_option: bool,
}

/// Status shape shared by the foreign kinds; only conditions are consumed.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MariaDbResourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// Readiness of a foreign CR per its `Ready` condition.
pub fn foreign_ready(status: Option<&MariaDbResourceStatus>) -> bool {
    status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn status_with(type_: &str, value: &str) -> MariaDbResourceStatus {
        MariaDbResourceStatus {
            conditions: Some(vec![Condition {
                type_: type_.to_string(),
                status: value.to_string(),
                reason: "Test".into(),
                message: String::new(),
                observed_generation: None,
                last_transition_time: Time(chrono::Utc::now()),
            }]),
        }
    }

    #[test]
    fn ready_condition_drives_readiness() {
        assert!(foreign_ready(Some(&status_with("Ready", "True"))));
        assert!(!foreign_ready(Some(&status_with("Ready", "False"))));
        assert!(!foreign_ready(Some(&status_with("Synced", "True"))));
        assert!(!foreign_ready(None));
    }
}
