use crate::conditions::Phase;
use crate::crd::{DbMode, DbProvider, SecretKeyRef};

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The `Site` custom resource is one tenant on a bench: a provisioned
/// database, its credentials, an initialization job and, unless disabled, a
/// routable external endpoint.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "frappeop.rs",
    version = "v1",
    kind = "Site",
    plural = "sites",
    singular = "site",
    namespaced,
    status = "SiteStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".status.resolvedDomain"}"#,
    printcolumn = r#"{"name":"Bench","type":"string","jsonPath":".spec.benchRef"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SiteSpec {
    /// Name of the Bench this site runs on. Must live in the same namespace.
    #[serde(rename = "benchRef")]
    pub bench: String,

    /// Logical site name, e.g. `acme` or `acme.example.com`. Also the
    /// default external hostname when nothing else resolves.
    pub site_name: String,

    /// Explicit external domain. Takes precedence over every other
    /// resolution rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Database configuration; unset fields inherit the bench defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<SiteDatabaseConfig>,

    #[serde(default)]
    pub ingress: SiteIngressConfig,

    #[serde(default)]
    pub tls: SiteTlsConfig,

    /// Secret holding the admin password. When unset the operator generates
    /// one and stores it in `<site>-admin`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_password_secret: Option<SecretKeyRef>,

    /// Apps installed into the site at initialization. Names are validated;
    /// anything outside `[A-Za-z0-9_-]` is dropped with a warning event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SiteDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<DbProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<DbMode>,
    /// Shared-mode MariaDB custom resource to provision into, overriding the
    /// bench default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mariadb_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SiteIngressConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Default for SiteIngressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            class_name: None,
            annotations: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SiteTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// TLS secret name; defaults to `<site>-tls`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// cert-manager cluster issuer requested via annotation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// Which resolution rule produced the effective domain.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum DomainSource {
    Explicit,
    BenchSuffix,
    AutoDetected,
    SitenameDefault,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// External URL of the site once Ready.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_source: Option<DomainSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_uses_the_published_wire_keys() {
        let spec = SiteSpec {
            bench: "b1".into(),
            site_name: "acme".into(),
            domain: None,
            db: None,
            ingress: SiteIngressConfig::default(),
            tls: SiteTlsConfig::default(),
            admin_password_secret: None,
            apps: vec!["erpnext".into()],
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["benchRef"], "b1");
        assert_eq!(value["siteName"], "acme");
        assert_eq!(value["apps"][0], "erpnext");
    }

    #[test]
    fn domain_source_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(DomainSource::SitenameDefault).unwrap(),
            "sitename-default"
        );
        assert_eq!(
            serde_json::to_value(DomainSource::AutoDetected).unwrap(),
            "auto-detected"
        );
        assert_eq!(
            serde_json::to_value(DomainSource::BenchSuffix).unwrap(),
            "bench-suffix"
        );
    }
}
