pub mod backup;
pub mod bench;
pub mod mariadb;
pub mod route;
pub mod site;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to one key of a Secret. Follows the mariadb-operator shape
/// where the key may be omitted and defaults per consumer.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Database provider backing a site. A closed set: adding a provider means
/// adding a variant and its dispatch arms.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DbProvider {
    #[default]
    MariaDb,
    /// Embedded database on the shared volume; nothing to provision.
    Sqlite,
}

impl DbProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbProvider::MariaDb => "mariadb",
            DbProvider::Sqlite => "sqlite",
        }
    }
}

/// Whether the backing database server is shared across sites or dedicated
/// to one.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DbMode {
    #[default]
    Shared,
    Dedicated,
}
