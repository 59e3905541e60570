use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::client::Client;
use tracing::{info, warn};

/// Name of the operator's own ConfigMap, read from its namespace at startup.
pub const OPERATOR_CONFIGMAP: &str = "frappeop-config";

/// Image used when neither the Bench spec nor the ConfigMap name one.
pub const DEFAULT_FRAPPE_IMAGE: &str = "frappe/erpnext:v15";

const DEFAULT_ID: i64 = 1001;

/// Operator-level configuration: the `frappeop-config` ConfigMap plus
/// environment defaults for pod identity.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// `defaultFrappeImage` key: fallback image for benches that pin neither
    /// a tag nor a version.
    pub default_frappe_image: Option<String>,
    /// `gitEnabled` key: whether benches may pull extra app repositories.
    pub git_enabled: bool,
    pub default_uid: i64,
    pub default_gid: i64,
    pub default_fsgroup: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_frappe_image: None,
            git_enabled: false,
            default_uid: DEFAULT_ID,
            default_gid: DEFAULT_ID,
            default_fsgroup: DEFAULT_ID,
        }
    }
}

impl ControllerConfig {
    /// Load the ConfigMap and environment. A missing ConfigMap is normal;
    /// malformed or zero id values fall back to the built-in defaults (a
    /// uid of 0 is never accepted).
    pub async fn load(client: &Client, namespace: &str) -> Self {
        let data = match Api::<ConfigMap>::namespaced(client.clone(), namespace)
            .get_opt(OPERATOR_CONFIGMAP)
            .await
        {
            Ok(Some(cm)) => cm.data.unwrap_or_default(),
            Ok(None) => {
                info!(msg = "operator ConfigMap not found, using defaults", name = OPERATOR_CONFIGMAP);
                Default::default()
            }
            Err(e) => {
                warn!(msg = "reading operator ConfigMap failed, using defaults", %e);
                Default::default()
            }
        };

        Self {
            default_frappe_image: data.get("defaultFrappeImage").cloned(),
            git_enabled: data.get("gitEnabled").map(|v| v == "true").unwrap_or(false),
            default_uid: env_id("FRAPPE_DEFAULT_UID"),
            default_gid: env_id("FRAPPE_DEFAULT_GID"),
            default_fsgroup: env_id("FRAPPE_DEFAULT_FSGROUP"),
        }
    }
}

fn env_id(var: &str) -> i64 {
    match std::env::var(var) {
        Ok(raw) => match raw.parse::<i64>() {
            Ok(id) if id > 0 => id,
            _ => {
                warn!(msg = "ignoring invalid id from environment", var, raw);
                DEFAULT_ID
            }
        },
        Err(_) => DEFAULT_ID,
    }
}
