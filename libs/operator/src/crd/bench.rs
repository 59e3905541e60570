use crate::conditions::Phase;
use crate::crd::{DbMode, DbProvider};

use k8s_openapi::api::core::v1::{PodSecurityContext, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The `Bench` custom resource describes the shared, tenant-independent
/// Frappe runtime: web and edge deployments, socket.io, the scheduler,
/// background workers, the redis pair and the shared sites volume. Sites
/// reference a Bench by name and only become ready once it is.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "frappeop.rs",
    version = "v1",
    kind = "Bench",
    plural = "benches",
    singular = "bench",
    shortname = "fb",
    namespaced,
    status = "BenchStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type == 'Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct BenchSpec {
    /// Frappe framework version. Used as the image tag when `image.tag` is
    /// not set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Container image coordinates for every bench workload.
    #[serde(default)]
    pub image: ImageConfig,

    /// Gunicorn web workers.
    #[serde(default)]
    pub web: WorkloadConfig,

    /// Nginx edge serving assets and proxying to the web workers.
    #[serde(default)]
    pub nginx: WorkloadConfig,

    /// Socket.io realtime endpoint.
    #[serde(default)]
    pub socketio: WorkloadConfig,

    /// Scheduler. Replicas are pinned to one regardless of configuration;
    /// only the resource envelope is honored.
    #[serde(default)]
    pub scheduler: WorkloadConfig,

    /// Background worker classes, one Deployment per queue. Defaults to the
    /// standard `default`, `short` and `long` queues.
    #[serde(default = "default_worker_classes")]
    pub workers: Vec<WorkerConfig>,

    /// Redis cache and queue instances.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Shared sites volume.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Database defaults inherited by sites that do not override them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<BenchDatabaseConfig>,

    /// Domain resolution defaults for sites on this bench.
    #[serde(default)]
    pub domain: DomainConfig,

    /// Pod security context override. When unset, platform-conditional
    /// defaults apply: omitted entirely on managed-security platforms,
    /// pinned to the configured uid/gid otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,

    /// Additional app repositories to make installable on this bench.
    /// Ignored unless the operator has `gitEnabled` set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_apps: Vec<AppSource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Replica count and resource envelope of one bench component.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Queue this worker class consumes.
    pub queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Autoscaling policy surfaced to the external autoscaler. The operator
    /// renders the annotations but never scales anything itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoscaling: Option<WorkerAutoscaling>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerAutoscaling {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    #[serde(default)]
    pub scale_to_zero: bool,
}

/// The standard worker queues every bench runs.
pub fn default_worker_classes() -> Vec<WorkerConfig> {
    ["default", "short", "long"]
        .into_iter()
        .map(|queue| WorkerConfig {
            queue: queue.to_string(),
            replicas: None,
            resources: None,
            autoscaling: None,
        })
        .collect()
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    #[serde(default)]
    pub cache: WorkloadConfig,
    #[serde(default)]
    pub queue: WorkloadConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Size of the shared sites volume. Defaults to 8Gi.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// Access mode preference. Defaults to ReadWriteMany with an automatic
    /// fallback to ReadWriteOnce where the cluster cannot provision it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BenchDatabaseConfig {
    #[serde(default)]
    pub provider: DbProvider,
    #[serde(default)]
    pub mode: DbMode,
    /// Name of the shared MariaDB custom resource in this namespace.
    /// Required for the shared mariadb mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mariadb_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    /// Domain suffix appended to site names, e.g. `.example.com`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    /// Detect a usable suffix from the cluster's ingress services when no
    /// suffix is configured.
    #[serde(default = "default_true")]
    pub autodetect: bool,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            suffix: None,
            autodetect: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppSource {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BenchStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// Generation the reported status corresponds to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
