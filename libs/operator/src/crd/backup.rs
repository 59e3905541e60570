use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Observed state of backup and restore work. Mirrors the underlying Job
/// outcome; `Scheduled` is reported for cron-driven backups instead.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum JobPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Scheduled,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobPhase::Pending => "Pending",
            JobPhase::Running => "Running",
            JobPhase::Succeeded => "Succeeded",
            JobPhase::Failed => "Failed",
            JobPhase::Scheduled => "Scheduled",
        };
        write!(f, "{s}")
    }
}

/// A `SiteBackup` requests a backup of one site. Without a schedule it runs
/// once as a Job; with a cron schedule it materializes a CronJob.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "frappeop.rs",
    version = "v1",
    kind = "SiteBackup",
    plural = "sitebackups",
    singular = "sitebackup",
    namespaced,
    status = "SiteBackupStatus",
    printcolumn = r#"{"name":"Site","type":"string","jsonPath":".spec.site"}"#,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SiteBackupSpec {
    /// Logical name of the site to back up.
    pub site: String,

    /// Cron expression. When set, the backup recurs as a CronJob.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Include public and private files in the backup.
    #[serde(default)]
    pub with_files: bool,

    #[serde(default)]
    pub compress: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path_db: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path_conf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path_files: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path_private_files: Option<String>,

    /// Apps whose tables are excluded from the dump.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// Restrict the dump to these apps' tables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    #[serde(default)]
    pub ignore_backup_conf: bool,

    #[serde(default)]
    pub verbose: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SiteBackupStatus {
    #[serde(default)]
    pub phase: JobPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// A `SiteRestore` replays a database dump and optional file archives into a
/// site. It materializes exactly one Job; Succeeded and Failed are sticky.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "frappeop.rs",
    version = "v1",
    kind = "SiteRestore",
    plural = "siterestores",
    singular = "siterestore",
    namespaced,
    status = "SiteRestoreStatus",
    printcolumn = r#"{"name":"Site","type":"string","jsonPath":".spec.site"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SiteRestoreSpec {
    /// Logical name of the site to restore into.
    pub site: String,

    /// Database dump to restore.
    pub database: RestoreArtifact,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_files: Option<RestoreArtifact>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_files: Option<RestoreArtifact>,
}

/// One restore input, pulled from an object store or from a path on the
/// bench's shared volume. Exactly one of the two should be set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreArtifact {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_store: Option<ObjectStoreSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreSource {
    pub bucket: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Object key of the artifact.
    pub key: String,
    /// Secret with `access_key` and `secret_key` entries.
    pub credentials_secret: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SiteRestoreStatus {
    #[serde(default)]
    pub phase: JobPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
