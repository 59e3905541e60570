//! Builders for backup and restore workloads. Backups run the bench CLI
//! directly with synthesized arguments; restores read their sources from a
//! file-mounted secret like every other credential-bearing input.

use crate::backup::args::backup_args;
use crate::bench::resources::{sites_pvc_name, SITES_MOUNT_PATH, SITES_VOLUME};
use crate::child_labels;
use crate::crd::backup::{SiteBackup, SiteRestore};
use crate::site::jobs::{DELETION_SECRET_MODE, SECRETS_MOUNT_PATH};

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    Secret, SecretVolumeSource, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

const SOURCES_VOLUME: &str = "restore-sources";

pub fn backup_job_name(backup: &str) -> String {
    format!("{backup}-backup")
}

pub fn restore_job_name(restore: &str) -> String {
    format!("{restore}-restore")
}

pub fn restore_sources_secret_name(restore: &str) -> String {
    format!("{restore}-restore-sources")
}

fn sites_volume(bench_name: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: SITES_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: sites_pvc_name(bench_name),
                read_only: None,
            }),
            ..Volume::default()
        },
        VolumeMount {
            name: SITES_VOLUME.to_string(),
            mount_path: SITES_MOUNT_PATH.to_string(),
            ..VolumeMount::default()
        },
    )
}

fn backup_pod_spec(
    backup: &SiteBackup,
    bench_name: &str,
    image: &str,
    security_context: Option<PodSecurityContext>,
) -> PodSpec {
    let (volume, mount) = sites_volume(bench_name);
    PodSpec {
        restart_policy: Some("Never".to_string()),
        security_context,
        containers: vec![Container {
            name: "backup".to_string(),
            image: Some(image.to_string()),
            command: Some(vec!["bench".to_string()]),
            args: Some(backup_args(&backup.spec)),
            volume_mounts: Some(vec![mount]),
            ..Container::default()
        }],
        volumes: Some(vec![volume]),
        ..PodSpec::default()
    }
}

pub fn backup_job(
    backup: &SiteBackup,
    bench_name: &str,
    image: &str,
    security_context: Option<PodSecurityContext>,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(backup_job_name(&backup.name_any())),
            namespace: backup.namespace(),
            labels: Some(child_labels(bench_name, "backup")),
            owner_references: backup.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(child_labels(bench_name, "backup")),
                    ..ObjectMeta::default()
                }),
                spec: Some(backup_pod_spec(backup, bench_name, image, security_context)),
            },
            ..JobSpec::default()
        }),
        status: None,
    }
}

pub fn backup_cronjob(
    backup: &SiteBackup,
    bench_name: &str,
    image: &str,
    security_context: Option<PodSecurityContext>,
    schedule: &str,
) -> CronJob {
    CronJob {
        metadata: ObjectMeta {
            name: Some(backup_job_name(&backup.name_any())),
            namespace: backup.namespace(),
            labels: Some(child_labels(bench_name, "backup")),
            owner_references: backup.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        spec: Some(CronJobSpec {
            schedule: schedule.to_string(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(child_labels(bench_name, "backup")),
                    ..ObjectMeta::default()
                }),
                spec: Some(JobSpec {
                    backoff_limit: Some(1),
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(child_labels(bench_name, "backup")),
                            ..ObjectMeta::default()
                        }),
                        spec: Some(backup_pod_spec(backup, bench_name, image, security_context)),
                    },
                    ..JobSpec::default()
                }),
            },
            ..CronJobSpec::default()
        }),
        status: None,
    }
}

/// Restore inputs as one file per key. Object-store credentials are copied
/// out of the referenced secret so the job mounts a single source of truth.
pub fn restore_sources_secret(restore: &SiteRestore, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(restore_sources_secret_name(&restore.name_any())),
            namespace: restore.namespace(),
            owner_references: restore.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        string_data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

pub fn restore_job(
    restore: &SiteRestore,
    bench_name: &str,
    image: &str,
    security_context: Option<PodSecurityContext>,
    with_public_files: bool,
    with_private_files: bool,
) -> Job {
    let public_flag = if with_public_files {
        format!(
            r#" \
  --with-public-files "$(cat {p}/public_source)""#,
            p = SECRETS_MOUNT_PATH
        )
    } else {
        String::new()
    };
    let private_flag = if with_private_files {
        format!(
            r#" \
  --with-private-files "$(cat {p}/private_source)""#,
            p = SECRETS_MOUNT_PATH
        )
    } else {
        String::new()
    };
    let script = format!(
        r#"set -e
cd /home/frappe/frappe-bench
SITE_NAME="$(cat {p}/site_name)"
bench --site "$SITE_NAME" restore "$(cat {p}/db_source)" --force{public_flag}{private_flag}
"#,
        p = SECRETS_MOUNT_PATH
    );

    let (volume, mount) = sites_volume(bench_name);
    Job {
        metadata: ObjectMeta {
            name: Some(restore_job_name(&restore.name_any())),
            namespace: restore.namespace(),
            labels: Some(child_labels(bench_name, "restore")),
            owner_references: restore.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(child_labels(bench_name, "restore")),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    security_context,
                    containers: vec![Container {
                        name: "restore".to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec![
                            "/bin/bash".to_string(),
                            "-c".to_string(),
                            script,
                        ]),
                        volume_mounts: Some(vec![
                            mount,
                            VolumeMount {
                                name: SOURCES_VOLUME.to_string(),
                                mount_path: SECRETS_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..VolumeMount::default()
                            },
                        ]),
                        ..Container::default()
                    }],
                    volumes: Some(vec![
                        volume,
                        Volume {
                            name: SOURCES_VOLUME.to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(restore_sources_secret_name(&restore.name_any())),
                                default_mode: Some(DELETION_SECRET_MODE),
                                ..SecretVolumeSource::default()
                            }),
                            ..Volume::default()
                        },
                    ]),
                    ..PodSpec::default()
                }),
            },
            ..JobSpec::default()
        }),
        status: None,
    }
}
