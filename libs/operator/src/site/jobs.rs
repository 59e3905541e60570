//! Builders for the site's one-shot Jobs. Inputs reach the containers only
//! as files under a dedicated secret mount; nothing secret travels through
//! the environment.

use crate::bench::resources::{sites_pvc_name, SITES_MOUNT_PATH, SITES_VOLUME};
use crate::child_labels;
use crate::crd::site::Site;
use crate::crd::DbProvider;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    SecretVolumeSource, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

/// Mount point of the job input files.
pub const SECRETS_MOUNT_PATH: &str = "/run/secrets/frappeop";
const SECRETS_VOLUME: &str = "job-inputs";

/// World-readable: the init inputs include non-sensitive site facts read by
/// an arbitrary-uid container.
pub const INIT_SECRET_MODE: i32 = 0o444;
/// Owner-only: the deletion inputs carry root database credentials.
pub const DELETION_SECRET_MODE: i32 = 0o400;

pub fn init_job_name(site: &str) -> String {
    format!("{site}-init")
}

pub fn delete_job_name(site: &str) -> String {
    format!("{site}-delete")
}

pub fn init_secret_name(site: &str) -> String {
    format!("{site}-init-secrets")
}

pub fn deletion_secret_name(site: &str) -> String {
    format!("{site}-deletion-secret")
}

pub fn admin_secret_name(site: &str) -> String {
    format!("{site}-admin")
}

/// Initialization job: runs `bench new-site` with inputs read from the
/// mounted secret files. The shell payload is the contract with the tenant
/// image and is kept as-is.
pub fn init_job(
    site: &Site,
    bench_name: &str,
    image: &str,
    security_context: Option<PodSecurityContext>,
    apps: &[String],
    provider: DbProvider,
) -> Job {
    let install_flags = apps
        .iter()
        .map(|app| format!("--install-app={app}"))
        .collect::<Vec<_>>()
        .join(" ");
    let db_flags = match provider {
        DbProvider::MariaDb => format!(
            r#"--db-type mariadb \
  --db-host "$(cat {p}/db_host)" \
  --db-port "$(cat {p}/db_port)" \
  --db-name "$(cat {p}/db_name)" \
  --db-password "$(cat {p}/db_password)" \
  --no-mariadb-socket"#,
            p = SECRETS_MOUNT_PATH
        ),
        DbProvider::Sqlite => "--db-type sqlite".to_string(),
    };
    let script = format!(
        r#"set -e
cd /home/frappe/frappe-bench
SITE_NAME="$(cat {p}/site_name)"
if [ -d "sites/$SITE_NAME" ]; then
  echo "site $SITE_NAME already exists, nothing to do"
  exit 0
fi
bench new-site "$SITE_NAME" \
  --admin-password "$(cat {p}/admin_password)" \
  {db_flags} \
  {install_flags}
bench --site "$SITE_NAME" set-config host_name "$(cat {p}/domain)"
"#,
        p = SECRETS_MOUNT_PATH
    );

    job(
        site,
        bench_name,
        init_job_name(&site.name_any()),
        "init",
        image,
        security_context,
        script,
        init_secret_name(&site.name_any()),
        INIT_SECRET_MODE,
    )
}

/// Teardown job: drops the site with root database credentials resolved by
/// the operator. Site-scoped credentials intentionally cannot do this.
pub fn delete_job(
    site: &Site,
    bench_name: &str,
    image: &str,
    security_context: Option<PodSecurityContext>,
    with_root_credentials: bool,
) -> Job {
    let root_flags = if with_root_credentials {
        format!(
            r#" \
  --db-root-username "$(cat {p}/db_root_user)" \
  --db-root-password "$(cat {p}/db_root_password)""#,
            p = SECRETS_MOUNT_PATH
        )
    } else {
        String::new()
    };
    let script = format!(
        r#"set -e
cd /home/frappe/frappe-bench
SITE_NAME="$(cat {p}/site_name)"
if [ ! -d "sites/$SITE_NAME" ]; then
  echo "site $SITE_NAME is already gone"
  exit 0
fi
bench drop-site "$SITE_NAME" --force --no-backup{root_flags}
"#,
        p = SECRETS_MOUNT_PATH
    );

    job(
        site,
        bench_name,
        delete_job_name(&site.name_any()),
        "delete",
        image,
        security_context,
        script,
        deletion_secret_name(&site.name_any()),
        DELETION_SECRET_MODE,
    )
}

#[allow(clippy::too_many_arguments)]
fn job(
    site: &Site,
    bench_name: &str,
    name: String,
    component: &str,
    image: &str,
    security_context: Option<PodSecurityContext>,
    script: String,
    secret_name: String,
    secret_mode: i32,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: site.namespace(),
            labels: Some(child_labels(bench_name, component)),
            owner_references: site.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(child_labels(bench_name, component)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    security_context,
                    containers: vec![Container {
                        name: component.to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec!["/bin/bash".to_string(), "-c".to_string(), script]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: SITES_VOLUME.to_string(),
                                mount_path: SITES_MOUNT_PATH.to_string(),
                                ..VolumeMount::default()
                            },
                            VolumeMount {
                                name: SECRETS_VOLUME.to_string(),
                                mount_path: SECRETS_MOUNT_PATH.to_string(),
                                read_only: Some(true),
                                ..VolumeMount::default()
                            },
                        ]),
                        ..Container::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: SITES_VOLUME.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: sites_pvc_name(bench_name),
                                read_only: None,
                            }),
                            ..Volume::default()
                        },
                        Volume {
                            name: SECRETS_VOLUME.to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(secret_name),
                                default_mode: Some(secret_mode),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::site::SiteSpec;

    fn site(apps: Vec<String>) -> Site {
        let mut site = Site::new(
            "s1",
            SiteSpec {
                bench: "b1".into(),
                site_name: "acme".into(),
                domain: None,
                db: None,
                ingress: Default::default(),
                tls: Default::default(),
                admin_password_secret: None,
                apps,
            },
        );
        site.meta_mut().namespace = Some("tenants".into());
        site
    }

    fn container_of(job: &Job) -> &Container {
        &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn init_script_embeds_only_validated_install_flags() {
        let job = init_job(
            &site(vec!["erpnext".into(), "hrms".into()]),
            "b1",
            "frappe/erpnext:v15",
            None,
            &["erpnext".to_string(), "hrms".to_string()],
            DbProvider::MariaDb,
        );
        let script = &container_of(&job).command.as_ref().unwrap()[2];
        assert!(script.contains("--install-app=erpnext --install-app=hrms"));
        assert!(script.contains("--db-type mariadb"));
        assert_eq!(job.metadata.name.as_deref(), Some("s1-init"));
    }

    #[test]
    fn sqlite_sites_skip_database_flags() {
        let job = init_job(
            &site(vec![]),
            "b1",
            "frappe/erpnext:v15",
            None,
            &[],
            DbProvider::Sqlite,
        );
        let script = &container_of(&job).command.as_ref().unwrap()[2];
        assert!(script.contains("--db-type sqlite"));
        assert!(!script.contains("db_host"));
    }

    #[test]
    fn credentials_never_travel_through_the_environment() {
        for job in [
            init_job(
                &site(vec![]),
                "b1",
                "frappe/erpnext:v15",
                None,
                &[],
                DbProvider::MariaDb,
            ),
            delete_job(&site(vec![]), "b1", "frappe/erpnext:v15", None, true),
        ] {
            let container = container_of(&job);
            assert!(container.env.is_none(), "no env vars at all");
            assert!(container.env_from.is_none(), "no envFrom either");
        }
    }

    #[test]
    fn deletion_inputs_are_owner_only_and_read_only() {
        let job = delete_job(&site(vec![]), "b1", "frappe/erpnext:v15", None, true);
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let secret_volume = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.secret.is_some())
            .unwrap();
        assert_eq!(
            secret_volume.secret.as_ref().unwrap().default_mode,
            Some(0o400)
        );
        assert_eq!(
            secret_volume.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("s1-deletion-secret")
        );
        let mount = container_of(&job)
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == SECRETS_VOLUME)
            .unwrap();
        assert_eq!(mount.read_only, Some(true));
        let script = &container_of(&job).command.as_ref().unwrap()[2];
        assert!(script.contains("db_root_user"));
        assert!(script.contains("drop-site"));
    }

    #[test]
    fn jobs_mount_the_bench_sites_volume() {
        let job = init_job(
            &site(vec![]),
            "b1",
            "frappe/erpnext:v15",
            None,
            &[],
            DbProvider::MariaDb,
        );
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let claim = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find_map(|v| v.persistent_volume_claim.as_ref())
            .unwrap();
        assert_eq!(claim.claim_name, "b1-sites");
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
    }
}
