use crate::error::{Error, Result};

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    Container, PodSecurityContext, PodTemplateSpec, Secret, Service, Volume,
};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};

/// Bound on optimistic-concurrency retries for status writes.
pub const STATUS_CONFLICT_RETRIES: u32 = 5;

/// What `ensure` did to the child resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

/// Reconcile one child resource: create it when missing, otherwise let
/// `merge` decide whether the semantically-mutable subset drifted. `merge`
/// receives the live object and the desired one and returns the merged copy
/// to write, or `None` when the live object is already in shape. Merged
/// copies are based on the live object so server-assigned defaults and
/// immutable fields survive the update.
pub async fn ensure<K, F>(api: &Api<K>, desired: K, merge: F) -> Result<(K, Applied)>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: FnOnce(&K, K) -> Option<K>,
{
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    match api.get_opt(&name).await? {
        None => Ok((
            api.create(&PostParams::default(), &desired).await?,
            Applied::Created,
        )),
        Some(existing) => match merge(&existing, desired) {
            Some(updated) => Ok((
                api.replace(&name, &PostParams::default(), &updated).await?,
                Applied::Updated,
            )),
            None => Ok((existing, Applied::Unchanged)),
        },
    }
}

/// Merge policy for resources the operator never updates in place (Jobs,
/// PVCs): whatever exists wins.
pub fn create_only<K>(_existing: &K, _desired: K) -> Option<K> {
    None
}

/// Read-modify-write on the status subresource with bounded conflict retry.
/// `mutate` re-applies the logical status diff to each freshly fetched copy.
pub async fn update_status<K, F>(api: &Api<K>, name: &str, mutate: F) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: Fn(&mut K),
{
    let mut conflicts = 0;
    loop {
        let mut obj = api.get_status(name).await?;
        mutate(&mut obj);
        let data = serde_json::to_vec(&obj)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(updated) => return Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 && conflicts < STATUS_CONFLICT_RETRIES => {
                conflicts += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// Drift detection compares only the fields the renderer produces. The API
// server fills in a long tail of defaults (termination paths, pull policies,
// port protocols); comparing whole specs would report permanent drift.

#[derive(PartialEq)]
struct ContainerFacet {
    name: String,
    image: Option<String>,
    command: Option<Vec<String>>,
    args: Option<Vec<String>>,
    env: Vec<(String, Option<String>)>,
    resources: Option<k8s_openapi::api::core::v1::ResourceRequirements>,
    mounts: Vec<(String, String, Option<String>, Option<bool>)>,
    ports: Vec<i32>,
}

fn container_facet(c: &Container) -> ContainerFacet {
    ContainerFacet {
        name: c.name.clone(),
        image: c.image.clone(),
        command: c.command.clone(),
        args: c.args.clone(),
        env: c
            .env
            .iter()
            .flatten()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect(),
        resources: c.resources.clone(),
        mounts: c
            .volume_mounts
            .iter()
            .flatten()
            .map(|m| {
                (
                    m.name.clone(),
                    m.mount_path.clone(),
                    m.sub_path.clone(),
                    m.read_only,
                )
            })
            .collect(),
        ports: c
            .ports
            .iter()
            .flatten()
            .map(|p| p.container_port)
            .collect(),
    }
}

#[derive(PartialEq)]
struct VolumeFacet {
    name: String,
    secret: Option<(Option<String>, Option<i32>)>,
    claim: Option<String>,
}

fn volume_facet(v: &Volume) -> VolumeFacet {
    VolumeFacet {
        name: v.name.clone(),
        secret: v
            .secret
            .as_ref()
            .map(|s| (s.secret_name.clone(), s.default_mode)),
        claim: v
            .persistent_volume_claim
            .as_ref()
            .map(|c| c.claim_name.clone()),
    }
}

struct PodFacet {
    containers: Vec<ContainerFacet>,
    volumes: Vec<VolumeFacet>,
    security_context: Option<PodSecurityContext>,
}

fn pod_facet(template: &PodTemplateSpec) -> PodFacet {
    let spec = template.spec.as_ref();
    PodFacet {
        containers: spec
            .map(|s| s.containers.iter().map(container_facet).collect())
            .unwrap_or_default(),
        volumes: spec
            .and_then(|s| s.volumes.as_ref())
            .map(|v| v.iter().map(volume_facet).collect())
            .unwrap_or_default(),
        security_context: spec.and_then(|s| s.security_context.clone()),
    }
}

fn template_drifted(live: &PodTemplateSpec, want: &PodTemplateSpec) -> bool {
    let live = pod_facet(live);
    let want = pod_facet(want);
    live.containers != want.containers
        || live.volumes != want.volumes
        || live.security_context != want.security_context
}

pub fn merge_deployment(existing: &Deployment, desired: Deployment) -> Option<Deployment> {
    let drifted = match (existing.spec.as_ref(), desired.spec.as_ref()) {
        (Some(live), Some(want)) => {
            live.replicas != want.replicas || template_drifted(&live.template, &want.template)
        }
        _ => true,
    };
    if !drifted {
        return None;
    }
    let mut updated = existing.clone();
    if let (Some(live), Some(want)) = (updated.spec.as_mut(), desired.spec) {
        live.replicas = want.replicas;
        live.template = want.template;
    }
    Some(updated)
}

/// StatefulSet selector, serviceName and volumeClaimTemplates are immutable;
/// only replicas and the pod template are carried over.
pub fn merge_statefulset(existing: &StatefulSet, desired: StatefulSet) -> Option<StatefulSet> {
    let drifted = match (existing.spec.as_ref(), desired.spec.as_ref()) {
        (Some(live), Some(want)) => {
            live.replicas != want.replicas || template_drifted(&live.template, &want.template)
        }
        _ => true,
    };
    if !drifted {
        return None;
    }
    let mut updated = existing.clone();
    if let (Some(live), Some(want)) = (updated.spec.as_mut(), desired.spec) {
        live.replicas = want.replicas;
        live.template = want.template;
    }
    Some(updated)
}

/// Service clusterIP and selector are never touched; only the port set is
/// kept in sync.
pub fn merge_service(existing: &Service, desired: Service) -> Option<Service> {
    let port_facet = |svc: &Service| -> Vec<(Option<String>, i32, Option<IntOrString>)> {
        svc.spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| (p.name.clone(), p.port, p.target_port.clone()))
                    .collect()
            })
            .unwrap_or_default()
    };
    if port_facet(existing) == port_facet(&desired) {
        return None;
    }
    let mut updated = existing.clone();
    if let (Some(live), Some(want)) = (updated.spec.as_mut(), desired.spec) {
        live.ports = want.ports;
    }
    Some(updated)
}

pub fn merge_secret(existing: &Secret, desired: Secret) -> Option<Secret> {
    let want = desired.string_data.clone().unwrap_or_default();
    let have = existing.data.clone().unwrap_or_default();
    let unchanged = want.len() == have.len()
        && want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|stored| stored.0 == v.as_bytes()));
    if unchanged {
        return None;
    }
    let mut updated = existing.clone();
    // Dropping `data` makes the replace authoritative: stale keys go away
    // instead of being merged with the new string_data.
    updated.data = None;
    updated.string_data = desired.string_data;
    Some(updated)
}

pub fn merge_cronjob(existing: &CronJob, desired: CronJob) -> Option<CronJob> {
    let drifted = match (existing.spec.as_ref(), desired.spec.as_ref()) {
        (Some(live), Some(want)) => {
            live.schedule != want.schedule
                || live.suspend != want.suspend
                || match (
                    live.job_template.spec.as_ref(),
                    want.job_template.spec.as_ref(),
                ) {
                    (Some(l), Some(w)) => template_drifted(&l.template, &w.template),
                    _ => true,
                }
        }
        _ => true,
    };
    if !drifted {
        return None;
    }
    let mut updated = existing.clone();
    if let (Some(live), Some(want)) = (updated.spec.as_mut(), desired.spec) {
        live.schedule = want.schedule;
        live.suspend = want.suspend;
        live.job_template = want.job_template;
    }
    Some(updated)
}

pub fn merge_ingress(existing: &Ingress, desired: Ingress) -> Option<Ingress> {
    type RuleFacet = Vec<(Option<String>, Vec<(Option<String>, Option<i32>)>)>;
    let rule_facet = |ing: &Ingress| -> RuleFacet {
        ing.spec
            .as_ref()
            .and_then(|s| s.rules.as_ref())
            .map(|rules| {
                rules
                    .iter()
                    .map(|r| {
                        let backends = r
                            .http
                            .as_ref()
                            .map(|h| {
                                h.paths
                                    .iter()
                                    .map(|p| {
                                        let svc = p.backend.service.as_ref();
                                        (
                                            svc.map(|s| s.name.clone()),
                                            svc.and_then(|s| s.port.as_ref()).and_then(|p| p.number),
                                        )
                                    })
                                    .collect()
                            })
                            .unwrap_or_default();
                        (r.host.clone(), backends)
                    })
                    .collect()
            })
            .unwrap_or_default()
    };
    let tls_facet = |ing: &Ingress| -> Vec<(Option<Vec<String>>, Option<String>)> {
        ing.spec
            .as_ref()
            .and_then(|s| s.tls.as_ref())
            .map(|tls| {
                tls.iter()
                    .map(|t| (t.hosts.clone(), t.secret_name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    };
    let unchanged = rule_facet(existing) == rule_facet(&desired)
        && tls_facet(existing) == tls_facet(&desired)
        && existing.metadata.annotations == desired.metadata.annotations;
    if unchanged {
        return None;
    }
    let mut updated = existing.clone();
    updated.metadata.annotations = desired.metadata.annotations;
    updated.spec = desired.spec;
    Some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::batch::v1::{CronJobSpec, JobTemplateSpec};
    use k8s_openapi::api::core::v1::{ContainerPort, PodSpec, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn deployment(replicas: i32, image: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".into()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".into(),
                            image: Some(image.into()),
                            ports: Some(vec![ContainerPort {
                                container_port: 8000,
                                ..ContainerPort::default()
                            }]),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                    ..PodTemplateSpec::default()
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    #[test]
    fn deployment_in_shape_is_left_alone() {
        let live = deployment(2, "frappe/erpnext:v15");
        let desired = deployment(2, "frappe/erpnext:v15");
        assert!(merge_deployment(&live, desired).is_none());
    }

    #[test]
    fn server_side_port_defaults_are_not_drift() {
        let mut live = deployment(2, "frappe/erpnext:v15");
        let ports = live
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers[0]
            .ports
            .as_mut()
            .unwrap();
        ports[0].protocol = Some("TCP".into());
        let desired = deployment(2, "frappe/erpnext:v15");
        assert!(merge_deployment(&live, desired).is_none());
    }

    #[test]
    fn replica_change_is_applied_on_the_live_object() {
        let mut live = deployment(2, "frappe/erpnext:v15");
        live.metadata.resource_version = Some("42".into());
        let desired = deployment(3, "frappe/erpnext:v15");
        let merged = merge_deployment(&live, desired).expect("drift detected");
        assert_eq!(merged.spec.as_ref().unwrap().replicas, Some(3));
        // live metadata (resourceVersion) survives for the optimistic replace
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn image_change_is_drift() {
        let live = deployment(2, "frappe/erpnext:v15");
        let desired = deployment(2, "frappe/erpnext:v16");
        assert!(merge_deployment(&live, desired).is_some());
    }

    #[test]
    fn service_ports_sync_without_touching_selector() {
        let service = |port: i32| Service {
            metadata: ObjectMeta::default(),
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.7".into()),
                selector: Some(BTreeMap::from([("app".to_string(), "frappe".to_string())])),
                ports: Some(vec![ServicePort {
                    port,
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        };
        assert!(merge_service(&service(8080), service(8080)).is_none());
        let merged = merge_service(&service(8080), service(9090)).expect("port drift");
        let spec = merged.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.7"));
        assert!(spec.selector.is_some());
        assert_eq!(spec.ports.unwrap()[0].port, 9090);
    }

    #[test]
    fn secret_matches_against_stored_bytes() {
        let existing = Secret {
            data: Some(BTreeMap::from([(
                "site_name".to_string(),
                k8s_openapi::ByteString(b"acme".to_vec()),
            )])),
            ..Secret::default()
        };
        let mut desired = Secret::default();
        desired.string_data = Some(BTreeMap::from([(
            "site_name".to_string(),
            "acme".to_string(),
        )]));
        assert!(merge_secret(&existing, desired.clone()).is_none());

        desired.string_data = Some(BTreeMap::from([(
            "site_name".to_string(),
            "other".to_string(),
        )]));
        let merged = merge_secret(&existing, desired).expect("key drift");
        assert!(merged.data.is_none());
        assert_eq!(
            merged.string_data.unwrap().get("site_name").unwrap(),
            "other"
        );
    }

    #[test]
    fn cronjob_schedule_updates_in_place() {
        let cronjob = |schedule: &str| CronJob {
            metadata: ObjectMeta {
                name: Some("b-backup".into()),
                ..ObjectMeta::default()
            },
            spec: Some(CronJobSpec {
                schedule: schedule.to_string(),
                job_template: JobTemplateSpec::default(),
                ..CronJobSpec::default()
            }),
            ..CronJob::default()
        };
        let mut live = cronjob("0 2 * * *");
        live.metadata.uid = Some("uid-1".into());
        assert!(merge_cronjob(&live, cronjob("0 2 * * *")).is_none());
        let merged = merge_cronjob(&live, cronjob("*/15 * * * *")).expect("schedule drift");
        assert_eq!(merged.spec.unwrap().schedule, "*/15 * * * *");
        // same object updated, not recreated
        assert_eq!(merged.metadata.uid.as_deref(), Some("uid-1"));
    }

    #[test]
    fn statefulset_resources_change_is_drift() {
        let sts = |cpu: &str| StatefulSet {
            spec: Some(k8s_openapi::api::apps::v1::StatefulSetSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "redis".into(),
                            resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                                requests: Some(BTreeMap::from([(
                                    "cpu".to_string(),
                                    Quantity(cpu.to_string()),
                                )])),
                                ..Default::default()
                            }),
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                    ..PodTemplateSpec::default()
                },
                ..Default::default()
            }),
            ..StatefulSet::default()
        };
        assert!(merge_statefulset(&sts("100m"), sts("100m")).is_none());
        assert!(merge_statefulset(&sts("100m"), sts("250m")).is_some());
    }
}
