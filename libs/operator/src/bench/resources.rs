//! Pure renderer for a Bench's child resources. Everything here is a
//! function of the Bench spec, the discovered cluster facts and the operator
//! configuration; no I/O happens in this module.

use crate::config::{ControllerConfig, DEFAULT_FRAPPE_IMAGE};
use crate::context::ClusterFacts;
use crate::crd::bench::{default_worker_classes, Bench};
use crate::{child_labels, component_labels};

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

/// In-container path of the shared sites tree. Fixed; the init and backup
/// tooling expect it.
pub const SITES_MOUNT_PATH: &str = "/home/frappe/frappe-bench/sites";
pub const SITES_VOLUME: &str = "sites";

pub const NGINX_PORT: i32 = 8080;
const WEB_PORT: i32 = 8000;
const SOCKETIO_PORT: i32 = 9000;
const REDIS_PORT: i32 = 6379;
const REDIS_IMAGE: &str = "redis:7-alpine";

pub const RWX: &str = "ReadWriteMany";
pub const RWO: &str = "ReadWriteOnce";

/// Set when a pending PVC requested ReadWriteMany and no installed storage
/// class can provision it; flips the shared volume to ReadWriteOnce.
pub const STORAGE_FALLBACK_ANNOTATION: &str = "frappeop.rs/storage-fallback";

const DEFAULT_STORAGE_SIZE: &str = "8Gi";

const AUTOSCALING_MIN_ANNOTATION: &str = "autoscaling.frappeop.rs/min-replicas";
const AUTOSCALING_MAX_ANNOTATION: &str = "autoscaling.frappeop.rs/max-replicas";
const AUTOSCALING_ZERO_ANNOTATION: &str = "autoscaling.frappeop.rs/scale-to-zero";

pub fn sites_pvc_name(bench: &str) -> String {
    format!("{bench}-sites")
}

pub fn web_service_name(bench: &str) -> String {
    format!("{bench}-web")
}

pub fn nginx_service_name(bench: &str) -> String {
    format!("{bench}-nginx")
}

pub fn socketio_service_name(bench: &str) -> String {
    format!("{bench}-socketio")
}

pub fn redis_cache_name(bench: &str) -> String {
    format!("{bench}-redis-cache")
}

pub fn redis_queue_name(bench: &str) -> String {
    format!("{bench}-redis-queue")
}

pub fn worker_name(bench: &str, queue: &str) -> String {
    format!("{bench}-worker-{queue}")
}

/// Image resolution priority: repository:tag, then repository:version, then
/// the operator ConfigMap default, then the built-in constant.
pub fn resolve_image(bench: &Bench, config: &ControllerConfig) -> String {
    if let Some(repository) = &bench.spec.image.repository {
        if let Some(tag) = &bench.spec.image.tag {
            return format!("{repository}:{tag}");
        }
        if let Some(version) = &bench.spec.version {
            return format!("{repository}:{version}");
        }
    }
    config
        .default_frappe_image
        .clone()
        .unwrap_or_else(|| DEFAULT_FRAPPE_IMAGE.to_string())
}

/// Effective access mode for the shared volume, honoring the fallback
/// annotation over the spec preference.
pub fn storage_access_mode(bench: &Bench) -> String {
    if bench
        .annotations()
        .get(STORAGE_FALLBACK_ANNOTATION)
        .is_some_and(|v| v == "true")
    {
        return RWO.to_string();
    }
    bench
        .spec
        .storage
        .access_mode
        .clone()
        .unwrap_or_else(|| RWX.to_string())
}

/// Pod security context: user override, else omitted on managed-security
/// platforms so the platform injects ids, else the configured defaults.
pub fn security_context(
    bench: &Bench,
    facts: &ClusterFacts,
    config: &ControllerConfig,
) -> Option<PodSecurityContext> {
    if let Some(sc) = &bench.spec.security_context {
        return Some(sc.clone());
    }
    if facts.platform.is_openshift() {
        return None;
    }
    Some(PodSecurityContext {
        run_as_user: Some(config.default_uid),
        run_as_group: Some(config.default_gid),
        fs_group: Some(config.default_fsgroup),
        ..PodSecurityContext::default()
    })
}

/// Child resources of one Bench, grouped in creation order: storage first,
/// then Services (so DNS resolves on pod start), then workloads.
pub struct BenchChildren {
    pub pvc: PersistentVolumeClaim,
    pub services: Vec<Service>,
    pub stateful_sets: Vec<StatefulSet>,
    pub deployments: Vec<Deployment>,
}

pub fn render(bench: &Bench, facts: &ClusterFacts, config: &ControllerConfig) -> BenchChildren {
    let name = bench.name_any();
    let namespace = bench.namespace();
    let owner = bench.controller_owner_ref(&());
    let image = resolve_image(bench, config);
    let sc = security_context(bench, facts, config);

    let ctx = RenderCtx {
        bench: &name,
        namespace: namespace.as_deref(),
        owner: owner.as_ref(),
        image: &image,
        security_context: sc.as_ref(),
    };

    let services = vec![
        ctx.service(&web_service_name(&name), "web", "http", WEB_PORT),
        ctx.service(&nginx_service_name(&name), "nginx", "http", NGINX_PORT),
        ctx.service(&socketio_service_name(&name), "socketio", "http", SOCKETIO_PORT),
        ctx.service(&redis_cache_name(&name), "redis-cache", "redis", REDIS_PORT),
        ctx.service(&redis_queue_name(&name), "redis-queue", "redis", REDIS_PORT),
    ];

    let stateful_sets = vec![
        ctx.redis_statefulset(
            &redis_cache_name(&name),
            "redis-cache",
            vec!["redis-server".into(), "--maxmemory-policy".into(), "allkeys-lru".into()],
            bench.spec.redis.cache.resources.clone(),
        ),
        ctx.redis_statefulset(
            &redis_queue_name(&name),
            "redis-queue",
            vec!["redis-server".into()],
            bench.spec.redis.queue.resources.clone(),
        ),
    ];

    let mut deployments = vec![
        ctx.frappe_deployment(
            &web_service_name(&name),
            "web",
            bench.spec.web.replicas.unwrap_or(1),
            vec![
                "/home/frappe/frappe-bench/env/bin/gunicorn".into(),
                "--bind=0.0.0.0:8000".into(),
                "--threads=4".into(),
                "--worker-tmp-dir=/dev/shm".into(),
                "--timeout=120".into(),
                "frappe.app:application".into(),
                "--preload".into(),
            ],
            Some(WEB_PORT),
            bench.spec.web.resources.clone(),
            None,
        ),
        ctx.frappe_deployment(
            &nginx_service_name(&name),
            "nginx",
            bench.spec.nginx.replicas.unwrap_or(1),
            vec!["nginx-entrypoint.sh".into()],
            Some(NGINX_PORT),
            bench.spec.nginx.resources.clone(),
            None,
        ),
        ctx.frappe_deployment(
            &socketio_service_name(&name),
            "socketio",
            bench.spec.socketio.replicas.unwrap_or(1),
            vec![
                "node".into(),
                "/home/frappe/frappe-bench/apps/frappe/socketio.js".into(),
            ],
            Some(SOCKETIO_PORT),
            bench.spec.socketio.resources.clone(),
            None,
        ),
        // Exactly one scheduler regardless of configuration; two schedulers
        // double-fire every cron entry.
        ctx.frappe_deployment(
            &format!("{name}-scheduler"),
            "scheduler",
            1,
            vec!["bench".into(), "schedule".into()],
            None,
            bench.spec.scheduler.resources.clone(),
            None,
        ),
    ];
    // An empty worker list still gets the standard queue classes; a Ready
    // bench always has at least one worker per class.
    let workers = if bench.spec.workers.is_empty() {
        default_worker_classes()
    } else {
        bench.spec.workers.clone()
    };
    for worker in &workers {
        let mut annotations = BTreeMap::new();
        if let Some(autoscaling) = &worker.autoscaling {
            if let Some(min) = autoscaling.min_replicas {
                annotations.insert(AUTOSCALING_MIN_ANNOTATION.to_string(), min.to_string());
            }
            if let Some(max) = autoscaling.max_replicas {
                annotations.insert(AUTOSCALING_MAX_ANNOTATION.to_string(), max.to_string());
            }
            if autoscaling.scale_to_zero {
                annotations.insert(AUTOSCALING_ZERO_ANNOTATION.to_string(), "true".to_string());
            }
        }
        deployments.push(ctx.frappe_deployment(
            &worker_name(&name, &worker.queue),
            &format!("worker-{}", worker.queue),
            worker.replicas.unwrap_or(1),
            vec!["bench".into(), "worker".into(), "--queue".into(), worker.queue.clone()],
            None,
            worker.resources.clone(),
            if annotations.is_empty() { None } else { Some(annotations) },
        ));
    }

    BenchChildren {
        pvc: render_pvc(bench, facts),
        services,
        stateful_sets,
        deployments,
    }
}

fn render_pvc(bench: &Bench, _facts: &ClusterFacts) -> PersistentVolumeClaim {
    let name = bench.name_any();
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(sites_pvc_name(&name)),
            namespace: bench.namespace(),
            labels: Some(child_labels(&name, "sites")),
            owner_references: bench.controller_owner_ref(&()).map(|o| vec![o]),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![storage_access_mode(bench)]),
            storage_class_name: bench.spec.storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(
                        bench
                            .spec
                            .storage
                            .size
                            .clone()
                            .unwrap_or_else(|| DEFAULT_STORAGE_SIZE.to_string()),
                    ),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        status: None,
    }
}

struct RenderCtx<'a> {
    bench: &'a str,
    namespace: Option<&'a str>,
    owner: Option<&'a OwnerReference>,
    image: &'a str,
    security_context: Option<&'a PodSecurityContext>,
}

impl RenderCtx<'_> {
    fn metadata(
        &self,
        name: &str,
        component: &str,
        annotations: Option<BTreeMap<String, String>>,
    ) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: self.namespace.map(str::to_string),
            labels: Some(child_labels(self.bench, component)),
            annotations,
            owner_references: self.owner.map(|o| vec![o.clone()]),
            ..ObjectMeta::default()
        }
    }

    fn service(&self, name: &str, component: &str, port_name: &str, port: i32) -> Service {
        Service {
            metadata: self.metadata(name, component, None),
            spec: Some(ServiceSpec {
                selector: Some(component_labels(self.bench, component)),
                ports: Some(vec![ServicePort {
                    name: Some(port_name.to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            status: None,
        }
    }

    fn common_env(&self) -> Vec<EnvVar> {
        let env = |name: &str, value: String| EnvVar {
            name: name.to_string(),
            value: Some(value),
            value_from: None,
        };
        vec![
            env(
                "REDIS_CACHE",
                format!("redis://{}:{REDIS_PORT}", redis_cache_name(self.bench)),
            ),
            env(
                "REDIS_QUEUE",
                format!("redis://{}:{REDIS_PORT}", redis_queue_name(self.bench)),
            ),
            env("SOCKETIO_PORT", SOCKETIO_PORT.to_string()),
            env(
                "BACKEND",
                format!("{}:{WEB_PORT}", web_service_name(self.bench)),
            ),
            env(
                "SOCKETIO",
                format!("{}:{SOCKETIO_PORT}", socketio_service_name(self.bench)),
            ),
        ]
    }

    fn sites_volume(&self) -> (Volume, VolumeMount) {
        (
            Volume {
                name: SITES_VOLUME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: sites_pvc_name(self.bench),
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

    #[allow(clippy::too_many_arguments)]
    fn frappe_deployment(
        &self,
        name: &str,
        component: &str,
        replicas: i32,
        command: Vec<String>,
        port: Option<i32>,
        resources: Option<ResourceRequirements>,
        annotations: Option<BTreeMap<String, String>>,
    ) -> Deployment {
        let (volume, mount) = self.sites_volume();
        Deployment {
            metadata: self.metadata(name, component, annotations),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(component_labels(self.bench, component)),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(child_labels(self.bench, component)),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        security_context: self.security_context.cloned(),
                        containers: vec![Container {
                            name: component.to_string(),
                            image: Some(self.image.to_string()),
                            command: Some(command),
                            env: Some(self.common_env()),
                            ports: port.map(|p| {
                                vec![ContainerPort {
                                    container_port: p,
                                    ..ContainerPort::default()
                                }]
                            }),
                            resources,
                            volume_mounts: Some(vec![mount]),
                            ..Container::default()
                        }],
                        volumes: Some(vec![volume]),
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            status: None,
        }
    }

    fn redis_statefulset(
        &self,
        name: &str,
        component: &str,
        command: Vec<String>,
        resources: Option<ResourceRequirements>,
    ) -> StatefulSet {
        StatefulSet {
            metadata: self.metadata(name, component, None),
            spec: Some(StatefulSetSpec {
                replicas: Some(1),
                service_name: name.to_string(),
                selector: LabelSelector {
                    match_labels: Some(component_labels(self.bench, component)),
                    match_expressions: None,
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(child_labels(self.bench, component)),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        security_context: self.security_context.cloned(),
                        containers: vec![Container {
                            name: "redis".to_string(),
                            image: Some(REDIS_IMAGE.to_string()),
                            command: Some(command),
                            ports: Some(vec![ContainerPort {
                                container_port: REDIS_PORT,
                                ..ContainerPort::default()
                            }]),
                            resources,
                            ..Container::default()
                        }],
                        ..PodSpec::default()
                    }),
                },
                ..StatefulSetSpec::default()
            }),
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PlatformFlavor;
    use crate::crd::bench::{BenchSpec, ImageConfig, WorkerAutoscaling, WorkerConfig};

    fn bench(spec: BenchSpec) -> Bench {
        let mut bench = Bench::new("b1", spec);
        bench.meta_mut().namespace = Some("tenants".into());
        bench
    }

    fn facts() -> ClusterFacts {
        ClusterFacts {
            rwx_supported: true,
            ..ClusterFacts::default()
        }
    }

    #[test]
    fn image_prefers_explicit_tag() {
        let b = bench(BenchSpec {
            version: Some("15.2.0".into()),
            image: ImageConfig {
                repository: Some("registry.example.com/frappe".into()),
                tag: Some("pinned".into()),
            },
            ..BenchSpec::default()
        });
        assert_eq!(
            resolve_image(&b, &ControllerConfig::default()),
            "registry.example.com/frappe:pinned"
        );
    }

    #[test]
    fn image_falls_back_to_version_tag() {
        let b = bench(BenchSpec {
            version: Some("15.2.0".into()),
            image: ImageConfig {
                repository: Some("registry.example.com/frappe".into()),
                tag: None,
            },
            ..BenchSpec::default()
        });
        assert_eq!(
            resolve_image(&b, &ControllerConfig::default()),
            "registry.example.com/frappe:15.2.0"
        );
    }

    #[test]
    fn image_falls_back_to_operator_config_then_builtin() {
        let b = bench(BenchSpec::default());
        let mut config = ControllerConfig::default();
        config.default_frappe_image = Some("mirror.example.com/erpnext:v15".into());
        assert_eq!(resolve_image(&b, &config), "mirror.example.com/erpnext:v15");
        assert_eq!(
            resolve_image(&b, &ControllerConfig::default()),
            DEFAULT_FRAPPE_IMAGE
        );
    }

    #[test]
    fn security_context_is_omitted_on_managed_security_platforms() {
        let b = bench(BenchSpec::default());
        let facts = ClusterFacts {
            platform: PlatformFlavor::Openshift,
            ..ClusterFacts::default()
        };
        assert!(security_context(&b, &facts, &ControllerConfig::default()).is_none());
    }

    #[test]
    fn security_context_defaults_are_pinned_elsewhere() {
        let b = bench(BenchSpec::default());
        let sc = security_context(&b, &facts(), &ControllerConfig::default()).unwrap();
        assert_eq!(sc.run_as_user, Some(1001));
        assert_eq!(sc.run_as_group, Some(1001));
        assert_eq!(sc.fs_group, Some(1001));
    }

    #[test]
    fn explicit_security_context_wins() {
        let b = bench(BenchSpec {
            security_context: Some(PodSecurityContext {
                run_as_user: Some(500),
                ..PodSecurityContext::default()
            }),
            ..BenchSpec::default()
        });
        let sc = security_context(&b, &facts(), &ControllerConfig::default()).unwrap();
        assert_eq!(sc.run_as_user, Some(500));
    }

    #[test]
    fn renders_full_component_set() {
        let children = render(
            &bench(BenchSpec::default()),
            &facts(),
            &ControllerConfig::default(),
        );
        assert_eq!(children.services.len(), 5);
        assert_eq!(children.stateful_sets.len(), 2);
        // web, nginx, socketio, scheduler + three default worker classes
        assert_eq!(children.deployments.len(), 7);
        assert_eq!(children.pvc.metadata.name.as_deref(), Some("b1-sites"));
    }

    #[test]
    fn scheduler_is_pinned_to_one_replica() {
        let mut spec = BenchSpec::default();
        spec.scheduler.replicas = Some(4);
        let children = render(&bench(spec), &facts(), &ControllerConfig::default());
        let scheduler = children
            .deployments
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some("b1-scheduler"))
            .unwrap();
        assert_eq!(scheduler.spec.as_ref().unwrap().replicas, Some(1));
    }

    #[test]
    fn service_selectors_carry_app_bench_component() {
        let children = render(
            &bench(BenchSpec::default()),
            &facts(),
            &ControllerConfig::default(),
        );
        let nginx = children
            .services
            .iter()
            .find(|s| s.metadata.name.as_deref() == Some("b1-nginx"))
            .unwrap();
        let selector = nginx.spec.as_ref().unwrap().selector.clone().unwrap();
        assert_eq!(
            selector,
            BTreeMap::from([
                ("app".to_string(), "frappe".to_string()),
                ("bench".to_string(), "b1".to_string()),
                ("component".to_string(), "nginx".to_string()),
            ])
        );
    }

    #[test]
    fn storage_fallback_annotation_downgrades_access_mode() {
        let mut b = bench(BenchSpec::default());
        assert_eq!(storage_access_mode(&b), RWX);
        b.annotations_mut()
            .insert(STORAGE_FALLBACK_ANNOTATION.to_string(), "true".to_string());
        assert_eq!(storage_access_mode(&b), RWO);
    }

    #[test]
    fn worker_autoscaling_surfaces_as_annotations() {
        let spec = BenchSpec {
            workers: vec![WorkerConfig {
                queue: "long".into(),
                replicas: Some(2),
                resources: None,
                autoscaling: Some(WorkerAutoscaling {
                    min_replicas: Some(0),
                    max_replicas: Some(8),
                    scale_to_zero: true,
                }),
            }],
            ..BenchSpec::default()
        };
        let children = render(&bench(spec), &facts(), &ControllerConfig::default());
        let worker = children
            .deployments
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some("b1-worker-long"))
            .unwrap();
        let annotations = worker.metadata.annotations.clone().unwrap();
        assert_eq!(annotations.get(AUTOSCALING_MIN_ANNOTATION).unwrap(), "0");
        assert_eq!(annotations.get(AUTOSCALING_MAX_ANNOTATION).unwrap(), "8");
        assert_eq!(annotations.get(AUTOSCALING_ZERO_ANNOTATION).unwrap(), "true");
    }

    #[test]
    fn workloads_mount_the_shared_volume_without_sub_path() {
        let children = render(
            &bench(BenchSpec::default()),
            &facts(),
            &ControllerConfig::default(),
        );
        for deployment in &children.deployments {
            let mounts = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
                .containers[0]
                .volume_mounts
                .clone()
                .unwrap();
            assert_eq!(mounts[0].mount_path, SITES_MOUNT_PATH);
            assert!(mounts[0].sub_path.is_none());
        }
    }
}
