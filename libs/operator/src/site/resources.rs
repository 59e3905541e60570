//! Pure builders for the Site's secrets and external endpoint.

use crate::bench::resources::{nginx_service_name, NGINX_PORT};
use crate::crd::route::{Route, RoutePort, RouteSpec, RouteTargetReference, RouteTls};
use crate::crd::site::Site;
use crate::site::database::{DbCreds, DbInfo};
use crate::site::jobs::{admin_secret_name, deletion_secret_name, init_secret_name};
use crate::{MANAGED_BY, MANAGED_BY_LABEL};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};

pub const CERT_MANAGER_ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";

pub fn ingress_name(site: &str) -> String {
    format!("{site}-ingress")
}

pub fn tls_secret_name(site: &Site) -> String {
    site.spec
        .tls
        .secret_name
        .clone()
        .unwrap_or_else(|| format!("{}-tls", site.name_any()))
}

fn site_labels(site: &Site) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        ("frappeop.rs/site".to_string(), site.name_any()),
    ])
}

fn owned_metadata(site: &Site, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: site.namespace(),
        labels: Some(site_labels(site)),
        owner_references: site.controller_owner_ref(&()).map(|o| vec![o]),
        ..ObjectMeta::default()
    }
}

fn opaque_secret(site: &Site, name: String, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: owned_metadata(site, name),
        string_data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    }
}

/// Inputs of the init Job, one file per key. `extra_apps` carries the
/// bench's additional repositories (one `name url [branch]` per line) and is
/// only present when the operator has git fetching enabled.
pub fn init_secret(
    site: &Site,
    bench_name: &str,
    domain: &str,
    admin_password: &str,
    apps: &[String],
    info: &DbInfo,
    creds: Option<&DbCreds>,
    extra_apps: Option<&str>,
) -> Secret {
    let mut data = BTreeMap::from([
        ("site_name".to_string(), site.spec.site_name.clone()),
        ("domain".to_string(), domain.to_string()),
        ("admin_password".to_string(), admin_password.to_string()),
        ("bench_name".to_string(), bench_name.to_string()),
        ("db_provider".to_string(), info.provider.as_str().to_string()),
        ("apps_to_install".to_string(), apps.join(" ")),
    ]);
    if let Some(creds) = creds {
        data.insert("db_host".to_string(), info.host.clone());
        data.insert("db_port".to_string(), info.port.to_string());
        data.insert("db_name".to_string(), info.name.clone());
        data.insert("db_user".to_string(), creds.username.clone());
        data.insert("db_password".to_string(), creds.password.clone());
    }
    if let Some(extra_apps) = extra_apps {
        data.insert("extra_apps".to_string(), extra_apps.to_string());
    }
    opaque_secret(site, init_secret_name(&site.name_any()), data)
}

/// Inputs of the delete Job. Root credentials are present only when the
/// provider has any; SQLite teardown is pure file removal.
pub fn deletion_secret(site: &Site, root: Option<&(String, String)>) -> Secret {
    let mut data = BTreeMap::from([("site_name".to_string(), site.spec.site_name.clone())]);
    if let Some((user, password)) = root {
        data.insert("db_root_user".to_string(), user.clone());
        data.insert("db_root_password".to_string(), password.clone());
    }
    opaque_secret(site, deletion_secret_name(&site.name_any()), data)
}

pub fn admin_secret(site: &Site, password: &str) -> Secret {
    opaque_secret(
        site,
        admin_secret_name(&site.name_any()),
        BTreeMap::from([("password".to_string(), password.to_string())]),
    )
}

/// Ingress pointing the resolved domain at the bench's nginx edge.
pub fn ingress(site: &Site, bench_name: &str, domain: &str) -> Ingress {
    let mut annotations = site.spec.ingress.annotations.clone().unwrap_or_default();
    if let Some(issuer) = &site.spec.tls.issuer {
        annotations.insert(CERT_MANAGER_ISSUER_ANNOTATION.to_string(), issuer.clone());
    }
    let mut metadata = owned_metadata(site, ingress_name(&site.name_any()));
    if !annotations.is_empty() {
        metadata.annotations = Some(annotations);
    }

    Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: site.spec.ingress.class_name.clone(),
            rules: Some(vec![IngressRule {
                host: Some(domain.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: nginx_service_name(bench_name),
                                port: Some(ServiceBackendPort {
                                    number: Some(NGINX_PORT),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            tls: site.spec.tls.enabled.then(|| {
                vec![IngressTLS {
                    hosts: Some(vec![domain.to_string()]),
                    secret_name: Some(tls_secret_name(site)),
                }]
            }),
            ..IngressSpec::default()
        }),
        status: None,
    }
}

/// Route rendered instead of an Ingress on the managed-security platform.
pub fn route(site: &Site, bench_name: &str, domain: &str) -> Route {
    let mut route = Route::new(
        &site.name_any(),
        RouteSpec {
            host: Some(domain.to_string()),
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: nginx_service_name(bench_name),
                weight: Some(100),
            },
            port: Some(RoutePort {
                target_port: IntOrString::Int(NGINX_PORT),
            }),
            tls: site.spec.tls.enabled.then(|| RouteTls {
                termination: "edge".to_string(),
                insecure_edge_termination_policy: Some("Redirect".to_string()),
            }),
        },
    );
    route.metadata = owned_metadata(site, site.name_any());
    route
}
