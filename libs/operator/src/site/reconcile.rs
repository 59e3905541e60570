use crate::backoff;
use crate::bench::resources as bench_resources;
use crate::conditions::{
    self, Phase, BENCH_READY, DATABASE_READY, DEGRADED, PROGRESSING, READY, TERMINATING,
};
use crate::config::DEFAULT_FRAPPE_IMAGE;
use crate::context::Context;
use crate::crd::bench::Bench;
use crate::crd::route::Route;
use crate::crd::site::{Site, SiteStatus};
use crate::ensure::{self, Applied};
use crate::error::{Error, Result};
use crate::finalizer::{self, SITE_FINALIZER};
use crate::job::{self, JobState};
use crate::site::controller::CONTROLLER_ID;
use crate::site::database;
use crate::site::domain;
use crate::site::jobs;
use crate::site::resources;
use crate::telemetry;

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{field, info, instrument, Span};

#[instrument(skip(ctx, site), fields(trace_id))]
pub async fn reconcile_site(site: Arc<Site>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(CONTROLLER_ID, &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = site
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = site.name_any();
    let sites: Api<Site> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(msg = "reconciling site", %namespace, %name);

    if site.meta().deletion_timestamp.is_some() {
        return finalize(&site, &sites, &ctx, &namespace).await;
    }

    if finalizer::ensure_finalizer(&sites, site.as_ref(), SITE_FINALIZER).await? {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if let Ok(list) = sites.list_metadata(&ListParams::default()).await {
        ctx.metrics
            .resources_set("Site", &namespace, list.items.len() as i64);
    }

    apply(&site, &sites, &ctx, &namespace).await
}

async fn apply(site: &Site, sites: &Api<Site>, ctx: &Context, namespace: &str) -> Result<Action> {
    let generation = site.metadata.generation;

    // Settled objects: Ready stays quiet until the spec moves, Failed is
    // terminal until the spec moves.
    if let Some(status) = &site.status {
        if status.observed_generation == generation {
            match status.phase {
                Phase::Ready => return Ok(Action::requeue(Duration::from_secs(300))),
                Phase::Failed => return Ok(Action::await_change()),
                _ => {}
            }
        }
    }

    if site.spec.bench.trim().is_empty() || site.spec.site_name.trim().is_empty() {
        let message = "spec.bench and spec.siteName are required";
        let transitioned = write_status(sites, site, |status| {
            status.phase = Phase::Failed;
            status.observed_generation = generation;
            upsert(
                status,
                conditions::condition(generation, READY, false, "ValidationFailed", message),
            );
        })
        .await?;
        publish_transition(ctx, site, transitioned).await;
        ctx.publish(
            site,
            EventType::Warning,
            "ValidationFailed",
            "Reconciling",
            message.to_string(),
        )
        .await;
        return Ok(Action::await_change());
    }

    let (apps, dropped) = validate_apps(&site.spec.apps);
    for app in &dropped {
        ctx.publish(
            site,
            EventType::Warning,
            "InvalidAppName",
            "Reconciling",
            format!("dropping app {app:?}: names are limited to [A-Za-z0-9_-]"),
        )
        .await;
    }

    // No init work happens unless the bench is Ready at this moment.
    let benches: Api<Bench> = Api::namespaced(ctx.client.clone(), namespace);
    let bench = match benches.get_opt(&site.spec.bench).await? {
        None => {
            return wait_for_bench(
                site,
                sites,
                ctx,
                generation,
                "BenchNotFound",
                &format!("bench {} does not exist", site.spec.bench),
            )
            .await;
        }
        Some(bench)
            if bench
                .status
                .as_ref()
                .map(|s| s.phase != Phase::Ready)
                .unwrap_or(true) =>
        {
            return wait_for_bench(
                site,
                sites,
                ctx,
                generation,
                "BenchNotReady",
                &format!("bench {} is not Ready", site.spec.bench),
            )
            .await;
        }
        Some(bench) => bench,
    };

    let db = database::provision(site, &bench, ctx, namespace).await?;
    if let Some(reason) = &db.degraded {
        ctx.publish(
            site,
            EventType::Warning,
            "ExternalDependencyMissing",
            "Reconciling",
            reason.clone(),
        )
        .await;
    }
    if !db.ready {
        let degraded = db.degraded.clone();
        let transitioned = write_status(sites, site, |status| {
            status.phase = Phase::Provisioning;
            upsert(
                status,
                conditions::condition(generation, BENCH_READY, true, "BenchReady", ""),
            );
            upsert(
                status,
                conditions::condition(
                    generation,
                    DATABASE_READY,
                    false,
                    "DatabaseProvisioning",
                    degraded.as_deref().unwrap_or("waiting for the database operator"),
                ),
            );
            upsert(
                status,
                match &degraded {
                    Some(reason) => {
                        conditions::condition(generation, DEGRADED, true, "ExternalSystem", reason)
                    }
                    None => conditions::condition(generation, DEGRADED, false, "Healthy", ""),
                },
            );
            upsert(
                status,
                conditions::condition(generation, PROGRESSING, true, "Reconciling", ""),
            );
        })
        .await?;
        publish_transition(ctx, site, transitioned).await;
        let delay = backoff::bump(sites, site).await?;
        return Ok(Action::requeue(delay));
    }

    // The effective domain feeds the init inputs, so it resolves up front.
    let needs_detection = site.spec.domain.as_deref().map_or(true, str::is_empty)
        && bench.spec.domain.suffix.as_deref().map_or(true, str::is_empty)
        && bench.spec.domain.autodetect
        && !domain::is_local_only(&site.spec.site_name);
    let services = if needs_detection {
        Api::<Service>::namespaced(ctx.client.clone(), namespace)
            .list(&ListParams::default())
            .await?
            .items
    } else {
        Vec::new()
    };
    let resolved = domain::resolve_domain(
        &site.spec.site_name,
        site.spec.domain.as_deref(),
        bench.spec.domain.suffix.as_deref(),
        bench.spec.domain.autodetect,
        &services,
    );

    let admin_password = admin_password(site, ctx, namespace).await?;

    // Extra bench repositories ride along only when the operator may fetch
    // over git; their names pass the same validator as installable apps.
    let extra_apps = if ctx.config.git_enabled {
        let mut lines = Vec::new();
        for app in &bench.spec.extra_apps {
            if !is_valid_app_name(&app.name) {
                ctx.publish(
                    site,
                    EventType::Warning,
                    "InvalidAppName",
                    "Reconciling",
                    format!("dropping extra app {:?}: names are limited to [A-Za-z0-9_-]", app.name),
                )
                .await;
                continue;
            }
            let branch = app
                .branch
                .as_ref()
                .map(|b| format!(" {b}"))
                .unwrap_or_default();
            lines.push(format!("{} {}{branch}", app.name, app.url));
        }
        (!lines.is_empty()).then(|| lines.join("\n"))
    } else {
        None
    };

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let init_secret = resources::init_secret(
        site,
        &bench.name_any(),
        &resolved.domain,
        &admin_password,
        &apps,
        &db.info,
        db.creds.as_ref(),
        extra_apps.as_deref(),
    );
    let secret_name = init_secret.name_any();
    let (_, applied) = ensure::ensure(&secrets, init_secret, ensure::merge_secret).await?;
    note_created(ctx, site, applied, "Secret", &secret_name).await;

    let image = bench_resources::resolve_image(&bench, &ctx.config);
    let security_context = bench_resources::security_context(&bench, &ctx.facts, &ctx.config);
    let provider = database::effective_provider(site, Some(&bench));
    let jobs_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let init_job = jobs::init_job(
        site,
        &bench.name_any(),
        &image,
        security_context,
        &apps,
        provider,
    );
    let job_name = init_job.name_any();
    let (live_job, applied) = ensure::ensure(&jobs_api, init_job, ensure::create_only).await?;
    note_created(ctx, site, applied, "Job", &job_name).await;

    let state = job::job_state(&live_job);
    ctx.metrics
        .job_status_set("Site", namespace, &job_name, state.outcome());
    match state {
        JobState::Failed => {
            let message = job::last_pod_message(ctx.client.clone(), namespace, &job_name)
                .await
                .unwrap_or_else(|| "init job failed".to_string());
            let transitioned = write_status(sites, site, |status| {
                status.phase = Phase::Failed;
                status.observed_generation = generation;
                upsert(
                    status,
                    conditions::condition(generation, READY, false, "InitJobFailed", &message),
                );
                upsert(
                    status,
                    conditions::condition(generation, PROGRESSING, false, "Halted", ""),
                );
            })
            .await?;
            publish_transition(ctx, site, transitioned).await;
            ctx.publish(
                site,
                EventType::Warning,
                "InitJobFailed",
                "Reconciling",
                message,
            )
            .await;
            // The job is kept for inspection and never recreated here.
            return Ok(Action::await_change());
        }
        JobState::Missing | JobState::Active => {
            let transitioned = write_status(sites, site, |status| {
                status.phase = Phase::Provisioning;
                upsert(
                    status,
                    conditions::condition(generation, BENCH_READY, true, "BenchReady", ""),
                );
                upsert(
                    status,
                    conditions::condition(generation, DATABASE_READY, true, "DatabaseReady", ""),
                );
                upsert(
                    status,
                    conditions::condition(generation, PROGRESSING, true, "Initializing", ""),
                );
            })
            .await?;
            publish_transition(ctx, site, transitioned).await;
            return Ok(Action::requeue(Duration::from_secs(15)));
        }
        JobState::Succeeded => {}
    }

    if site.spec.ingress.enabled {
        if ctx.facts.platform.is_openshift() {
            let routes: Api<Route> = Api::namespaced(ctx.client.clone(), namespace);
            let desired = resources::route(site, &bench.name_any(), &resolved.domain);
            let route_name = desired.name_any();
            let (_, applied) = ensure::ensure(&routes, desired, |live, want| {
                (live.spec != want.spec).then(|| {
                    let mut updated = live.clone();
                    updated.spec = want.spec;
                    updated
                })
            })
            .await?;
            note_created(ctx, site, applied, "Route", &route_name).await;
        } else {
            let ingresses: Api<Ingress> = Api::namespaced(ctx.client.clone(), namespace);
            let desired = resources::ingress(site, &bench.name_any(), &resolved.domain);
            let ingress_name = desired.name_any();
            let (_, applied) = ensure::ensure(&ingresses, desired, ensure::merge_ingress).await?;
            note_created(ctx, site, applied, "Ingress", &ingress_name).await;
        }
    }

    let scheme = if site.spec.tls.enabled { "https" } else { "http" };
    let transitioned = write_status(sites, site, |status| {
        status.phase = Phase::Ready;
        status.observed_generation = generation;
        status.resolved_domain = Some(resolved.domain.clone());
        status.domain_source = Some(resolved.source);
        status.site_url = Some(format!("{scheme}://{}", resolved.domain));
        upsert(
            status,
            conditions::condition(generation, READY, true, "SiteReady", ""),
        );
        upsert(
            status,
            conditions::condition(generation, PROGRESSING, false, "Stable", ""),
        );
        upsert(
            status,
            conditions::condition(generation, BENCH_READY, true, "BenchReady", ""),
        );
        upsert(
            status,
            conditions::condition(generation, DATABASE_READY, true, "DatabaseReady", ""),
        );
        upsert(
            status,
            conditions::condition(generation, DEGRADED, false, "Healthy", ""),
        );
    })
    .await?;
    publish_transition(ctx, site, transitioned).await;
    backoff::reset(sites, site).await?;
    Ok(Action::requeue(Duration::from_secs(300)))
}

/// Deletion: destructive cleanup runs as a Job with root credentials before
/// the finalizer is released. A failed run keeps the finalizer so the
/// operator can inspect the job.
async fn finalize(site: &Site, sites: &Api<Site>, ctx: &Context, namespace: &str) -> Result<Action> {
    if !site.finalizers().iter().any(|f| f == SITE_FINALIZER) {
        return Ok(Action::await_change());
    }
    let generation = site.metadata.generation;

    let transitioned = write_status(sites, site, |status| {
        status.phase = Phase::Terminating;
        upsert(
            status,
            conditions::condition(generation, TERMINATING, true, "TearingDown", ""),
        );
    })
    .await?;
    publish_transition(ctx, site, transitioned).await;

    let benches: Api<Bench> = Api::namespaced(ctx.client.clone(), namespace);
    let bench = benches.get_opt(&site.spec.bench).await?;

    let root = database::root_credentials(site, bench.as_ref(), ctx, namespace).await?;

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let deletion_secret = resources::deletion_secret(site, root.as_ref());
    ensure::ensure(&secrets, deletion_secret, ensure::merge_secret).await?;

    let image = bench
        .as_ref()
        .map(|b| bench_resources::resolve_image(b, &ctx.config))
        .unwrap_or_else(|| {
            ctx.config
                .default_frappe_image
                .clone()
                .unwrap_or_else(|| DEFAULT_FRAPPE_IMAGE.to_string())
        });
    let security_context = bench
        .as_ref()
        .and_then(|b| bench_resources::security_context(b, &ctx.facts, &ctx.config));

    let jobs_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let delete_job = jobs::delete_job(
        site,
        &site.spec.bench,
        &image,
        security_context,
        root.is_some(),
    );
    let job_name = delete_job.name_any();
    let (live_job, applied) = ensure::ensure(&jobs_api, delete_job, ensure::create_only).await?;
    note_created(ctx, site, applied, "Job", &job_name).await;

    let state = job::job_state(&live_job);
    ctx.metrics
        .job_status_set("Site", namespace, &job_name, state.outcome());
    match state {
        JobState::Succeeded => {
            finalizer::remove_finalizer(sites, site, SITE_FINALIZER).await?;
            Ok(Action::await_change())
        }
        JobState::Failed => {
            let message = job::last_pod_message(ctx.client.clone(), namespace, &job_name)
                .await
                .unwrap_or_else(|| "delete job failed".to_string());
            write_status(sites, site, |status| {
                upsert(
                    status,
                    conditions::condition(generation, TERMINATING, false, "DeleteJobFailed", &message),
                );
            })
            .await?;
            ctx.publish(
                site,
                EventType::Warning,
                "DeleteJobFailed",
                "Finalizing",
                message,
            )
            .await;
            Ok(Action::requeue(Duration::from_secs(300)))
        }
        JobState::Missing | JobState::Active => Ok(Action::requeue(Duration::from_secs(10))),
    }
}

async fn wait_for_bench(
    site: &Site,
    sites: &Api<Site>,
    ctx: &Context,
    generation: Option<i64>,
    reason: &str,
    message: &str,
) -> Result<Action> {
    let reason = reason.to_string();
    let message = message.to_string();
    let transitioned = write_status(sites, site, |status| {
        status.phase = Phase::Pending;
        upsert(
            status,
            conditions::condition(generation, BENCH_READY, false, &reason, &message),
        );
        upsert(
            status,
            conditions::condition(generation, PROGRESSING, true, "WaitingForBench", ""),
        );
    })
    .await?;
    publish_transition(ctx, site, transitioned).await;
    let delay = backoff::bump(sites, site).await?;
    Ok(Action::requeue(delay))
}

/// Admin password for the init inputs: an explicit secret reference wins,
/// otherwise a generated per-site secret is created once and reused.
async fn admin_password(site: &Site, ctx: &Context, namespace: &str) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    if let Some(reference) = &site.spec.admin_password_secret {
        let secret = secrets.get_opt(&reference.name).await?.ok_or_else(|| {
            Error::External(format!("admin password secret {} not found", reference.name))
        })?;
        let key = reference.key.clone().unwrap_or_else(|| "password".to_string());
        return database::read_secret_key(&secret, &key);
    }

    let name = jobs::admin_secret_name(&site.name_any());
    if let Some(existing) = secrets.get_opt(&name).await? {
        return database::read_secret_key(&existing, "password");
    }
    let password = database::generate_password();
    secrets
        .create(
            &kube::api::PostParams::default(),
            &resources::admin_secret(site, &password),
        )
        .await?;
    Ok(password)
}

/// Apps that may reach the job script: `[A-Za-z0-9_-]+` only, so no shell
/// metacharacter can enter the child container's command.
pub fn validate_apps(apps: &[String]) -> (Vec<String>, Vec<String>) {
    apps.iter().cloned().partition(|name| is_valid_app_name(name))
}

fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn upsert(status: &mut SiteStatus, condition: Condition) {
    let mut conditions = status.conditions.take().unwrap_or_default();
    conditions::set_condition(&mut conditions, condition);
    status.conditions = Some(conditions);
}

async fn write_status<F>(api: &Api<Site>, site: &Site, mutate: F) -> Result<Option<Phase>>
where
    F: Fn(&mut SiteStatus),
{
    let current = site.status.clone().unwrap_or_default();
    let mut next = current.clone();
    mutate(&mut next);
    if next == current {
        return Ok(None);
    }
    let next_phase = next.phase;
    ensure::update_status(api, &site.name_any(), move |obj: &mut Site| {
        obj.status = Some(next.clone());
    })
    .await?;
    Ok((current.phase != next_phase).then_some(next_phase))
}

async fn publish_transition(ctx: &Context, site: &Site, transitioned: Option<Phase>) {
    if let Some(phase) = transitioned {
        ctx.publish(
            site,
            EventType::Normal,
            "PhaseTransition",
            "Reconciling",
            format!("site entered phase {phase}"),
        )
        .await;
    }
}

async fn note_created(ctx: &Context, site: &Site, applied: Applied, kind: &str, name: &str) {
    if applied == Applied::Created {
        ctx.publish(
            site,
            EventType::Normal,
            "Created",
            "Reconciling",
            format!("created {kind} {name}"),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_metacharacters_are_dropped() {
        let (valid, dropped) = validate_apps(&[
            "erpnext".to_string(),
            "invalid@app".to_string(),
            "hrms".to_string(),
        ]);
        assert_eq!(valid, vec!["erpnext".to_string(), "hrms".to_string()]);
        assert_eq!(dropped, vec!["invalid@app".to_string()]);
    }

    #[test]
    fn injection_attempts_never_pass() {
        for name in ["a;rm -rf /", "$(reboot)", "a b", "", "app`id`", "a|b", "a&&b"] {
            assert!(!is_valid_app_name(name), "{name:?} must be rejected");
        }
        for name in ["erpnext", "frappe_hr", "my-app", "App2"] {
            assert!(is_valid_app_name(name), "{name:?} must be accepted");
        }
    }
}
