use crate::backoff;
use crate::backup::controller::BACKUP_CONTROLLER_ID;
use crate::backup::resources;
use crate::bench::resources as bench_resources;
use crate::config::DEFAULT_FRAPPE_IMAGE;
use crate::context::Context;
use crate::crd::backup::{JobPhase, SiteBackup, SiteBackupStatus};
use crate::crd::bench::Bench;
use crate::crd::site::Site;
use crate::ensure::{self, Applied};
use crate::error::{Error, Result};
use crate::job::{self, JobState};
use crate::telemetry;

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::PodSecurityContext;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{field, info, instrument, Span};

#[instrument(skip(ctx, backup), fields(trace_id))]
pub async fn reconcile_site_backup(backup: Arc<SiteBackup>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx
        .metrics
        .reconcile
        .count_and_measure(BACKUP_CONTROLLER_ID, &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = backup
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = backup.name_any();
    let backups: Api<SiteBackup> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(msg = "reconciling site backup", %namespace, %name);

    // No finalizer: the Job/CronJob is owned and cascades on delete.
    if backup.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    if let Ok(list) = backups.list_metadata(&ListParams::default()).await {
        ctx.metrics
            .resources_set("SiteBackup", &namespace, list.items.len() as i64);
    }

    // One-shot outcomes are sticky: a finished run is never re-executed on
    // requeue, the Job object remains the durable record.
    if backup.spec.schedule.is_none() {
        if let Some(status) = &backup.status {
            if matches!(status.phase, JobPhase::Succeeded | JobPhase::Failed) {
                return Ok(Action::await_change());
            }
        }
    }

    let Some((site, bench)) = target_bench(&ctx, &namespace, &backup.spec.site).await? else {
        let message = format!("site {:?} not found in this namespace", backup.spec.site);
        let transitioned = write_status(&backups, &backup, |status| {
            status.phase = JobPhase::Pending;
            status.message = Some(message.clone());
        })
        .await?;
        publish_transition(&ctx, backup.as_ref(), transitioned).await;
        ctx.publish(
            backup.as_ref(),
            EventType::Warning,
            "TargetSiteMissing",
            "Reconciling",
            message,
        )
        .await;
        let delay = backoff::bump(&backups, backup.as_ref()).await?;
        return Ok(Action::requeue(delay));
    };

    let (image, security_context) = image_and_security(bench.as_ref(), &ctx);
    let bench_name = site.spec.bench.clone();
    let generation = backup.metadata.generation;

    if let Some(schedule) = &backup.spec.schedule {
        let cronjobs: Api<CronJob> = Api::namespaced(ctx.client.clone(), &namespace);
        let desired =
            resources::backup_cronjob(&backup, &bench_name, &image, security_context, schedule);
        let child_name = desired.name_any();
        let (_, applied) = ensure::ensure(&cronjobs, desired, ensure::merge_cronjob).await?;
        if applied == Applied::Created {
            ctx.publish(
                backup.as_ref(),
                EventType::Normal,
                "Created",
                "Reconciling",
                format!("created CronJob {child_name}"),
            )
            .await;
        }
        let transitioned = write_status(&backups, &backup, |status| {
            status.phase = JobPhase::Scheduled;
            status.message = None;
            status.observed_generation = generation;
        })
        .await?;
        publish_transition(&ctx, backup.as_ref(), transitioned).await;
        backoff::reset(&backups, backup.as_ref()).await?;
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    let jobs_api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    let desired = resources::backup_job(&backup, &bench_name, &image, security_context);
    let job_name = desired.name_any();
    let (live_job, applied) = ensure::ensure(&jobs_api, desired, ensure::create_only).await?;
    if applied == Applied::Created {
        ctx.publish(
            backup.as_ref(),
            EventType::Normal,
            "Created",
            "Reconciling",
            format!("created Job {job_name}"),
        )
        .await;
    }

    let state = job::job_state(&live_job);
    ctx.metrics
        .job_status_set("SiteBackup", &namespace, &job_name, state.outcome());
    match state {
        JobState::Succeeded => {
            let transitioned = write_status(&backups, &backup, |status| {
                status.phase = JobPhase::Succeeded;
                status.message = None;
                status.observed_generation = generation;
            })
            .await?;
            publish_transition(&ctx, backup.as_ref(), transitioned).await;
            backoff::reset(&backups, backup.as_ref()).await?;
            Ok(Action::await_change())
        }
        JobState::Failed => {
            let message = job::last_pod_message(ctx.client.clone(), &namespace, &job_name)
                .await
                .unwrap_or_else(|| "backup job failed".to_string());
            let transitioned = write_status(&backups, &backup, |status| {
                status.phase = JobPhase::Failed;
                status.message = Some(message.clone());
                status.observed_generation = generation;
            })
            .await?;
            publish_transition(&ctx, backup.as_ref(), transitioned).await;
            ctx.publish(
                backup.as_ref(),
                EventType::Warning,
                "BackupFailed",
                "Reconciling",
                message,
            )
            .await;
            Ok(Action::await_change())
        }
        JobState::Missing | JobState::Active => {
            let transitioned = write_status(&backups, &backup, |status| {
                status.phase = JobPhase::Running;
                status.message = None;
            })
            .await?;
            publish_transition(&ctx, backup.as_ref(), transitioned).await;
            Ok(Action::requeue(Duration::from_secs(15)))
        }
    }
}

/// Locate the Site whose logical name matches `site_name`, plus its bench
/// when that exists. Backups and restores target the logical site name, not
/// the resource name.
pub(crate) async fn target_bench(
    ctx: &Context,
    namespace: &str,
    site_name: &str,
) -> Result<Option<(Site, Option<Bench>)>> {
    let sites: Api<Site> = Api::namespaced(ctx.client.clone(), namespace);
    let list = sites.list(&ListParams::default()).await?;
    let Some(site) = list
        .items
        .into_iter()
        .find(|s| s.spec.site_name == site_name)
    else {
        return Ok(None);
    };
    let benches: Api<Bench> = Api::namespaced(ctx.client.clone(), namespace);
    let bench = benches.get_opt(&site.spec.bench).await?;
    Ok(Some((site, bench)))
}

pub(crate) fn image_and_security(
    bench: Option<&Bench>,
    ctx: &Context,
) -> (String, Option<PodSecurityContext>) {
    match bench {
        Some(bench) => (
            bench_resources::resolve_image(bench, &ctx.config),
            bench_resources::security_context(bench, &ctx.facts, &ctx.config),
        ),
        None => (
            ctx.config
                .default_frappe_image
                .clone()
                .unwrap_or_else(|| DEFAULT_FRAPPE_IMAGE.to_string()),
            None,
        ),
    }
}

async fn write_status<F>(
    api: &Api<SiteBackup>,
    backup: &SiteBackup,
    mutate: F,
) -> Result<Option<JobPhase>>
where
    F: Fn(&mut SiteBackupStatus),
{
    let current = backup.status.clone().unwrap_or_default();
    let mut next = current.clone();
    mutate(&mut next);
    if next == current {
        return Ok(None);
    }
    let next_phase = next.phase;
    ensure::update_status(api, &backup.name_any(), move |obj: &mut SiteBackup| {
        obj.status = Some(next.clone());
    })
    .await?;
    Ok((current.phase != next_phase).then_some(next_phase))
}

async fn publish_transition(ctx: &Context, backup: &SiteBackup, transitioned: Option<JobPhase>) {
    if let Some(phase) = transitioned {
        ctx.publish(
            backup,
            EventType::Normal,
            "PhaseTransition",
            "Reconciling",
            format!("backup entered phase {phase}"),
        )
        .await;
    }
}
