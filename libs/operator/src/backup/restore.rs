use crate::backup::controller::RESTORE_CONTROLLER_ID;
use crate::backup::reconcile::{image_and_security, target_bench};
use crate::backup::resources;
use crate::context::Context;
use crate::crd::backup::{JobPhase, RestoreArtifact, SiteRestore, SiteRestoreStatus};
use crate::ensure::{self, Applied};
use crate::error::{Error, Result};
use crate::job::{self, JobState};
use crate::site::database::read_secret_key;
use crate::telemetry;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{field, info, instrument, Span};

#[instrument(skip(ctx, restore), fields(trace_id))]
pub async fn reconcile_site_restore(restore: Arc<SiteRestore>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx
        .metrics
        .reconcile
        .count_and_measure(RESTORE_CONTROLLER_ID, &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = restore
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = restore.name_any();
    let restores: Api<SiteRestore> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(msg = "reconciling site restore", %namespace, %name);

    if restore.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    if let Ok(list) = restores.list_metadata(&ListParams::default()).await {
        ctx.metrics
            .resources_set("SiteRestore", &namespace, list.items.len() as i64);
    }

    // Terminal phases are sticky: a restore never re-executes on requeue.
    if let Some(status) = &restore.status {
        if matches!(status.phase, JobPhase::Succeeded | JobPhase::Failed) {
            return Ok(Action::await_change());
        }
    }

    let Some((site, bench)) = target_bench(&ctx, &namespace, &restore.spec.site).await? else {
        let message = format!("site {:?} not found in this namespace", restore.spec.site);
        write_status(&restores, &restore, |status| {
            status.phase = JobPhase::Pending;
            status.message = Some(message.clone());
        })
        .await?;
        ctx.publish(
            restore.as_ref(),
            EventType::Warning,
            "TargetSiteMissing",
            "Reconciling",
            message,
        )
        .await;
        return Ok(Action::requeue(Duration::from_secs(30)));
    };

    let sources = match resolve_sources(&restore, &ctx, &namespace).await {
        Ok(sources) => sources,
        Err(Error::Validation(message)) => {
            let transitioned = write_status(&restores, &restore, |status| {
                status.phase = JobPhase::Failed;
                status.message = Some(message.clone());
            })
            .await?;
            publish_transition(&ctx, restore.as_ref(), transitioned).await;
            ctx.publish(
                restore.as_ref(),
                EventType::Warning,
                "ValidationFailed",
                "Reconciling",
                message,
            )
            .await;
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
    let sources_secret = resources::restore_sources_secret(&restore, sources);
    ensure::ensure(&secrets, sources_secret, ensure::merge_secret).await?;

    let (image, security_context) = image_and_security(bench.as_ref(), &ctx);
    let jobs_api: Api<Job> = Api::namespaced(ctx.client.clone(), &namespace);
    let desired = resources::restore_job(
        &restore,
        &site.spec.bench,
        &image,
        security_context,
        restore.spec.public_files.is_some(),
        restore.spec.private_files.is_some(),
    );
    let job_name = desired.name_any();
    let (live_job, applied) = ensure::ensure(&jobs_api, desired, ensure::create_only).await?;
    if applied == Applied::Created {
        ctx.publish(
            restore.as_ref(),
            EventType::Normal,
            "Created",
            "Reconciling",
            format!("created Job {job_name}"),
        )
        .await;
    }

    let state = job::job_state(&live_job);
    ctx.metrics
        .job_status_set("SiteRestore", &namespace, &job_name, state.outcome());
    match state {
        JobState::Succeeded => {
            let transitioned = write_status(&restores, &restore, |status| {
                status.phase = JobPhase::Succeeded;
                status.message = None;
                status.observed_generation = restore.metadata.generation;
            })
            .await?;
            publish_transition(&ctx, restore.as_ref(), transitioned).await;
            Ok(Action::await_change())
        }
        JobState::Failed => {
            let message = job::last_pod_message(ctx.client.clone(), &namespace, &job_name)
                .await
                .unwrap_or_else(|| "restore job failed".to_string());
            let transitioned = write_status(&restores, &restore, |status| {
                status.phase = JobPhase::Failed;
                status.message = Some(message.clone());
                status.observed_generation = restore.metadata.generation;
            })
            .await?;
            publish_transition(&ctx, restore.as_ref(), transitioned).await;
            ctx.publish(
                restore.as_ref(),
                EventType::Warning,
                "RestoreFailed",
                "Reconciling",
                message,
            )
            .await;
            Ok(Action::await_change())
        }
        JobState::Missing | JobState::Active => {
            write_status(&restores, &restore, |status| {
                status.phase = JobPhase::Running;
                status.message = None;
            })
            .await?;
            Ok(Action::requeue(Duration::from_secs(15)))
        }
    }
}

/// Flatten the restore sources into the file-per-key map the job mounts.
/// Object-store credentials are resolved here so the job itself needs no
/// API access and no environment variables.
async fn resolve_sources(
    restore: &SiteRestore,
    ctx: &Context,
    namespace: &str,
) -> Result<BTreeMap<String, String>> {
    let mut data = BTreeMap::from([("site_name".to_string(), restore.spec.site.clone())]);
    data.insert(
        "db_source".to_string(),
        artifact_source(&restore.spec.database)?,
    );
    if let Some(artifact) = &restore.spec.public_files {
        data.insert("public_source".to_string(), artifact_source(artifact)?);
    }
    if let Some(artifact) = &restore.spec.private_files {
        data.insert("private_source".to_string(), artifact_source(artifact)?);
    }

    let store = [
        Some(&restore.spec.database),
        restore.spec.public_files.as_ref(),
        restore.spec.private_files.as_ref(),
    ]
    .into_iter()
    .flatten()
    .find_map(|artifact| artifact.object_store.as_ref());
    if let Some(store) = store {
        data.insert("endpoint".to_string(), store.endpoint.clone());
        if let Some(region) = &store.region {
            data.insert("region".to_string(), region.clone());
        }
        let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
        let secret = secrets
            .get_opt(&store.credentials_secret)
            .await?
            .ok_or_else(|| {
                Error::External(format!(
                    "object store credentials secret {} not found",
                    store.credentials_secret
                ))
            })?;
        data.insert("access_key".to_string(), read_secret_key(&secret, "access_key")?);
        data.insert("secret_key".to_string(), read_secret_key(&secret, "secret_key")?);
    }
    Ok(data)
}

fn artifact_source(artifact: &RestoreArtifact) -> Result<String> {
    match (&artifact.object_store, &artifact.local_path) {
        (Some(store), _) => Ok(format!("s3://{}/{}", store.bucket, store.key)),
        (None, Some(path)) => Ok(path.clone()),
        (None, None) => Err(Error::Validation(
            "restore artifact needs an objectStore or a localPath".to_string(),
        )),
    }
}

async fn write_status<F>(
    api: &Api<SiteRestore>,
    restore: &SiteRestore,
    mutate: F,
) -> Result<Option<JobPhase>>
where
    F: Fn(&mut SiteRestoreStatus),
{
    let current = restore.status.clone().unwrap_or_default();
    let mut next = current.clone();
    mutate(&mut next);
    if next == current {
        return Ok(None);
    }
    let next_phase = next.phase;
    ensure::update_status(api, &restore.name_any(), move |obj: &mut SiteRestore| {
        obj.status = Some(next.clone());
    })
    .await?;
    Ok((current.phase != next_phase).then_some(next_phase))
}

async fn publish_transition(ctx: &Context, restore: &SiteRestore, transitioned: Option<JobPhase>) {
    if let Some(phase) = transitioned {
        ctx.publish(
            restore,
            EventType::Normal,
            "PhaseTransition",
            "Reconciling",
            format!("restore entered phase {phase}"),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::backup::ObjectStoreSource;

    #[test]
    fn local_paths_pass_through() {
        let artifact = RestoreArtifact {
            object_store: None,
            local_path: Some("/backups/acme-database.sql.gz".into()),
        };
        assert_eq!(
            artifact_source(&artifact).unwrap(),
            "/backups/acme-database.sql.gz"
        );
    }

    #[test]
    fn object_store_sources_render_as_s3_urls() {
        let artifact = RestoreArtifact {
            object_store: Some(ObjectStoreSource {
                bucket: "tenant-backups".into(),
                endpoint: "https://minio.example.com".into(),
                region: None,
                key: "acme/database.sql.gz".into(),
                credentials_secret: "s3-creds".into(),
            }),
            local_path: None,
        };
        assert_eq!(
            artifact_source(&artifact).unwrap(),
            "s3://tenant-backups/acme/database.sql.gz"
        );
    }

    #[test]
    fn empty_artifacts_are_invalid() {
        let artifact = RestoreArtifact {
            object_store: None,
            local_path: None,
        };
        assert!(matches!(
            artifact_source(&artifact),
            Err(Error::Validation(_))
        ));
    }
}
