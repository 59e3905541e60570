use crate::backoff;
use crate::bench::controller::CONTROLLER_ID;
use crate::bench::resources::{self, BenchChildren, STORAGE_FALLBACK_ANNOTATION};
use crate::conditions::{self, Phase, PROGRESSING, READY, TERMINATING};
use crate::context::Context;
use crate::crd::bench::{Bench, BenchStatus};
use crate::crd::site::Site;
use crate::ensure::{self, Applied};
use crate::error::{Error, Result};
use crate::finalizer::{self, BENCH_FINALIZER};
use crate::telemetry;
use crate::{watch_selector, BENCH_LABEL};

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

#[instrument(skip(ctx, bench), fields(trace_id))]
pub async fn reconcile_bench(bench: Arc<Bench>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(CONTROLLER_ID, &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = bench
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = bench.name_any();
    let benches: Api<Bench> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(msg = "reconciling bench", %namespace, %name);

    if bench.meta().deletion_timestamp.is_some() {
        return finalize(&bench, &benches, &ctx, &namespace).await;
    }

    if finalizer::ensure_finalizer(&benches, bench.as_ref(), BENCH_FINALIZER).await? {
        // The spec patch retriggers the watch; the next pass does the work.
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if let Ok(list) = benches.list_metadata(&ListParams::default()).await {
        ctx.metrics
            .resources_set("Bench", &namespace, list.items.len() as i64);
    }

    apply(&bench, &benches, &ctx, &namespace).await
}

async fn apply(
    bench: &Bench,
    benches: &Api<Bench>,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    let generation = bench.metadata.generation;

    if check_storage_fallback(bench, benches, ctx, namespace).await? {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let children = resources::render(bench, &ctx.facts, &ctx.config);

    // Ready objects whose spec has not moved only get a read-only health
    // probe; nothing is written unless a child regressed.
    if let Some(status) = &bench.status {
        if status.phase == Phase::Ready
            && status.observed_generation == generation
            && children_ready(ctx, namespace, &children).await?
        {
            debug!(msg = "bench is settled", name = %bench.name_any());
            return Ok(Action::requeue(Duration::from_secs(300)));
        }
    }

    // Creation order matters: storage before anything that mounts it,
    // Services before their workloads so DNS resolves on pod start.
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    let pvc_name = children.pvc.name_any();
    let (_, applied) = ensure::ensure(&pvcs, children.pvc.clone(), ensure::create_only).await?;
    note_created(ctx, bench, applied, "PersistentVolumeClaim", &pvc_name).await;

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    for service in children.services.clone() {
        let child_name = service.name_any();
        let (_, applied) = ensure::ensure(&services, service, ensure::merge_service).await?;
        note_created(ctx, bench, applied, "Service", &child_name).await;
    }

    let stateful_sets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), namespace);
    for sts in children.stateful_sets.clone() {
        let child_name = sts.name_any();
        let (_, applied) = ensure::ensure(&stateful_sets, sts, ensure::merge_statefulset).await?;
        note_created(ctx, bench, applied, "StatefulSet", &child_name).await;
    }

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    for deployment in children.deployments.clone() {
        let child_name = deployment.name_any();
        let (_, applied) = ensure::ensure(&deployments, deployment, ensure::merge_deployment).await?;
        note_created(ctx, bench, applied, "Deployment", &child_name).await;
    }

    if children_ready(ctx, namespace, &children).await? {
        let transitioned = write_status(benches, bench, |status| {
            status.phase = Phase::Ready;
            status.observed_generation = generation;
            let mut conditions = status.conditions.take().unwrap_or_default();
            conditions::set_condition(
                &mut conditions,
                conditions::condition(
                    generation,
                    READY,
                    true,
                    "AllComponentsReady",
                    "every bench workload is available",
                ),
            );
            conditions::set_condition(
                &mut conditions,
                conditions::condition(generation, PROGRESSING, false, "Stable", ""),
            );
            status.conditions = Some(conditions);
        })
        .await?;
        publish_transition(ctx, bench, transitioned).await;
        backoff::reset(benches, bench).await?;
        Ok(Action::requeue(Duration::from_secs(300)))
    } else {
        write_status(benches, bench, |status| {
            status.phase = Phase::Provisioning;
            let mut conditions = status.conditions.take().unwrap_or_default();
            conditions::set_condition(
                &mut conditions,
                conditions::condition(
                    generation,
                    READY,
                    false,
                    "ComponentsPending",
                    "bench workloads are not yet available",
                ),
            );
            conditions::set_condition(
                &mut conditions,
                conditions::condition(generation, PROGRESSING, true, "Reconciling", ""),
            );
            status.conditions = Some(conditions);
        })
        .await?;
        let delay = backoff::bump(benches, bench).await?;
        Ok(Action::requeue(delay))
    }
}

/// Deletion flow: dependent-sites gate, scale every Deployment to zero, wait
/// for observed replicas to drain, drop the shared PVC, release the
/// finalizer. Remaining children cascade through their owner references.
async fn finalize(
    bench: &Bench,
    benches: &Api<Bench>,
    ctx: &Context,
    namespace: &str,
) -> Result<Action> {
    let name = bench.name_any();
    if !bench.finalizers().iter().any(|f| f == BENCH_FINALIZER) {
        return Ok(Action::await_change());
    }
    let generation = bench.metadata.generation;

    let sites = Api::<Site>::all(ctx.client.clone())
        .list(&ListParams::default())
        .await?;
    let dependents = sites
        .items
        .iter()
        .filter(|s| s.namespace().as_deref() == Some(namespace) && s.spec.bench == name)
        .count();
    if dependents > 0 {
        let transitioned = write_status(benches, bench, |status| {
            status.phase = Phase::Terminating;
            let mut conditions = status.conditions.take().unwrap_or_default();
            conditions::set_condition(
                &mut conditions,
                conditions::condition(
                    generation,
                    TERMINATING,
                    false,
                    "DependentSitesExist",
                    &format!("{dependents} site(s) still reference this bench"),
                ),
            );
            status.conditions = Some(conditions);
        })
        .await?;
        publish_transition(ctx, bench, transitioned).await;
        let delay = backoff::bump(benches, bench).await?;
        return Ok(Action::requeue(delay));
    }

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let selector = format!("{},{BENCH_LABEL}={name}", watch_selector());
    let owned = deployments
        .list(&ListParams::default().labels(&selector))
        .await?;
    let mut observed = 0;
    for deployment in &owned.items {
        if deployment.spec.as_ref().and_then(|s| s.replicas) != Some(0) {
            deployments
                .patch(
                    &deployment.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(&json!({"spec": {"replicas": 0}})),
                )
                .await?;
        }
        observed += deployment
            .status
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
    }
    if observed > 0 {
        let transitioned = write_status(benches, bench, |status| {
            status.phase = Phase::Terminating;
            let mut conditions = status.conditions.take().unwrap_or_default();
            conditions::set_condition(
                &mut conditions,
                conditions::condition(
                    generation,
                    TERMINATING,
                    false,
                    "ScalingDown",
                    &format!("{observed} replica(s) still running"),
                ),
            );
            status.conditions = Some(conditions);
        })
        .await?;
        publish_transition(ctx, bench, transitioned).await;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    let pvc_name = resources::sites_pvc_name(&name);
    if pvcs.get_opt(&pvc_name).await?.is_some() {
        pvcs.delete(&pvc_name, &DeleteParams::default()).await?;
        info!(msg = "deleted shared sites volume", %pvc_name);
    }

    finalizer::remove_finalizer(benches, bench, BENCH_FINALIZER).await?;
    Ok(Action::await_change())
}

/// RWX→RWO fallback: only taken when the PVC sits Pending asking for
/// ReadWriteMany and discovery found no storage class that could ever bind
/// it. The pending claim is deleted so the next pass recreates it RWO.
async fn check_storage_fallback(
    bench: &Bench,
    benches: &Api<Bench>,
    ctx: &Context,
    namespace: &str,
) -> Result<bool> {
    if bench
        .annotations()
        .get(STORAGE_FALLBACK_ANNOTATION)
        .is_some_and(|v| v == "true")
        || ctx.facts.rwx_supported
    {
        return Ok(false);
    }
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    let pvc_name = resources::sites_pvc_name(&bench.name_any());
    let Some(pvc) = pvcs.get_opt(&pvc_name).await? else {
        return Ok(false);
    };
    let pending = pvc
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Pending");
    let requested_rwx = pvc
        .spec
        .as_ref()
        .and_then(|s| s.access_modes.as_ref())
        .is_some_and(|modes| modes.iter().any(|m| m == resources::RWX));
    if !(pending && requested_rwx) {
        return Ok(false);
    }

    benches
        .patch(
            &bench.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&json!({
                "metadata": {"annotations": {STORAGE_FALLBACK_ANNOTATION: "true"}}
            })),
        )
        .await?;
    pvcs.delete(&pvc_name, &DeleteParams::default()).await?;
    ctx.publish(
        bench,
        EventType::Warning,
        "StorageFallback",
        "Reconciling",
        format!("no storage class provisions ReadWriteMany; recreating {pvc_name} as ReadWriteOnce"),
    )
    .await;
    Ok(true)
}

async fn children_ready(ctx: &Context, namespace: &str, children: &BenchChildren) -> Result<bool> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), namespace);
    let bound = pvcs
        .get_opt(&children.pvc.name_any())
        .await?
        .and_then(|pvc| pvc.status)
        .and_then(|s| s.phase)
        .is_some_and(|phase| phase == "Bound");
    if !bound {
        return Ok(false);
    }

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    for desired in &children.deployments {
        let wanted = desired.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        if wanted == 0 {
            continue;
        }
        let available = deployments
            .get_opt(&desired.name_any())
            .await?
            .and_then(|d| d.status)
            .and_then(|s| s.available_replicas)
            .unwrap_or(0);
        if available < wanted {
            return Ok(false);
        }
    }

    let stateful_sets: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), namespace);
    for desired in &children.stateful_sets {
        let ready = stateful_sets
            .get_opt(&desired.name_any())
            .await?
            .and_then(|s| s.status)
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        if ready < 1 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Write the status subresource if the mutation changed anything. Returns
/// the new phase when this write was a phase transition.
async fn write_status<F>(api: &Api<Bench>, bench: &Bench, mutate: F) -> Result<Option<Phase>>
where
    F: Fn(&mut BenchStatus),
{
    let current = bench.status.clone().unwrap_or_default();
    let mut next = current.clone();
    mutate(&mut next);
    if next == current {
        return Ok(None);
    }
    let next_phase = next.phase;
    ensure::update_status(api, &bench.name_any(), move |obj: &mut Bench| {
        obj.status = Some(next.clone());
    })
    .await?;
    Ok((current.phase != next_phase).then_some(next_phase))
}

async fn publish_transition(ctx: &Context, bench: &Bench, transitioned: Option<Phase>) {
    if let Some(phase) = transitioned {
        ctx.publish(
            bench,
            EventType::Normal,
            "PhaseTransition",
            "Reconciling",
            format!("bench entered phase {phase}"),
        )
        .await;
    }
}

async fn note_created(ctx: &Context, bench: &Bench, applied: Applied, kind: &str, name: &str) {
    if applied == Applied::Created {
        ctx.publish(
            bench,
            EventType::Normal,
            "Created",
            "Reconciling",
            format!("created {kind} {name}"),
        )
        .await;
    }
}
