use crate::backoff;
use crate::bench::reconcile::reconcile_bench;
use crate::context::{Context, State};
use crate::crd::bench::Bench;
use crate::error::Error;
use crate::metrics::ControllerId;
use crate::watch_selector;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::{error, info, warn};

pub const CONTROLLER_ID: ControllerId = "bench";

fn error_policy(bench: Arc<Bench>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(msg = "bench reconcile failed", name = %bench.name_any(), %error);
    ctx.metrics.reconcile.failure_inc(CONTROLLER_ID, error);
    Action::requeue(backoff::delay_for(backoff::attempt(bench.as_ref())))
}

/// Run the bench controller until shutdown (given the CRD is installed).
pub async fn run(state: State, client: Client, concurrency: u16) {
    let benches = Api::<Bench>::all(client.clone());
    if let Err(e) = benches.list(&ListParams::default().limit(1)).await {
        error!("Bench CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let ctx = state.to_context(client.clone());
    let children = watcher::Config::default().labels(&watch_selector());

    info!(msg = "starting bench controller");
    let controller = Controller::new(benches, watcher::Config::default().any_semantic())
        .with_config(
            controller::Config::default()
                .concurrency(concurrency)
                .debounce(Duration::from_millis(500)),
        )
        .owns(Api::<Deployment>::all(client.clone()), children.clone())
        .owns(Api::<StatefulSet>::all(client.clone()), children.clone())
        .owns(Api::<Service>::all(client.clone()), children.clone())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), children)
        .shutdown_on_signal()
        .run(reconcile_bench, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(CONTROLLER_ID, 1);
    controller.await;
}
