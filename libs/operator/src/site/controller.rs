use crate::backoff;
use crate::context::{Context, State};
use crate::crd::site::Site;
use crate::error::Error;
use crate::metrics::ControllerId;
use crate::site::reconcile::reconcile_site;
use crate::watch_selector;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use tokio::time::Duration;
use tracing::{error, info, warn};

pub const CONTROLLER_ID: ControllerId = "site";

fn error_policy(site: Arc<Site>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!(msg = "site reconcile failed", name = %site.name_any(), %error);
    ctx.metrics.reconcile.failure_inc(CONTROLLER_ID, error);
    Action::requeue(backoff::delay_for(backoff::attempt(site.as_ref())))
}

/// Run the site controller until shutdown (given the CRD is installed).
/// The foreign database CRs are not watched; their readiness is observed on
/// the requeue schedule instead, so a cluster without the database operator
/// still runs.
pub async fn run(state: State, client: Client, concurrency: u16) {
    let sites = Api::<Site>::all(client.clone());
    if let Err(e) = sites.list(&ListParams::default().limit(1)).await {
        error!("Site CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    let ctx = state.to_context(client.clone());
    let children = watcher::Config::default().labels(&watch_selector());

    info!(msg = "starting site controller");
    let controller = Controller::new(sites, watcher::Config::default().any_semantic())
        .with_config(
            controller::Config::default()
                .concurrency(concurrency)
                .debounce(Duration::from_millis(500)),
        )
        .owns(Api::<Job>::all(client.clone()), children.clone())
        .owns(Api::<Secret>::all(client.clone()), children.clone())
        .owns(Api::<Ingress>::all(client.clone()), children)
        .shutdown_on_signal()
        .run(reconcile_site, error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(CONTROLLER_ID, 1);
    controller.await;
}
