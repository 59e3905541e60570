use crate::backoff;
use crate::backup::reconcile::reconcile_site_backup;
use crate::backup::restore::reconcile_site_restore;
use crate::context::{Context, State};
use crate::crd::backup::{SiteBackup, SiteRestore};
use crate::error::Error;
use crate::metrics::ControllerId;
use crate::watch_selector;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::Resource;
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::{error, info, warn};

pub const BACKUP_CONTROLLER_ID: ControllerId = "sitebackup";
pub const RESTORE_CONTROLLER_ID: ControllerId = "siterestore";

fn error_policy<K>(controller: ControllerId) -> impl Fn(Arc<K>, &Error, Arc<Context>) -> Action
where
    K: Resource + ResourceExt,
{
    move |obj: Arc<K>, error: &Error, ctx: Arc<Context>| {
        warn!(msg = "reconcile failed", controller, name = %obj.name_any(), %error);
        ctx.metrics.reconcile.failure_inc(controller, error);
        Action::requeue(backoff::delay_for(backoff::attempt(obj.as_ref())))
    }
}

async fn probe_crd<K>(api: &Api<K>, kind: &str)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
{
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("{kind} CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }
}

/// Run the backup controller until shutdown (given the CRD is installed).
pub async fn run_backups(state: State, client: Client, concurrency: u16) {
    let backups = Api::<SiteBackup>::all(client.clone());
    probe_crd(&backups, "SiteBackup").await;

    let ctx = state.to_context(client.clone());
    let children = watcher::Config::default().labels(&watch_selector());

    info!(msg = "starting sitebackup controller");
    let controller = Controller::new(backups, watcher::Config::default().any_semantic())
        .with_config(
            controller::Config::default()
                .concurrency(concurrency)
                .debounce(Duration::from_millis(500)),
        )
        .owns(Api::<Job>::all(client.clone()), children.clone())
        .owns(Api::<CronJob>::all(client.clone()), children)
        .shutdown_on_signal()
        .run(
            reconcile_site_backup,
            error_policy(BACKUP_CONTROLLER_ID),
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(BACKUP_CONTROLLER_ID, 1);
    controller.await;
}

/// Run the restore controller until shutdown (given the CRD is installed).
pub async fn run_restores(state: State, client: Client, concurrency: u16) {
    let restores = Api::<SiteRestore>::all(client.clone());
    probe_crd(&restores, "SiteRestore").await;

    let ctx = state.to_context(client.clone());
    let children = watcher::Config::default().labels(&watch_selector());

    info!(msg = "starting siterestore controller");
    let controller = Controller::new(restores, watcher::Config::default().any_semantic())
        .with_config(
            controller::Config::default()
                .concurrency(concurrency)
                .debounce(Duration::from_millis(500)),
        )
        .owns(Api::<Job>::all(client.clone()), children)
        .shutdown_on_signal()
        .run(
            reconcile_site_restore,
            error_policy(RESTORE_CONTROLLER_ID),
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.ready_set(RESTORE_CONTROLLER_ID, 1);
    controller.await;
}
