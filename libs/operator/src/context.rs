use crate::config::ControllerConfig;
use crate::metrics::{ControllerId, Metrics};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Resource;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

/// Annotation that marks a cluster's default StorageClass.
const DEFAULT_STORAGE_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Provisioner name fragments known to support ReadWriteMany volumes.
const RWX_PROVISIONER_HINTS: [&str; 5] = ["nfs", "cephfs", "azurefile", "efs", "filestore"];

/// Cluster personality, fixed at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PlatformFlavor {
    #[default]
    Kubernetes,
    /// Managed-security platform: SCCs inject pod user ids, external access
    /// uses Routes instead of Ingresses.
    Openshift,
}

impl PlatformFlavor {
    pub fn is_openshift(&self) -> bool {
        matches!(self, PlatformFlavor::Openshift)
    }
}

impl fmt::Display for PlatformFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformFlavor::Kubernetes => write!(f, "kubernetes"),
            PlatformFlavor::Openshift => write!(f, "openshift"),
        }
    }
}

/// Facts discovered from the API server once at startup. The renderers treat
/// these as pure inputs.
#[derive(Clone, Debug, Default)]
pub struct ClusterFacts {
    pub platform: PlatformFlavor,
    pub default_storage_class: Option<String>,
    /// Whether any installed StorageClass is believed to provision RWX
    /// volumes; drives the shared-volume access-mode fallback.
    pub rwx_supported: bool,
}

impl ClusterFacts {
    pub async fn discover(client: &Client) -> Self {
        let platform = match kube::discovery::Discovery::new(client.clone()).run().await {
            Ok(discovery) => {
                if discovery.groups().any(|g| g.name() == "route.openshift.io") {
                    PlatformFlavor::Openshift
                } else {
                    PlatformFlavor::Kubernetes
                }
            }
            Err(e) => {
                warn!(msg = "API discovery failed, assuming vanilla kubernetes", %e);
                PlatformFlavor::Kubernetes
            }
        };

        let (default_storage_class, rwx_supported) =
            match Api::<StorageClass>::all(client.clone()).list(&ListParams::default()).await {
                Ok(classes) => {
                    let default = classes
                        .items
                        .iter()
                        .find(|sc| {
                            sc.metadata
                                .annotations
                                .as_ref()
                                .and_then(|a| a.get(DEFAULT_STORAGE_CLASS_ANNOTATION))
                                .is_some_and(|v| v == "true")
                        })
                        .and_then(|sc| sc.metadata.name.clone());
                    let rwx = classes.items.iter().any(|sc| {
                        RWX_PROVISIONER_HINTS
                            .iter()
                            .any(|hint| sc.provisioner.contains(hint))
                    });
                    (default, rwx)
                }
                Err(e) => {
                    warn!(msg = "listing storage classes failed", %e);
                    (None, false)
                }
            };

        Self {
            platform,
            default_storage_class,
            rwx_supported,
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "frappeop".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder<K: Resource<DynamicType = ()>>(&self, client: Client, obj: &K) -> Recorder {
        Recorder::new(client, self.reporter.clone(), obj.object_ref(&()))
    }
}

/// Context injected into every reconcile invocation.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// Operator configuration (ConfigMap + environment)
    pub config: Arc<ControllerConfig>,
    /// Startup cluster discovery
    pub facts: Arc<ClusterFacts>,
}

impl Context {
    /// Publish a Kubernetes Event attached to `obj`. Event emission never
    /// fails a reconcile; errors are logged and dropped.
    pub async fn publish<K: Resource<DynamicType = ()>>(
        &self,
        obj: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let recorder = self
            .diagnostics
            .read()
            .await
            .recorder(self.client.clone(), obj);
        if let Err(e) = recorder
            .publish(Event {
                type_,
                reason: reason.to_string(),
                note: Some(note),
                action: action.to_string(),
                secondary: None,
            })
            .await
        {
            warn!(msg = "failed to publish event", reason, %e);
        }
    }
}

/// State shared between the controllers and the web server.
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    registry: Arc<prometheus_client::registry::Registry>,
    metrics: Arc<Metrics>,
    config: Arc<ControllerConfig>,
    facts: Arc<ClusterFacts>,
}

impl State {
    pub fn new(
        mut registry: prometheus_client::registry::Registry,
        config: ControllerConfig,
        facts: ClusterFacts,
        controllers: &[ControllerId],
    ) -> Self {
        let metrics = Metrics::new(&mut registry);
        for &controller in controllers {
            metrics.ready_set(controller, 0);
        }
        Self {
            diagnostics: Arc::default(),
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
            config: Arc::new(config),
            facts: Arc::new(facts),
        }
    }

    /// Text-encoded metrics for the `/metrics` endpoint.
    pub fn metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            facts: self.facts.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use http::{Request, Response};
    use kube::client::Body;

    pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

    impl Context {
        /// Context backed by a mock apiserver; the returned handle replays
        /// scenario responses.
        pub fn test() -> (Arc<Self>, ApiServerHandle) {
            let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let mock_client = Client::new(mock_service, "default");
            let mut registry = prometheus_client::registry::Registry::default();
            let ctx = Self {
                client: mock_client,
                diagnostics: Arc::default(),
                metrics: Arc::new(Metrics::new(&mut registry)),
                config: Arc::new(ControllerConfig::default()),
                facts: Arc::new(ClusterFacts {
                    rwx_supported: true,
                    ..ClusterFacts::default()
                }),
            };
            (Arc::new(ctx), handle)
        }
    }
}
