use std::collections::BTreeMap;

pub mod backoff;
pub mod backup;
pub mod bench;
pub mod conditions;
pub mod config;
pub mod context;
pub mod crd;
pub mod ensure;
pub mod error;
pub mod finalizer;
pub mod job;
pub mod metrics;
pub mod site;
pub mod telemetry;

/// API group of the managed resources.
pub const API_GROUP: &str = "frappeop.rs";

/// Value of the `app` selector label on every child resource.
pub const APP_LABEL: &str = "frappe";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "frappeop";

pub const BENCH_LABEL: &str = "bench";
pub const COMPONENT_LABEL: &str = "component";

/// Selector labels for one bench component. Services select on exactly this
/// set; Deployments and StatefulSets add nothing on top.
pub fn component_labels(bench: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL.to_string()),
        (BENCH_LABEL.to_string(), bench.to_string()),
        (COMPONENT_LABEL.to_string(), component.to_string()),
    ])
}

/// `component_labels` plus the managed-by marker the watch streams select on.
pub fn child_labels(bench: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = component_labels(bench, component);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

/// Label selector for the operator's child-resource watches.
pub fn watch_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY}")
}
