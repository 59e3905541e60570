use crate::error::{Error, Result};

use std::fmt::Debug;

use kube::api::{Api, Patch, PatchParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::time::Duration;

/// Attempt counter annotation; persisting it on the object keeps the backoff
/// schedule intact across operator restarts.
pub const REQUEUE_ATTEMPT_ANNOTATION: &str = "frappeop.rs/requeue-attempt";

const BASE_SECS: u64 = 10;
const CAP_SECS: u64 = 300;

/// `min(base · 2^attempt, cap)`.
pub fn delay_for(attempt: u32) -> Duration {
    Duration::from_secs((BASE_SECS << attempt.min(16)).min(CAP_SECS))
}

/// Attempt count currently recorded on the object.
pub fn attempt<K: Resource>(obj: &K) -> u32 {
    obj.annotations()
        .get(REQUEUE_ATTEMPT_ANNOTATION)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Record one more failed attempt and return the delay to requeue with.
pub async fn bump<K>(api: &Api<K>, obj: &K) -> Result<Duration>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let current = attempt(obj);
    let patch = json!({
        "metadata": {
            "annotations": { REQUEUE_ATTEMPT_ANNOTATION: (current + 1).to_string() }
        }
    });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(delay_for(current))
}

/// Clear the counter once the object reaches Ready.
pub async fn reset<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if !obj
        .annotations()
        .contains_key(REQUEUE_ATTEMPT_ANNOTATION)
    {
        return Ok(());
    }
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let patch = json!({
        "metadata": {
            "annotations": { REQUEUE_ATTEMPT_ANNOTATION: serde_json::Value::Null }
        }
    });
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
