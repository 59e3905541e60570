use crate::error::Result;
use crate::metrics::JobOutcome;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::client::Client;

/// Label the Job controller puts on the pods it creates.
const JOB_NAME_LABEL: &str = "job-name";

/// Observed state of a one-shot Job. The Job resource is the durable record
/// of the work; terminal states are read from its status counters, never
/// inferred in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Missing,
    Active,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn outcome(&self) -> JobOutcome {
        match self {
            JobState::Succeeded => JobOutcome::Succeeded,
            JobState::Failed => JobOutcome::Failed,
            JobState::Missing | JobState::Active => JobOutcome::Active,
        }
    }
}

pub fn job_state(job: &Job) -> JobState {
    match &job.status {
        Some(status) if status.succeeded.unwrap_or(0) > 0 => JobState::Succeeded,
        Some(status) if status.failed.unwrap_or(0) > 0 => JobState::Failed,
        _ => JobState::Active,
    }
}

pub async fn observe(api: &Api<Job>, name: &str) -> Result<JobState> {
    Ok(api
        .get_opt(name)
        .await?
        .map(|job| job_state(&job))
        .unwrap_or(JobState::Missing))
}

/// Terminal message of the most recent pod of a Job, surfaced into status so
/// a failed init or delete run can be diagnosed without chasing pods.
pub async fn last_pod_message(client: Client, namespace: &str, job_name: &str) -> Option<String> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    let lp = ListParams::default().labels(&format!("{JOB_NAME_LABEL}={job_name}"));
    let mut pods = pods.list(&lp).await.ok()?.items;
    pods.sort_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));
    let last = pods.last()?;
    let status = last.status.as_ref()?;

    let terminated = status.container_statuses.as_ref().and_then(|containers| {
        containers.iter().find_map(|c| {
            let t = c.state.as_ref()?.terminated.as_ref()?;
            let reason = t.reason.clone().unwrap_or_else(|| "Terminated".to_string());
            Some(match &t.message {
                Some(message) => format!("{reason}: {message}"),
                None => format!("{reason} (exit code {})", t.exit_code),
            })
        })
    });
    terminated
        .or_else(|| status.message.clone())
        .or_else(|| status.reason.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;

    fn job_with(succeeded: Option<i32>, failed: Option<i32>, active: Option<i32>) -> Job {
        Job {
            status: Some(JobStatus {
                succeeded,
                failed,
                active,
                ..JobStatus::default()
            }),
            ..Job::default()
        }
    }

    #[test]
    fn succeeded_counter_wins() {
        assert_eq!(job_state(&job_with(Some(1), None, None)), JobState::Succeeded);
    }

    #[test]
    fn failed_counter_marks_failure() {
        assert_eq!(job_state(&job_with(None, Some(2), None)), JobState::Failed);
    }

    #[test]
    fn running_job_is_active() {
        assert_eq!(job_state(&job_with(None, None, Some(1))), JobState::Active);
        assert_eq!(job_state(&Job::default()), JobState::Active);
    }
}
