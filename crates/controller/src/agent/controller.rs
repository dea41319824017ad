use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::pods::AgentPodManager;
use super::status::{assess_pod, settled_phase};
use super::types::{Error, Result};
use super::Context;
use crate::crds::{TaskSet, Workflow};

const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Moves a workflow into the `Error` phase
#[async_trait]
pub trait WorkflowErrorSink: Send + Sync {
    async fn mark_error(&self, workflow: &Workflow, reason: &str) -> Result<()>;
}

/// Marks workflows as errored by merge-patching their status
#[derive(Clone)]
pub struct KubeWorkflowErrorSink {
    client: Client,
}

impl KubeWorkflowErrorSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkflowErrorSink for KubeWorkflowErrorSink {
    async fn mark_error(&self, workflow: &Workflow, reason: &str) -> Result<()> {
        let namespace = workflow.namespace().ok_or(Error::MissingObjectKey)?;
        let api: Api<Workflow> = Api::namespaced(self.client.clone(), &namespace);

        let patch = json!({
            "status": {
                "phase": "Error",
                "message": reason
            }
        });
        api.patch(
            &workflow.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(workflow = %workflow.name_any(), reason, "Marked workflow as errored");
        Ok(())
    }
}

/// One reconcile pass of a workflow's agent pod
pub struct AgentPodReconciler {
    pods: AgentPodManager,
    error_sink: Arc<dyn WorkflowErrorSink>,
}

impl AgentPodReconciler {
    pub fn new(pods: AgentPodManager, error_sink: Arc<dyn WorkflowErrorSink>) -> Self {
        Self { pods, error_sink }
    }

    /// Ensure the agent pod exists while the workflow has pending agent tasks
    ///
    /// Returns `Ok` after pushing a failed pod's state into the workflow; the
    /// transition is the result of the pass, not an error of it. The pod is
    /// never removed here, even when the task set drains.
    #[instrument(skip_all, fields(workflow = %workflow.name_any(), tasks = task_set.len()))]
    pub async fn reconcile(&self, workflow: &Workflow, task_set: &TaskSet) -> Result<()> {
        if task_set.is_empty() {
            return Ok(());
        }

        let ensured = self.pods.ensure(workflow).await?;
        if settled_phase(&ensured.pod).is_some() {
            self.update_agent_pod_status(workflow, &ensured.pod).await?;
        }
        Ok(())
    }

    /// [`reconcile`](Self::reconcile), abandoned as soon as `cancel` fires
    pub async fn reconcile_with_cancellation(
        &self,
        workflow: &Workflow,
        task_set: &TaskSet,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = self.reconcile(workflow, task_set) => result,
        }
    }

    async fn update_agent_pod_status(&self, workflow: &Workflow, pod: &Pod) -> Result<()> {
        let Some(assessment) = assess_pod(pod) else {
            return Ok(());
        };

        warn!(
            pod_name = %pod.name_any(),
            phase = %assessment.phase,
            message = %assessment.message,
            "Agent pod reached a terminal failure"
        );
        self.error_sink
            .mark_error(
                workflow,
                &format!("agent pod failed with reason {}", assessment.message),
            )
            .await
    }
}

/// kube-runtime entry point for a `Workflow`
#[instrument(skip(workflow, ctx), fields(workflow_name = %workflow.name_any()))]
pub async fn reconcile_workflow(workflow: Arc<Workflow>, ctx: Arc<Context>) -> Result<Action> {
    if workflow.is_completed() {
        return Ok(Action::await_change());
    }

    let task_set = workflow.pending_agent_tasks();
    ctx.reconciler.reconcile(&workflow, &task_set).await?;
    Ok(Action::await_change())
}

/// Requeue failed passes; the work queue owns the retry cadence
pub fn error_policy(workflow: Arc<Workflow>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        error = ?err,
        workflow_name = %workflow.name_any(),
        "Agent pod reconciliation failed, requeueing"
    );
    Action::requeue(ERROR_REQUEUE)
}
