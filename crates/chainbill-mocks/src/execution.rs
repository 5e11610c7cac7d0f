use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chainbill_tools::{DelegationProof, ExecutionError, ExecutionPayload, ExecutionService};
use tokio::sync::RwLock;

/// Mock execution service.
///
/// Replays queued outcomes in order and, once the queue is empty, confirms every submission
/// with a fresh transaction reference. Every call is recorded, including failed ones.
#[derive(Clone, Default)]
pub struct ScriptedExecutionService {
    outcomes: Arc<RwLock<VecDeque<Result<String, ExecutionError>>>>,
    submissions: Arc<RwLock<Vec<ExecutionPayload>>>,
    delay: Arc<RwLock<Option<Duration>>>,
}

impl ScriptedExecutionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of the next unscripted submission.
    pub async fn push_outcome(&self, outcome: Result<String, ExecutionError>) {
        self.outcomes.write().await.push_back(outcome);
    }

    pub async fn reject_next(&self, reason: impl Into<String>) {
        self.push_outcome(Err(ExecutionError::Rejected(reason.into())))
            .await;
    }

    pub async fn fail_next(&self, reason: impl Into<String>) {
        self.push_outcome(Err(ExecutionError::Unavailable(reason.into())))
            .await;
    }

    /// Delays every response, to exercise caller timeouts.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.write().await = delay;
    }

    pub async fn submission_count(&self) -> usize {
        self.submissions.read().await.len()
    }

    pub async fn submissions(&self) -> Vec<ExecutionPayload> {
        self.submissions.read().await.clone()
    }
}

#[async_trait]
impl ExecutionService for ScriptedExecutionService {
    async fn submit(
        &self,
        _proof: &DelegationProof,
        payload: &ExecutionPayload,
    ) -> Result<String, ExecutionError> {
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut submissions = self.submissions.write().await;
        submissions.push(payload.clone());
        let sequence = submissions.len();
        drop(submissions);

        match self.outcomes.write().await.pop_front() {
            Some(outcome) => outcome,
            None => Ok(format!("0xmock{sequence:04}")),
        }
    }
}
