//! Drives a single run of the execution graph.
//!
//! Each super-step reads the latest checkpoint, folds recalled memories into
//! the step input, runs the (caller-supplied) step handler, and makes the
//! resulting checkpoint durable before any send executes. A crash or
//! suspension therefore always leaves a resumable intent: resuming a run and
//! recovering from a crash are the same code path.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::activity::StepType;
use crate::model::approval::ApprovalStatus;
use crate::model::checkpoint::{Checkpoint, PendingSend};
use crate::query::activity::ActivityInput;
use crate::query::checkpoint::CheckpointRequest;
use crate::query::gate::ApprovalInput;
use crate::query::recall::{RecallRequest, ScoredMemory};
use crate::query::EngramEngine;
use crate::retry::{self, BackoffPolicy};

/// The agent logic collaborator. Reasoning, prompts, and LLM calls live
/// behind this trait; the coordinator only sees channel writes and sends.
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    /// Embedding of the current working context. Returning `None` skips
    /// memory recall for the step.
    fn context_embedding(&self, channel_values: &BTreeMap<String, serde_json::Value>) -> Option<Vec<f32>>;

    async fn step(&self, ctx: &StepContext) -> Result<StepOutput>;
}

/// Applies a pending send. Sends carry a stable id and may be delivered
/// more than once across crashes; implementations must be idempotent on it.
#[async_trait::async_trait]
pub trait SendExecutor: Send + Sync {
    async fn execute(&self, send: &PendingSend) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub step: i64,
    pub channel_values: BTreeMap<String, serde_json::Value>,
    pub memories: Vec<RecalledMemory>,
}

/// A recalled memory weighted by `similarity * importance` for the step's
/// decision input.
#[derive(Debug, Clone)]
pub struct RecalledMemory {
    pub memory: ScoredMemory,
    pub weight: f32,
}

#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub thought: Option<String>,
    pub writes: BTreeMap<String, serde_json::Value>,
    pub sends: Vec<SendRequest>,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub channel: String,
    pub payload: serde_json::Value,
    pub sensitive: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub max_steps: usize,
    pub approval_ttl_seconds: i64,
    pub approval_poll_interval: Duration,
    pub approval_wait_timeout: Duration,
    pub max_append_retries: u32,
    pub backoff: BackoffPolicy,
    pub recall_threshold: f32,
    pub recall_limit: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            max_steps: 64,
            approval_ttl_seconds: 3600,
            approval_poll_interval: Duration::from_millis(500),
            approval_wait_timeout: Duration::from_secs(60),
            max_append_retries: 3,
            backoff: BackoffPolicy::default(),
            recall_threshold: 0.7,
            recall_limit: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { steps: i64 },
    /// The run stopped between super-steps with durable state; re-running
    /// the coordinator picks it back up.
    Suspended { reason: String },
}

pub struct RunCoordinator {
    engine: Arc<EngramEngine>,
    run_id: String,
    thread_id: String,
    checkpoint_ns: String,
    consumer_id: String,
    handler: Arc<dyn StepHandler>,
    executor: Arc<dyn SendExecutor>,
    opts: CoordinatorOptions,
    /// Sends applied within this process; receivers dedup across processes
    /// by send id.
    applied_sends: HashSet<Uuid>,
}

impl RunCoordinator {
    pub fn new(
        engine: Arc<EngramEngine>,
        run_id: String,
        thread_id: String,
        consumer_id: String,
        handler: Arc<dyn StepHandler>,
        executor: Arc<dyn SendExecutor>,
    ) -> Self {
        Self {
            engine,
            run_id,
            thread_id,
            checkpoint_ns: String::new(),
            consumer_id,
            handler,
            executor,
            opts: CoordinatorOptions::default(),
            applied_sends: HashSet::new(),
        }
    }

    pub fn with_namespace(mut self, checkpoint_ns: String) -> Self {
        self.checkpoint_ns = checkpoint_ns;
        self
    }

    pub fn with_options(mut self, opts: CoordinatorOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Write the initial checkpoint for a fresh partition from external
    /// input, giving every seeded channel version 1.
    pub async fn seed(&self, channel_values: BTreeMap<String, serde_json::Value>) -> Result<Checkpoint> {
        let channel_versions = channel_values.keys().map(|k| (k.clone(), 1)).collect();
        self.engine
            .checkpoint(CheckpointRequest {
                thread_id: self.thread_id.clone(),
                checkpoint_ns: Some(self.checkpoint_ns.clone()),
                parent_id: None,
                channel_values,
                channel_versions,
                versions_seen: BTreeMap::new(),
                pending_sends: Vec::new(),
                source: Some("input".to_string()),
                step: Some(0),
                metadata: None,
            })
            .await
    }

    /// Run super-steps until the handler finishes, the consumer has nothing
    /// new to observe, or the run suspends on an unresolved approval.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let mut steps_executed = 0usize;
        let mut append_retries = 0u32;

        loop {
            let latest = match self
                .engine
                .latest_checkpoint(&self.thread_id, &self.checkpoint_ns)
                .await
            {
                Ok(cp) => Some(cp),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

            if let Some(ref cp) = latest {
                // Crash/suspension recovery: re-apply whatever the last
                // durable checkpoint still has in flight before computing.
                if let Some(outcome) = self.drain_sends(cp).await? {
                    return Ok(outcome);
                }
                if cp.is_done() {
                    return Ok(RunOutcome::Completed { steps: cp.step });
                }
                if !cp.needs_step(&self.consumer_id) {
                    return Ok(RunOutcome::Completed { steps: cp.step });
                }
            }

            if steps_executed >= self.opts.max_steps {
                return Ok(RunOutcome::Suspended {
                    reason: format!("step limit {} reached", self.opts.max_steps),
                });
            }

            let cp = match self.advance(latest.as_ref()).await {
                Ok(cp) => {
                    append_retries = 0;
                    cp
                }
                Err(Error::Conflict(msg)) if append_retries < self.opts.max_append_retries => {
                    // Another writer appended under our parent; re-read the
                    // partition head and recompute from fresh state.
                    append_retries += 1;
                    tracing::warn!(
                        run_id = %self.run_id,
                        attempt = append_retries,
                        conflict = %msg,
                        "checkpoint append conflicted, retrying from latest"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            steps_executed += 1;

            if let Some(outcome) = self.drain_sends(&cp).await? {
                return Ok(outcome);
            }
            if cp.is_done() {
                return Ok(RunOutcome::Completed { steps: cp.step });
            }
        }
    }

    /// One super-step: recall, compute, then checkpoint-before-effect.
    async fn advance(&self, latest: Option<&Checkpoint>) -> Result<Checkpoint> {
        let channel_values = latest
            .map(|cp| cp.channel_values.clone())
            .unwrap_or_default();
        let step = latest.map(|cp| cp.step + 1).unwrap_or(0);

        let memories = match self.handler.context_embedding(&channel_values) {
            Some(embedding) => {
                let recalled = self
                    .engine
                    .recall(RecallRequest {
                        embedding,
                        threshold: Some(self.opts.recall_threshold),
                        limit: Some(self.opts.recall_limit),
                        agent_id: None,
                        memory_type: None,
                    })
                    .await?;
                self.log(ActivityInput {
                    metadata: Some(serde_json::json!({"count": recalled.total, "step": step})),
                    ..ActivityInput::new(
                        self.run_id.clone(),
                        StepType::Observation,
                        format!("recalled {} memories for step {step}", recalled.total),
                    )
                })
                .await;
                recalled
                    .memories
                    .into_iter()
                    .map(|memory| RecalledMemory {
                        weight: memory.similarity * memory.importance,
                        memory,
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        let ctx = StepContext {
            run_id: self.run_id.clone(),
            step,
            channel_values: channel_values.clone(),
            memories,
        };

        let output = match self.handler.step(&ctx).await {
            Ok(output) => output,
            Err(e) => {
                self.log(ActivityInput::new(
                    self.run_id.clone(),
                    StepType::Error,
                    format!("step {step} failed: {e}"),
                ))
                .await;
                return Err(e);
            }
        };

        if let Some(ref thought) = output.thought {
            self.log(ActivityInput {
                agent_id: Some(self.consumer_id.clone()),
                ..ActivityInput::new(self.run_id.clone(), StepType::Thinking, thought.clone())
            })
            .await;
        }

        let input_versions = latest
            .map(|cp| cp.channel_versions.clone())
            .unwrap_or_default();
        let mut channel_versions = input_versions.clone();
        for channel in output.writes.keys() {
            *channel_versions.entry(channel.clone()).or_insert(0) += 1;
        }

        let mut versions_seen = latest.map(|cp| cp.versions_seen.clone()).unwrap_or_default();
        versions_seen.insert(self.consumer_id.clone(), input_versions);

        let mut new_values = channel_values;
        for (channel, value) in output.writes {
            new_values.insert(channel, value);
        }

        let pending_sends: Vec<PendingSend> = output
            .sends
            .into_iter()
            .map(|send| PendingSend {
                id: Uuid::now_v7(),
                channel: send.channel,
                payload: send.payload,
                sensitive: send.sensitive,
                reason: send.reason,
            })
            .collect();

        let request = CheckpointRequest {
            thread_id: self.thread_id.clone(),
            checkpoint_ns: Some(self.checkpoint_ns.clone()),
            parent_id: latest.map(|cp| cp.id),
            channel_values: new_values,
            channel_versions,
            versions_seen,
            pending_sends,
            source: Some("loop".to_string()),
            step: Some(step),
            metadata: output.done.then(|| serde_json::json!({"done": true})),
        };

        // The checkpoint recording the intent must be durable before any
        // send executes; transient storage faults abort the super-step as
        // `Unavailable` with the previous checkpoint still authoritative.
        retry::with_backoff(&self.opts.backoff, "checkpoint.put", || {
            let request = request.clone();
            async move { self.engine.checkpoint(request).await }
        })
        .await
    }

    /// Apply the checkpoint's pending sends, gating sensitive ones through
    /// approval. Returns a suspension outcome when a reviewer has not
    /// decided within the caller's wait window; the send stays durable in
    /// the checkpoint for the next resume.
    async fn drain_sends(&mut self, cp: &Checkpoint) -> Result<Option<RunOutcome>> {
        for send in &cp.pending_sends {
            if self.applied_sends.contains(&send.id) {
                continue;
            }

            if !send.sensitive {
                self.apply_send(send).await?;
                continue;
            }

            // One approval request per send: the request id is the send id,
            // so a resumed run finds the existing record.
            let approval = self
                .engine
                .request_approval(ApprovalInput {
                    run_id: self.run_id.clone(),
                    reason: send
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("sensitive send on channel '{}'", send.channel)),
                    context: serde_json::json!({
                        "thread_id": self.thread_id,
                        "checkpoint_id": cp.id.to_string(),
                        "channel": send.channel,
                    }),
                    proposed_action: send.payload.clone(),
                    ttl_seconds: self.opts.approval_ttl_seconds,
                    requested_by: Some(self.consumer_id.clone()),
                    id: Some(send.id),
                })
                .await?;

            let decision = self
                .engine
                .await_decision(
                    approval.id,
                    self.opts.approval_poll_interval,
                    self.opts.approval_wait_timeout,
                )
                .await;

            match decision {
                Ok(settled) => match settled.status {
                    ApprovalStatus::Approved => {
                        self.log(ActivityInput {
                            agent_id: Some(self.consumer_id.clone()),
                            metadata: Some(serde_json::json!({"request_id": settled.id.to_string()})),
                            ..ActivityInput::new(
                                self.run_id.clone(),
                                StepType::Decision,
                                format!(
                                    "send '{}' approved by {}",
                                    send.channel,
                                    settled.reviewed_by.as_deref().unwrap_or("unknown")
                                ),
                            )
                        })
                        .await;
                        self.apply_send(send).await?;
                    }
                    ApprovalStatus::Rejected => {
                        self.log(ActivityInput {
                            metadata: Some(serde_json::json!({"request_id": settled.id.to_string()})),
                            ..ActivityInput::new(
                                self.run_id.clone(),
                                StepType::Decision,
                                format!(
                                    "send '{}' rejected by {}; action aborted",
                                    send.channel,
                                    settled.reviewed_by.as_deref().unwrap_or("unknown")
                                ),
                            )
                        })
                        .await;
                        self.applied_sends.insert(send.id);
                    }
                    ApprovalStatus::Expired => {
                        self.log(ActivityInput {
                            metadata: Some(serde_json::json!({"request_id": settled.id.to_string()})),
                            ..ActivityInput::new(
                                self.run_id.clone(),
                                StepType::Error,
                                format!("approval for send '{}' expired; action aborted", send.channel),
                            )
                        })
                        .await;
                        self.applied_sends.insert(send.id);
                    }
                    ApprovalStatus::Pending => {
                        return Err(Error::Internal(format!(
                            "await_decision returned pending request {}",
                            settled.id
                        )));
                    }
                },
                Err(Error::TimedOut(_)) => {
                    // The send is already durable in this checkpoint, so
                    // suspending loses nothing; the request keeps running
                    // toward its own expiry.
                    self.log(ActivityInput {
                        metadata: Some(serde_json::json!({"request_id": approval.id.to_string()})),
                        ..ActivityInput::new(
                            self.run_id.clone(),
                            StepType::Decision,
                            format!("no decision on send '{}' yet; suspending run", send.channel),
                        )
                    })
                    .await;
                    return Ok(Some(RunOutcome::Suspended {
                        reason: format!("awaiting approval {}", approval.id),
                    }));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn apply_send(&mut self, send: &PendingSend) -> Result<()> {
        self.log(ActivityInput {
            agent_id: Some(self.consumer_id.clone()),
            tool_name: Some(send.channel.clone()),
            tool_input: Some(send.payload.clone()),
            ..ActivityInput::new(
                self.run_id.clone(),
                StepType::Action,
                format!("applying send on channel '{}'", send.channel),
            )
        })
        .await;

        let result = retry::with_backoff(&self.opts.backoff, "send.execute", || {
            let send = send.clone();
            let executor = self.executor.clone();
            async move { executor.execute(&send).await }
        })
        .await;

        match result {
            Ok(output) => {
                self.log(ActivityInput {
                    tool_name: Some(send.channel.clone()),
                    tool_output: Some(output),
                    ..ActivityInput::new(
                        self.run_id.clone(),
                        StepType::Observation,
                        format!("send on channel '{}' applied", send.channel),
                    )
                })
                .await;
                self.applied_sends.insert(send.id);
                Ok(())
            }
            Err(e) => {
                self.log(ActivityInput::new(
                    self.run_id.clone(),
                    StepType::Error,
                    format!("send on channel '{}' failed: {e}", send.channel),
                ))
                .await;
                Err(e)
            }
        }
    }

    async fn log(&self, input: ActivityInput) {
        if let Err(e) = self.engine.record_activity(input).await {
            tracing::error!(run_id = %self.run_id, error = %e, "failed to record activity entry");
        }
    }
}
