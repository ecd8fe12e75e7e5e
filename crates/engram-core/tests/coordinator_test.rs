//! End-to-end runs of the coordinator: checkpoint-before-effect ordering,
//! gated sends, suspension on silent reviewers, and resume.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use engram_core::coordinator::{
    CoordinatorOptions, RunCoordinator, RunOutcome, SendExecutor, SendRequest, StepContext,
    StepHandler, StepOutput,
};
use engram_core::error::Result;
use engram_core::index::usearch::UsearchIndex;
use engram_core::model::activity::StepType;
use engram_core::model::approval::{ApprovalStatus, Decision};
use engram_core::model::checkpoint::PendingSend;
use engram_core::query::gate::ReviewInput;
use engram_core::query::remember::RememberRequest;
use engram_core::query::EngramEngine;
use engram_core::storage::duckdb::DuckDbStorage;
use uuid::Uuid;

const DIMS: usize = 8;

fn create_engine() -> Arc<EngramEngine> {
    let storage = Arc::new(DuckDbStorage::open_in_memory().unwrap());
    let index = Arc::new(UsearchIndex::new(DIMS).unwrap());
    Arc::new(EngramEngine::new(storage, index))
}

fn unit_vector(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    v[axis % DIMS] = 1.0;
    v
}

fn fast_options() -> CoordinatorOptions {
    CoordinatorOptions {
        approval_poll_interval: Duration::from_millis(20),
        approval_wait_timeout: Duration::from_secs(5),
        approval_ttl_seconds: 60,
        ..CoordinatorOptions::default()
    }
}

/// Replays a fixed script of step outputs, indexed by super-step number.
struct ScriptedHandler {
    embedding: Option<Vec<f32>>,
    steps: Vec<StepOutput>,
    seen_memories: Mutex<Vec<usize>>,
}

impl ScriptedHandler {
    fn new(steps: Vec<StepOutput>) -> Self {
        Self {
            embedding: None,
            steps,
            seen_memories: Mutex::new(Vec::new()),
        }
    }

    fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

#[async_trait::async_trait]
impl StepHandler for ScriptedHandler {
    fn context_embedding(&self, _values: &BTreeMap<String, serde_json::Value>) -> Option<Vec<f32>> {
        self.embedding.clone()
    }

    async fn step(&self, ctx: &StepContext) -> Result<StepOutput> {
        self.seen_memories.lock().unwrap().push(ctx.memories.len());
        Ok(self
            .steps
            .get(ctx.step as usize)
            .cloned()
            .unwrap_or_default())
    }
}

struct RecordingExecutor {
    calls: Mutex<Vec<Uuid>>,
}

impl RecordingExecutor {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl SendExecutor for RecordingExecutor {
    async fn execute(&self, send: &PendingSend) -> Result<serde_json::Value> {
        self.calls.lock().unwrap().push(send.id);
        Ok(serde_json::json!({"delivered": send.channel}))
    }
}

fn writes(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_run_checkpoints_each_step() {
    let engine = create_engine();
    let handler = Arc::new(ScriptedHandler::new(vec![
        StepOutput {
            thought: Some("drafting a reply".to_string()),
            writes: writes(&[("x", serde_json::json!(1))]),
            sends: Vec::new(),
            done: false,
        },
        StepOutput {
            thought: None,
            writes: writes(&[("x", serde_json::json!(2))]),
            sends: Vec::new(),
            done: true,
        },
    ]));
    let executor = Arc::new(RecordingExecutor::new());

    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-1".to_string(),
        "thread-1".to_string(),
        "agent-1".to_string(),
        handler,
        executor,
    )
    .with_options(fast_options());

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { steps: 1 });

    let latest = engine.latest_checkpoint("thread-1", "").await.unwrap();
    assert_eq!(latest.channel_values["x"], serde_json::json!(2));
    assert_eq!(latest.channel_versions["x"], 2);
    assert!(latest.is_done());

    let chain = engine.ancestors(latest.id).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].channel_values["x"], serde_json::json!(1));

    // The thought was recorded in the activity log.
    let log = engine.run_activity("run-1", 50).await.unwrap();
    assert!(log
        .iter()
        .any(|e| e.step_type == StepType::Thinking && e.content.contains("drafting")));
}

#[tokio::test]
async fn test_run_is_resumable_after_completion() {
    let engine = create_engine();
    let handler = Arc::new(ScriptedHandler::new(vec![StepOutput {
        thought: None,
        writes: writes(&[("x", serde_json::json!(1))]),
        sends: Vec::new(),
        done: true,
    }]));

    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-1".to_string(),
        "thread-1".to_string(),
        "agent-1".to_string(),
        handler.clone(),
        Arc::new(RecordingExecutor::new()),
    )
    .with_options(fast_options());
    coordinator.run().await.unwrap();

    // Running again on the same thread is a no-op re-read of durable state.
    let mut resumed = RunCoordinator::new(
        engine.clone(),
        "run-1".to_string(),
        "thread-1".to_string(),
        "agent-1".to_string(),
        handler,
        Arc::new(RecordingExecutor::new()),
    )
    .with_options(fast_options());
    let outcome = resumed.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { steps: 0 });

    let chain = engine
        .ancestors(engine.latest_checkpoint("thread-1", "").await.unwrap().id)
        .await
        .unwrap();
    assert_eq!(chain.len(), 1);
}

#[tokio::test]
async fn test_quiescent_handler_completes() {
    let engine = create_engine();
    // A handler with nothing to write settles after one observation step.
    let handler = Arc::new(ScriptedHandler::new(Vec::new()));
    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-1".to_string(),
        "thread-quiet".to_string(),
        "agent-1".to_string(),
        handler,
        Arc::new(RecordingExecutor::new()),
    )
    .with_options(fast_options());

    let outcome = coordinator.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
}

#[tokio::test]
async fn test_seed_then_run_consumes_input() {
    let engine = create_engine();
    let handler = Arc::new(ScriptedHandler::new(vec![
        StepOutput::default(), // step 0 is the seed, never computed
        StepOutput {
            thought: None,
            writes: writes(&[("reply", serde_json::json!("done"))]),
            sends: Vec::new(),
            done: true,
        },
    ]));

    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-1".to_string(),
        "thread-seeded".to_string(),
        "agent-1".to_string(),
        handler,
        Arc::new(RecordingExecutor::new()),
    )
    .with_options(fast_options());

    let seed = coordinator
        .seed(writes(&[("input", serde_json::json!("hello"))]))
        .await
        .unwrap();
    assert_eq!(seed.source, "input");
    assert_eq!(seed.channel_versions["input"], 1);

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { steps: 1 });

    let latest = engine.latest_checkpoint("thread-seeded", "").await.unwrap();
    assert_eq!(latest.channel_values["input"], serde_json::json!("hello"));
    assert_eq!(latest.channel_values["reply"], serde_json::json!("done"));
    // The run recorded what it had observed when it stepped.
    assert_eq!(latest.versions_seen["agent-1"]["input"], 1);
}

#[tokio::test]
async fn test_plain_send_executes_after_checkpoint() {
    let engine = create_engine();
    let executor = Arc::new(RecordingExecutor::new());
    let handler = Arc::new(ScriptedHandler::new(vec![StepOutput {
        thought: None,
        writes: writes(&[("x", serde_json::json!(1))]),
        sends: vec![SendRequest {
            channel: "notify".to_string(),
            payload: serde_json::json!({"to": "ops"}),
            sensitive: false,
            reason: None,
        }],
        done: true,
    }]));

    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-1".to_string(),
        "thread-1".to_string(),
        "agent-1".to_string(),
        handler,
        executor.clone(),
    )
    .with_options(fast_options());

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { steps: 0 });

    // The send executed exactly once and its intent is durable in the
    // checkpoint that preceded it.
    let calls = executor.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    let latest = engine.latest_checkpoint("thread-1", "").await.unwrap();
    assert_eq!(latest.pending_sends.len(), 1);
    assert_eq!(latest.pending_sends[0].id, calls[0]);

    let log = engine.run_activity("run-1", 50).await.unwrap();
    assert!(log.iter().any(|e| e.step_type == StepType::Action));
    assert!(log
        .iter()
        .any(|e| e.step_type == StepType::Observation && e.tool_output.is_some()));
}

#[tokio::test]
async fn test_sensitive_send_waits_for_approval() {
    let engine = create_engine();
    let executor = Arc::new(RecordingExecutor::new());
    let handler = Arc::new(ScriptedHandler::new(vec![StepOutput {
        thought: None,
        writes: writes(&[("draft", serde_json::json!("email body"))]),
        sends: vec![SendRequest {
            channel: "email".to_string(),
            payload: serde_json::json!({"to": "student@example.edu"}),
            sensitive: true,
            reason: Some("outbound email to a student".to_string()),
        }],
        done: true,
    }]));

    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-hitl".to_string(),
        "thread-hitl".to_string(),
        "agent-1".to_string(),
        handler,
        executor.clone(),
    )
    .with_options(fast_options());

    // Approve from a concurrent reviewer once the request shows up.
    let reviewer_engine = engine.clone();
    let reviewer = tokio::spawn(async move {
        loop {
            let pending = reviewer_engine.pending_approvals(10).await.unwrap();
            if let Some(request) = pending.first() {
                reviewer_engine
                    .review(ReviewInput {
                        request_id: request.id,
                        reviewer_id: "operator".to_string(),
                        decision: Decision::Approve,
                        notes: Some("ok to send".to_string()),
                    })
                    .await
                    .unwrap();
                return request.id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { steps: 0 });

    let request_id = reviewer.await.unwrap();
    assert_eq!(executor.calls.lock().unwrap().len(), 1);

    // The approval request carries the send's identity and proposed action.
    let request = engine.storage.get_approval(request_id).await.unwrap().unwrap();
    assert_eq!(request.status, ApprovalStatus::Approved);
    assert_eq!(request.run_id, "run-hitl");
    assert_eq!(
        request.proposed_action,
        serde_json::json!({"to": "student@example.edu"})
    );

    let log = engine.run_activity("run-hitl", 50).await.unwrap();
    assert!(log
        .iter()
        .any(|e| e.step_type == StepType::Decision && e.content.contains("approved")));
}

#[tokio::test]
async fn test_rejected_send_is_aborted() {
    let engine = create_engine();
    let executor = Arc::new(RecordingExecutor::new());
    let handler = Arc::new(ScriptedHandler::new(vec![StepOutput {
        thought: None,
        writes: writes(&[("draft", serde_json::json!("risky"))]),
        sends: vec![SendRequest {
            channel: "email".to_string(),
            payload: serde_json::json!({"to": "everyone"}),
            sensitive: true,
            reason: Some("mass email".to_string()),
        }],
        done: true,
    }]));

    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-rejected".to_string(),
        "thread-rejected".to_string(),
        "agent-1".to_string(),
        handler,
        executor.clone(),
    )
    .with_options(fast_options());

    let reviewer_engine = engine.clone();
    let reviewer = tokio::spawn(async move {
        loop {
            let pending = reviewer_engine.pending_approvals(10).await.unwrap();
            if let Some(request) = pending.first() {
                reviewer_engine
                    .review(ReviewInput {
                        request_id: request.id,
                        reviewer_id: "operator".to_string(),
                        decision: Decision::Reject,
                        notes: Some("too broad".to_string()),
                    })
                    .await
                    .unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let outcome = coordinator.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { steps: 0 });
    reviewer.await.unwrap();

    // The action never executed and the outcome is in the audit log.
    assert!(executor.calls.lock().unwrap().is_empty());
    let log = engine.run_activity("run-rejected", 50).await.unwrap();
    assert!(log
        .iter()
        .any(|e| e.step_type == StepType::Decision && e.content.contains("rejected")));
}

#[tokio::test]
async fn test_silent_reviewer_suspends_then_resumes() {
    let engine = create_engine();
    let executor = Arc::new(RecordingExecutor::new());
    let handler = Arc::new(ScriptedHandler::new(vec![StepOutput {
        thought: None,
        writes: writes(&[("draft", serde_json::json!("pending"))]),
        sends: vec![SendRequest {
            channel: "email".to_string(),
            payload: serde_json::json!({"to": "registrar"}),
            sensitive: true,
            reason: Some("needs sign-off".to_string()),
        }],
        done: true,
    }]));

    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-suspend".to_string(),
        "thread-suspend".to_string(),
        "agent-1".to_string(),
        handler.clone(),
        executor.clone(),
    )
    .with_options(CoordinatorOptions {
        approval_poll_interval: Duration::from_millis(20),
        approval_wait_timeout: Duration::from_millis(150),
        approval_ttl_seconds: 3600,
        ..CoordinatorOptions::default()
    });

    let outcome = coordinator.run().await.unwrap();
    assert!(matches!(outcome, RunOutcome::Suspended { .. }));
    assert!(executor.calls.lock().unwrap().is_empty());

    // The intent survived suspension: the send is durable in the latest
    // checkpoint and its approval request is still pending.
    let latest = engine.latest_checkpoint("thread-suspend", "").await.unwrap();
    assert_eq!(latest.pending_sends.len(), 1);
    let send_id = latest.pending_sends[0].id;
    let request = engine.storage.get_approval(send_id).await.unwrap().unwrap();
    assert_eq!(request.status, ApprovalStatus::Pending);

    // An operator approves while the run is parked.
    engine
        .review(ReviewInput {
            request_id: send_id,
            reviewer_id: "operator".to_string(),
            decision: Decision::Approve,
            notes: None,
        })
        .await
        .unwrap();

    // A fresh coordinator (fresh process) picks the run back up from the
    // durable checkpoint and applies the send once.
    let mut resumed = RunCoordinator::new(
        engine.clone(),
        "run-suspend".to_string(),
        "thread-suspend".to_string(),
        "agent-1".to_string(),
        handler,
        executor.clone(),
    )
    .with_options(fast_options());

    let outcome = resumed.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { steps: 0 });
    assert_eq!(executor.calls.lock().unwrap().clone(), vec![send_id]);
}

#[tokio::test]
async fn test_recalled_memories_reach_the_handler() {
    let engine = create_engine();

    engine
        .remember(RememberRequest {
            content: "The registrar prefers morning emails".to_string(),
            embedding: unit_vector(0),
            memory_type: None,
            importance: Some(0.9),
            agent_id: None,
            metadata: None,
        })
        .await
        .unwrap();

    let handler = Arc::new(
        ScriptedHandler::new(vec![StepOutput {
            thought: None,
            writes: writes(&[("x", serde_json::json!(1))]),
            sends: Vec::new(),
            done: true,
        }])
        .with_embedding(unit_vector(0)),
    );

    let mut coordinator = RunCoordinator::new(
        engine.clone(),
        "run-recall".to_string(),
        "thread-recall".to_string(),
        "agent-1".to_string(),
        handler.clone(),
        Arc::new(RecordingExecutor::new()),
    )
    .with_options(fast_options());

    coordinator.run().await.unwrap();

    // The step saw the recalled memory folded into its context.
    assert_eq!(handler.seen_memories.lock().unwrap().clone(), vec![1]);

    let log = engine.run_activity("run-recall", 50).await.unwrap();
    assert!(log
        .iter()
        .any(|e| e.step_type == StepType::Observation && e.content.contains("recalled 1")));
}
