//! Human-in-the-loop approval gate.
//!
//! `pending --review(approve)--> approved`, `pending --review(reject)-->
//! rejected`, `pending --deadline--> expired`; all three targets terminal.
//! Reviews and sweeps both mutate status through conditional writes keyed on
//! `status = 'pending'`, so a request is never observed to transition twice.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::approval::{ApprovalRequest, ApprovalStatus, Decision};
use crate::query::EngramEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalInput {
    pub run_id: String,
    pub reason: String,
    pub context: serde_json::Value,
    pub proposed_action: serde_json::Value,
    pub ttl_seconds: i64,
    pub requested_by: Option<String>,
    /// Caller-chosen identity, used by the coordinator to make request
    /// creation idempotent across resumes (one request per pending send).
    pub id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewInput {
    pub request_id: Uuid,
    pub reviewer_id: String,
    pub decision: Decision,
    pub notes: Option<String>,
}

pub async fn request(engine: &EngramEngine, input: ApprovalInput) -> Result<ApprovalRequest> {
    if input.run_id.trim().is_empty() {
        return Err(Error::Validation("run_id cannot be empty".to_string()));
    }
    if input.reason.trim().is_empty() {
        return Err(Error::Validation("reason cannot be empty".to_string()));
    }
    if input.ttl_seconds <= 0 {
        return Err(Error::Validation("ttl must be positive".to_string()));
    }

    let id = input.id.unwrap_or_else(Uuid::now_v7);

    // Idempotent creation: a resumed run re-requesting the same send gets
    // the existing record back instead of a duplicate.
    if let Some(existing) = engine.storage.get_approval(id).await? {
        return Ok(existing);
    }

    let now = chrono::Utc::now();
    let request = ApprovalRequest {
        id,
        run_id: input.run_id,
        requested_by: input.requested_by,
        reason: input.reason,
        context: input.context,
        proposed_action: input.proposed_action,
        status: ApprovalStatus::Pending,
        reviewed_by: None,
        review_notes: None,
        reviewed_at: None,
        created_at: now.to_rfc3339(),
        expires_at: (now + chrono::Duration::seconds(input.ttl_seconds)).to_rfc3339(),
    };
    engine.storage.insert_approval(&request).await?;

    tracing::info!(
        request_id = %request.id,
        run_id = %request.run_id,
        expires_at = %request.expires_at,
        "approval requested"
    );

    Ok(request)
}

/// Apply a reviewer decision. Fails `AlreadyDecided` on approved/rejected
/// rows, `Expired` on expired rows or pending rows past their deadline; the
/// deadline check rides in the conditional update, not just the sweep.
pub async fn review(engine: &EngramEngine, input: ReviewInput) -> Result<ApprovalRequest> {
    let now = chrono::Utc::now().to_rfc3339();
    let applied = engine
        .storage
        .settle_approval(
            input.request_id,
            input.decision.target_status(),
            &input.reviewer_id,
            input.notes.as_deref(),
            &now,
        )
        .await?;

    if applied {
        let settled = engine
            .storage
            .get_approval(input.request_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("request {} vanished after review", input.request_id)))?;
        tracing::info!(
            request_id = %settled.id,
            status = %settled.status,
            reviewer = %input.reviewer_id,
            "approval reviewed"
        );
        return Ok(settled);
    }

    // The conditional write did not apply; fetch to find out why.
    let current = engine
        .storage
        .get_approval(input.request_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("approval request {} not found", input.request_id)))?;

    match current.status {
        ApprovalStatus::Approved | ApprovalStatus::Rejected => Err(Error::AlreadyDecided(format!(
            "request {} already {}",
            current.id, current.status
        ))),
        ApprovalStatus::Expired => {
            Err(Error::Expired(format!("request {} expired", current.id)))
        }
        ApprovalStatus::Pending => {
            // Pending but past its deadline; settle the audit record the way
            // the sweep would and report the review as too late.
            engine.storage.expire_approval(current.id, &now).await?;
            Err(Error::Expired(format!(
                "request {} expired at {}",
                current.id, current.expires_at
            )))
        }
    }
}

/// Transition every pending request whose deadline has passed. Safe to run
/// concurrently with reviews; returns how many rows transitioned.
pub async fn sweep_expired(engine: &EngramEngine, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
    let count = engine
        .storage
        .expire_due_approvals(&now.to_rfc3339())
        .await?;
    if count > 0 {
        tracing::info!(count, "approval requests expired by sweep");
    }
    Ok(count)
}

pub async fn list_pending(engine: &EngramEngine, limit: usize) -> Result<Vec<ApprovalRequest>> {
    engine
        .storage
        .list_pending_approvals(&chrono::Utc::now().to_rfc3339(), limit)
        .await
}

/// Block until the request reaches a terminal state or the caller's own
/// timeout elapses. `TimedOut` leaves the request untouched; its lifecycle
/// keeps running toward its own expiry independently of this waiter.
pub async fn await_decision(
    engine: &EngramEngine,
    request_id: Uuid,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<ApprovalRequest> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let current = engine
            .storage
            .get_approval(request_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("approval request {request_id} not found")))?;

        if current.is_terminal() {
            return Ok(current);
        }

        // A waiter that outlives the deadline settles the expiry itself
        // instead of spinning until a sweep happens to run.
        let now = chrono::Utc::now().to_rfc3339();
        if current.expires_at <= now {
            engine.storage.expire_approval(request_id, &now).await?;
            if let Some(settled) = engine.storage.get_approval(request_id).await? {
                if settled.is_terminal() {
                    return Ok(settled);
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::TimedOut(format!(
                "no decision on request {request_id} within {timeout:?}"
            )));
        }
        tokio::time::sleep(poll_interval).await;
    }
}
