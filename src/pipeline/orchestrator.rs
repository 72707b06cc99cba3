//! The state machine driving a request through the stage sequence.
//!
//! Init → Vision → [Sanitize] → Retrieval → Reasoning → AwaitingApproval →
//! {Voice → Completed} | Rejected | Failed. Each heavy stage runs inside one
//! reserve/load/release lease cycle, and the state snapshot is persisted
//! after every stage and at the suspension point, so a process restart never
//! loses a pending approval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

use crate::config::PipelineSettings;
use crate::db::repository::{get_request, upsert_request};
use crate::resource::{ResourceArbiter, ResourceError};

use super::registry::{StageRegistry, StageSpec};
use super::state::{
    ApprovalDecision, HistoryEntry, PipelineState, RequestStatus, StageOutcome,
};
use super::{PipelineError, StageError};

/// History name for gate events (suspension, decision, cancellation).
pub const STAGE_GATE: &str = "approval_gate";

// ═══════════════════════════════════════════════════════════
// Reports and cancellation
// ═══════════════════════════════════════════════════════════

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ResourceBusy,
    ResourceExhausted,
    FatalStage,
    MaxRetriesExceeded,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub stage: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Terminal (or suspended) outcome of a submission or decision.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub request_id: Uuid,
    pub status: RequestStatus,
    pub last_successful_stage: Option<String>,
    pub failure: Option<FailureReport>,
    /// Preserved on rejection for audit.
    pub reasoning_output: Option<String>,
    pub audio_bytes: Option<usize>,
    pub history: Vec<HistoryEntry>,
}

/// Cooperative cancellation flag checked between stages. An in-flight stage
/// always finishes (lease release is unconditional); its output is then
/// discarded and the run marked failed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

pub struct PipelineOrchestrator {
    settings: PipelineSettings,
    arbiter: ResourceArbiter,
    registry: StageRegistry,
}

impl PipelineOrchestrator {
    pub fn new(settings: PipelineSettings, registry: StageRegistry) -> Self {
        let arbiter = ResourceArbiter::new(settings.device_budget_bytes, settings.busy_policy);
        Self {
            settings,
            arbiter,
            registry,
        }
    }

    /// The arbiter owning this orchestrator's lease state, for diagnostics.
    pub fn arbiter(&self) -> &ResourceArbiter {
        &self.arbiter
    }

    /// Drive a new request up to the approval gate.
    pub fn submit(
        &self,
        state: PipelineState,
        conn: &Connection,
    ) -> Result<RunReport, PipelineError> {
        self.submit_with_cancel(state, conn, &CancelToken::new())
    }

    pub fn submit_with_cancel(
        &self,
        mut state: PipelineState,
        conn: &Connection,
        cancel: &CancelToken,
    ) -> Result<RunReport, PipelineError> {
        tracing::info!(request_id = %state.request_id, query = %state.query, "Request submitted");
        upsert_request(conn, &state, RequestStatus::InProgress)?;

        for spec in self.registry.pre_gate() {
            if cancel.is_cancelled() {
                return self.finish_cancelled(state, spec, conn, "cancelled before stage");
            }

            if let Some(failure) = self.run_stage(spec, &mut state) {
                upsert_request(conn, &state, RequestStatus::Failed)?;
                return Ok(report(state, RequestStatus::Failed, Some(failure)));
            }
            upsert_request(conn, &state, RequestStatus::InProgress)?;

            if cancel.is_cancelled() {
                // The stage was allowed to finish; discard its writes.
                for field in &spec.writes {
                    state.clear_field(*field);
                }
                return self.finish_cancelled(state, spec, conn, "cancelled after stage completed");
            }
        }

        // Suspend with no device resource held; the decision arrives later
        // through submit_decision, possibly from another process lifetime.
        state.record(STAGE_GATE, StageOutcome::Suspended);
        upsert_request(conn, &state, RequestStatus::AwaitingApproval)?;
        tracing::info!(request_id = %state.request_id, "Suspended awaiting approval");
        Ok(report(state, RequestStatus::AwaitingApproval, None))
    }

    /// Resolve the approval gate for a suspended request.
    ///
    /// Anything but a request in `AwaitingApproval` is a caller contract
    /// violation, reported synchronously without mutating persisted state.
    pub fn submit_decision(
        &self,
        request_id: &Uuid,
        decision: ApprovalDecision,
        conn: &Connection,
    ) -> Result<RunReport, PipelineError> {
        let persisted =
            get_request(conn, request_id)?.ok_or(PipelineError::RequestNotFound(*request_id))?;
        if persisted.status != RequestStatus::AwaitingApproval
            || decision == ApprovalDecision::Pending
        {
            return Err(PipelineError::InvalidState {
                request_id: *request_id,
                status: persisted.status,
            });
        }

        let mut state = persisted.state;
        state.approval_decision = decision;

        if decision == ApprovalDecision::Rejected {
            state.record(STAGE_GATE, StageOutcome::Rejected);
            upsert_request(conn, &state, RequestStatus::Rejected)?;
            tracing::info!(request_id = %request_id, "Request rejected at the gate");
            return Ok(report(state, RequestStatus::Rejected, None));
        }

        state.record(STAGE_GATE, StageOutcome::Approved);
        for spec in self.registry.post_gate() {
            if let Some(failure) = self.run_stage(spec, &mut state) {
                upsert_request(conn, &state, RequestStatus::Failed)?;
                return Ok(report(state, RequestStatus::Failed, Some(failure)));
            }
        }
        upsert_request(conn, &state, RequestStatus::Completed)?;
        tracing::info!(request_id = %request_id, "Request completed");
        Ok(report(state, RequestStatus::Completed, None))
    }

    /// Cancel a suspended request. Terminal requests cannot be cancelled.
    pub fn cancel(
        &self,
        request_id: &Uuid,
        conn: &Connection,
    ) -> Result<RunReport, PipelineError> {
        let persisted =
            get_request(conn, request_id)?.ok_or(PipelineError::RequestNotFound(*request_id))?;
        if persisted.status.is_terminal() {
            return Err(PipelineError::InvalidState {
                request_id: *request_id,
                status: persisted.status,
            });
        }

        let mut state = persisted.state;
        state.record(STAGE_GATE, StageOutcome::Cancelled);
        upsert_request(conn, &state, RequestStatus::Failed)?;
        tracing::info!(request_id = %request_id, "Request cancelled");
        Ok(report(
            state,
            RequestStatus::Failed,
            Some(FailureReport {
                stage: STAGE_GATE.to_string(),
                kind: FailureKind::Cancelled,
                message: "request cancelled".to_string(),
            }),
        ))
    }

    /// Run one stage with in-place retries for transient errors.
    fn run_stage(&self, spec: &StageSpec, state: &mut PipelineState) -> Option<FailureReport> {
        loop {
            state.record(spec.name, StageOutcome::Started);
            tracing::info!(
                request_id = %state.request_id,
                stage = spec.name,
                retry_count = state.retry_count,
                "Stage started"
            );

            match self.execute_attempt(spec, state) {
                Ok(()) => {
                    state.record(spec.name, StageOutcome::Succeeded);
                    return None;
                }
                Err(PipelineError::StageFailed {
                    source: StageError::Transient(reason),
                    ..
                }) => {
                    state.record(
                        spec.name,
                        StageOutcome::TransientFailure {
                            reason: reason.clone(),
                        },
                    );
                    // Already at the bound: escalate, do not retry again.
                    if state.retry_count >= self.settings.max_retries {
                        state.record(spec.name, StageOutcome::RetriesExhausted);
                        let err = PipelineError::MaxRetriesExceeded {
                            stage: spec.name.to_string(),
                            max_retries: self.settings.max_retries,
                        };
                        tracing::error!(request_id = %state.request_id, stage = spec.name, %err, "Run failed");
                        return Some(FailureReport {
                            stage: spec.name.to_string(),
                            kind: FailureKind::MaxRetriesExceeded,
                            message: err.to_string(),
                        });
                    }
                    state.retry_count += 1;
                    for field in &spec.writes {
                        state.clear_field(*field);
                    }
                    tracing::warn!(
                        request_id = %state.request_id,
                        stage = spec.name,
                        retry_count = state.retry_count,
                        reason = %reason,
                        "Transient failure, retrying stage"
                    );
                }
                Err(err) => {
                    let kind = match &err {
                        PipelineError::Resource(ResourceError::Busy { .. }) => {
                            FailureKind::ResourceBusy
                        }
                        PipelineError::Resource(ResourceError::Exhausted { .. }) => {
                            FailureKind::ResourceExhausted
                        }
                        _ => FailureKind::FatalStage,
                    };
                    state.record(
                        spec.name,
                        StageOutcome::FatalFailure {
                            reason: err.to_string(),
                        },
                    );
                    tracing::error!(request_id = %state.request_id, stage = spec.name, %err, "Run failed");
                    return Some(FailureReport {
                        stage: spec.name.to_string(),
                        kind,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// One attempt: reserve the stage's resource class, load under the
    /// lease, run, release. The lease drops on every exit path.
    fn execute_attempt(
        &self,
        spec: &StageSpec,
        state: &mut PipelineState,
    ) -> Result<(), PipelineError> {
        let run = |state: &mut PipelineState| {
            spec.stage()
                .run(state)
                .map_err(|source| PipelineError::StageFailed {
                    stage: spec.name.to_string(),
                    source,
                })
        };

        match spec.resource_class {
            Some(class) => {
                let reservation = self.arbiter.reserve(class)?;
                let _lease = reservation.load(|| spec.stage().prepare()).map_err(
                    |source| PipelineError::StageFailed {
                        stage: spec.name.to_string(),
                        source,
                    },
                )?;
                run(state)
            }
            None => run(state),
        }
    }

    fn finish_cancelled(
        &self,
        mut state: PipelineState,
        spec: &StageSpec,
        conn: &Connection,
        message: &str,
    ) -> Result<RunReport, PipelineError> {
        state.record(spec.name, StageOutcome::Cancelled);
        upsert_request(conn, &state, RequestStatus::Failed)?;
        tracing::info!(request_id = %state.request_id, stage = spec.name, "Request cancelled");
        Ok(report(
            state,
            RequestStatus::Failed,
            Some(FailureReport {
                stage: spec.name.to_string(),
                kind: FailureKind::Cancelled,
                message: message.to_string(),
            }),
        ))
    }
}

fn report(
    state: PipelineState,
    status: RequestStatus,
    failure: Option<FailureReport>,
) -> RunReport {
    RunReport {
        request_id: state.request_id,
        status,
        last_successful_stage: state.last_successful_stage().map(String::from),
        failure,
        reasoning_output: state.reasoning_output.clone(),
        audio_bytes: state.audio_output.as_ref().map(Vec::len),
        history: state.history,
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
