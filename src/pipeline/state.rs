//! The single mutable record threaded through all pipeline stages.
//!
//! Stages write only their declared fields; the history is append-only and
//! reconstructs the full execution trace for diagnostics and audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One input document as submitted (bytes + media type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDocument {
    pub bytes: Vec<u8>,
    pub media_type: String,
}

impl InputDocument {
    pub fn new(bytes: Vec<u8>, media_type: &str) -> Self {
        Self {
            bytes,
            media_type: media_type.to_string(),
        }
    }
}

/// One retrieved context record with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedRecord {
    pub record_id: String,
    pub text: String,
    pub score: f32,
}

/// Decision state of the human-in-the-loop gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Rejected,
}

/// Persisted run status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    InProgress,
    AwaitingApproval,
    Completed,
    Rejected,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }
}

/// PipelineState fields a stage may declare as read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    ExtractedText,
    RetrievedContext,
    ReasoningOutput,
    ApprovalDecision,
    AudioOutput,
}

/// Outcome of one stage attempt or gate event, as recorded in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Started,
    Succeeded,
    TransientFailure { reason: String },
    FatalFailure { reason: String },
    RetriesExhausted,
    Suspended,
    Approved,
    Rejected,
    Cancelled,
}

/// One append-only history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub stage: String,
    pub at: DateTime<Utc>,
    pub outcome: StageOutcome,
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// The shared state carried through the pipeline for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Immutable, assigned at creation.
    pub request_id: Uuid,
    /// Immutable after creation.
    pub raw_inputs: Vec<InputDocument>,
    /// The clinician's query accompanying the documents.
    pub query: String,
    /// Written once by the vision stage.
    pub extracted_text: Option<String>,
    /// Written once by the retrieval stage.
    pub retrieved_context: Vec<RetrievedRecord>,
    /// Written by the reasoning stage; overwritten at most once on retry.
    pub reasoning_output: Option<String>,
    /// Mutated only by the human-in-the-loop gate.
    pub approval_decision: ApprovalDecision,
    /// Populated only after an Approved decision.
    pub audio_output: Option<Vec<u8>>,
    /// Append-only execution trace.
    pub history: Vec<HistoryEntry>,
    /// Incremented only by the retry transition, bounded by max_retries.
    pub retry_count: u32,
}

impl PipelineState {
    pub fn new(raw_inputs: Vec<InputDocument>, query: &str) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            raw_inputs,
            query: query.to_string(),
            extracted_text: None,
            retrieved_context: Vec::new(),
            reasoning_output: None,
            approval_decision: ApprovalDecision::Pending,
            audio_output: None,
            history: Vec::new(),
            retry_count: 0,
        }
    }

    /// Append a history entry. History is never mutated, only appended.
    pub fn record(&mut self, stage: &str, outcome: StageOutcome) {
        self.history.push(HistoryEntry {
            stage: stage.to_string(),
            at: Utc::now(),
            outcome,
        });
    }

    /// Last stage that recorded a successful exit, for failure reports.
    pub fn last_successful_stage(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|e| e.outcome == StageOutcome::Succeeded)
            .map(|e| e.stage.as_str())
    }

    /// Discard a stage's written field, used when a transient retry
    /// re-enters the stage or a cancelled stage's output is dropped.
    pub fn clear_field(&mut self, field: StateField) {
        match field {
            StateField::ExtractedText => self.extracted_text = None,
            StateField::RetrievedContext => self.retrieved_context.clear(),
            StateField::ReasoningOutput => self.reasoning_output = None,
            StateField::ApprovalDecision => self.approval_decision = ApprovalDecision::Pending,
            StateField::AudioOutput => self.audio_output = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PipelineState {
        PipelineState::new(
            vec![InputDocument::new(b"receipt text".to_vec(), "text/plain")],
            "Extract billing details",
        )
    }

    #[test]
    fn new_state_is_pending_and_empty() {
        let s = state();
        assert_eq!(s.approval_decision, ApprovalDecision::Pending);
        assert!(s.extracted_text.is_none());
        assert!(s.retrieved_context.is_empty());
        assert!(s.audio_output.is_none());
        assert!(s.history.is_empty());
        assert_eq!(s.retry_count, 0);
    }

    #[test]
    fn history_preserves_order() {
        let mut s = state();
        s.record("vision", StageOutcome::Started);
        s.record("vision", StageOutcome::Succeeded);
        s.record("retrieval", StageOutcome::Started);

        let stages: Vec<&str> = s.history.iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(stages, vec!["vision", "vision", "retrieval"]);
    }

    #[test]
    fn last_successful_stage_skips_failures() {
        let mut s = state();
        s.record("vision", StageOutcome::Succeeded);
        s.record(
            "retrieval",
            StageOutcome::FatalFailure {
                reason: "index empty".into(),
            },
        );
        assert_eq!(s.last_successful_stage(), Some("vision"));
    }

    #[test]
    fn clear_field_resets_written_output() {
        let mut s = state();
        s.reasoning_output = Some("draft report".into());
        s.clear_field(StateField::ReasoningOutput);
        assert!(s.reasoning_output.is_none());

        s.retrieved_context.push(RetrievedRecord {
            record_id: "abc".into(),
            text: "context".into(),
            score: 0.9,
        });
        s.clear_field(StateField::RetrievedContext);
        assert!(s.retrieved_context.is_empty());
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut s = state();
        s.extracted_text = Some("Sốt cao và đau đầu".into());
        s.record("vision", StageOutcome::Succeeded);

        let json = serde_json::to_string(&s).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();

        assert_eq!(back.request_id, s.request_id);
        assert_eq!(back.extracted_text.as_deref(), Some("Sốt cao và đau đầu"));
        assert_eq!(back.history.len(), 1);
    }

    #[test]
    fn terminal_statuses() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
        assert!(RequestStatus::Failed.is_terminal());
        assert!(!RequestStatus::InProgress.is_terminal());
        assert!(!RequestStatus::AwaitingApproval.is_terminal());
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            RequestStatus::InProgress,
            RequestStatus::AwaitingApproval,
            RequestStatus::Completed,
            RequestStatus::Rejected,
            RequestStatus::Failed,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("nonsense"), None);
    }
}
