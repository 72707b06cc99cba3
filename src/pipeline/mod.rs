pub mod orchestrator;
pub mod registry;
pub mod stages;
pub mod state;

use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::resource::ResourceError;
use state::{RequestStatus, StateField};

/// How a stage attempt failed, as reported by the stage itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Retryable (e.g. a transient device allocation failure).
    #[error("transient stage error: {0}")]
    Transient(String),

    /// Not retryable; the run fails immediately.
    #[error("fatal stage error: {0}")]
    Fatal(String),
}

/// Registration-time contract violations, caught before any stage runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' writes {field:?}, already frozen by stage '{earlier}'")]
    WriteConflict {
        stage: String,
        field: StateField,
        earlier: String,
    },

    #[error("non-gated stage '{0}' registered after a gated stage")]
    GatedOrder(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("stage '{stage}' exhausted {max_retries} retries")]
    MaxRetriesExceeded { stage: String, max_retries: u32 },

    #[error("request {0} not found")]
    RequestNotFound(Uuid),

    #[error("request {request_id} is '{}', not awaiting approval", .status.as_str())]
    InvalidState {
        request_id: Uuid,
        status: RequestStatus,
    },

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}
