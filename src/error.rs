// Pipeline error taxonomy
//
// Every failure is surfaced synchronously at the call site that triggered it.
// Nothing here is retried automatically; retry policy belongs to the application.

use crate::pipeline::PipelineState;
use crate::types::StreamKey;

/// Errors that can occur while configuring, starting or reading from a pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{operation} is not allowed while the pipeline is {state}")]
    InvalidState {
        operation: &'static str,
        state: PipelineState,
    },

    #[error("No device satisfies the requested configuration: {reason}")]
    ConfigurationUnsatisfiable { reason: String },

    #[error("No connected device with serial '{serial}'")]
    DeviceSelectorNotFound { serial: String },

    #[error("Stream {stream} on device '{serial}' is owned by another client")]
    DeviceBusy { serial: String, stream: StreamKey },

    #[error("No frameset arrived within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Pipeline is not streaming")]
    PipelineStopped,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Device backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn invalid_state(operation: &'static str, state: PipelineState) -> Self {
        PipelineError::InvalidState { operation, state }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
