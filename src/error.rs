//! Domain errors shared by the pipeline and the HTTP surface.
//!
//! The HTTP status/body mapping lives in [`crate::api`]; workers and the
//! chunker deal only in these variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Service is already running")]
    ServiceAlreadyRunning,

    #[error("Service is not running")]
    ServiceNotRunning,

    #[error("{0}")]
    InvalidConfig(String),

    #[error("DATABASE_URL not configured")]
    DatabaseNotConfigured,

    #[error("Event {0} not found")]
    EventNotFound(i32),

    #[error("Video file at path {0} not found")]
    InvalidVideoPath(String),

    #[error("Video processing failed: {0}")]
    VideoProcessingFailed(String),

    #[error("Frame extraction failed: {0}")]
    FrameExtractionFailed(String),

    #[error("AI detection failed: {0}")]
    AiDetectionFailed(String),
}

impl PipelineError {
    /// Stable machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ServiceAlreadyRunning => "SERVICE_ALREADY_RUNNING",
            Self::ServiceNotRunning => "SERVICE_NOT_RUNNING",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::DatabaseNotConfigured => "DATABASE_NOT_CONFIGURED",
            Self::EventNotFound(_) => "EVENT_NOT_FOUND",
            Self::InvalidVideoPath(_) => "INVALID_VIDEO_PATH",
            Self::VideoProcessingFailed(_) => "VIDEO_PROCESSING_FAILED",
            Self::FrameExtractionFailed(_) => "FRAME_EXTRACTION_FAILED",
            Self::AiDetectionFailed(_) => "AI_DETECTION_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(PipelineError::ServiceAlreadyRunning.code(), "SERVICE_ALREADY_RUNNING");
        assert_eq!(PipelineError::ServiceNotRunning.code(), "SERVICE_NOT_RUNNING");
        assert_eq!(PipelineError::InvalidConfig("x".into()).code(), "INVALID_CONFIG");
        assert_eq!(PipelineError::DatabaseNotConfigured.code(), "DATABASE_NOT_CONFIGURED");
        assert_eq!(PipelineError::EventNotFound(3).code(), "EVENT_NOT_FOUND");
        assert_eq!(PipelineError::InvalidVideoPath("/x".into()).code(), "INVALID_VIDEO_PATH");
    }

    #[test]
    fn messages_carry_detail() {
        let err = PipelineError::EventNotFound(42);
        assert_eq!(err.to_string(), "Event 42 not found");

        let err = PipelineError::InvalidConfig("chunk duration must be positive".into());
        assert_eq!(err.to_string(), "chunk duration must be positive");
    }
}
