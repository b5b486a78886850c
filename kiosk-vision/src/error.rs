use thiserror::Error;

/// Failures surfaced by [`crate::source::FrameSource`].
///
/// Per-cycle capture misses never show up here; the loop skips them.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("failed to spawn capture worker: {0}")]
    Worker(#[from] std::io::Error),
}

/// Failures at the native recognition engine boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("native engine fault: {0}")]
    EngineError(String),
    #[error("feature extraction failed (native code {0})")]
    ExtractionFailed(i32),
    #[error("embedding must have {expected} elements, got {actual}")]
    InvalidEmbeddingLength { expected: usize, actual: usize },
    #[error("gallery is empty")]
    EmptyGallery,
    #[error("foreign allocation of {0} bytes failed")]
    AllocationFailed(usize),
    #[error("native library: {0}")]
    Library(String),
}

/// Cycle-level failures of [`crate::orchestrator::RecognitionOrchestrator`].
///
/// A negative recognition outcome is not an error; see
/// [`crate::orchestrator::Rejection`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecognitionError {
    #[error("no input frame")]
    NoInput,
    #[error("recognition already in progress")]
    Busy,
    #[error("recognition cancelled")]
    Cancelled,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}
