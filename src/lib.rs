pub mod config;
pub mod gallery;

// Re-export vision types for convenience
pub use kiosk_vision::{
    CancelToken, Frame, FrameSource, MatchVerdict, NativeMatchBridge, RecognitionOrchestrator,
};
