pub mod bridge;
pub mod cancel;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod frame;
pub mod native;
pub mod orchestrator;
pub mod source;
pub mod video;

// Re-export commonly used types
pub use bridge::{Detection, NativeMatchBridge};
pub use cancel::CancelToken;
pub use embedding::{Embedding, EMBEDDING_DIM};
pub use engine::{FaceQuality, RawFace, RecognitionEngine};
pub use error::{BridgeError, CaptureError, RecognitionError};
pub use frame::{FaceBox, Frame};
pub use native::NativeLibrary;
pub use orchestrator::{
    CycleState, GalleryMember, MatchThresholds, MatchVerdict, RecognitionOrchestrator, Rejection,
};
pub use source::{CaptureDevice, CaptureSettings, DeviceInfo, DeviceOpener, FrameSource};
pub use video::V4lDevice;
