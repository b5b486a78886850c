//! The opaque native recognition capability.
//!
//! Everything behind [`RecognitionEngine`] is foreign: detection, quality
//! estimation, feature extraction and distance computation. Only
//! [`crate::bridge::NativeMatchBridge`] calls into it.

use std::ffi::{c_int, c_void};

use crate::embedding::EMBEDDING_DIM;

/// Face rectangle as reported by the native detector, in frame pixels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Feature-extraction quality estimate for one face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceQuality {
    pub score: f32,
    pub masked: bool,
}

/// Native face engine primitives.
///
/// Pixel buffers are packed BGR24 (blue first) of exactly
/// `width * height * 3` bytes; see [`crate::frame::Frame::to_bgr`].
/// Native error codes are passed through unchanged.
pub trait RecognitionEngine: Send + Sync {
    /// Engine identity, for diagnostics only.
    fn version(&self) -> String;

    /// All faces found in the image. An empty vector means "no face",
    /// `Err(code)` means the detector itself failed.
    fn detect(&self, bgr: &[u8], width: c_int, height: c_int) -> Result<Vec<RawFace>, c_int>;

    fn estimate_quality(
        &self,
        bgr: &[u8],
        width: c_int,
        height: c_int,
        face: &RawFace,
    ) -> Result<FaceQuality, c_int>;

    fn extract(
        &self,
        bgr: &[u8],
        width: c_int,
        height: c_int,
        face: &RawFace,
        out: &mut [f32; EMBEDDING_DIM],
    ) -> Result<(), c_int>;

    /// Distance between two feature vectors. Negative on engine fault.
    fn compare_one(&self, a: &[f32; EMBEDDING_DIM], b: &[f32; EMBEDDING_DIM]) -> f32;

    /// Index of the closest of `count` vectors, writing its distance to
    /// `min_distance`. Negative on engine fault.
    ///
    /// # Safety
    ///
    /// `target` must point at [`EMBEDDING_DIM`] floats and `gallery` at
    /// `count` pointers, each to [`EMBEDDING_DIM`] floats, all valid for the
    /// duration of the call.
    unsafe fn compare_many(
        &self,
        target: *const f32,
        gallery: *const *const f32,
        count: c_int,
        min_distance: &mut f32,
    ) -> c_int;

    /// Allocate foreign memory visible to the engine. Null on failure.
    fn alloc(&self, bytes: usize) -> *mut c_void {
        // SAFETY: malloc has no preconditions; null is handled by the caller.
        unsafe { libc::malloc(bytes) }
    }

    /// Release memory obtained from [`RecognitionEngine::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc(bytes)` on this engine and not be freed
    /// twice.
    unsafe fn free(&self, ptr: *mut c_void, _bytes: usize) {
        libc::free(ptr)
    }
}
