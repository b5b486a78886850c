//! Runtime-loaded native face engine.
//!
//! The engine ships as a C-ABI shared library exporting:
//!
//! ```c
//! bool        InitializeSdk(const char* model_path, const char* sdk_path);
//! void        FinalizeSdk(void);
//! const char* GetSdkVersion(void);
//! int         DetectFaceBGR(const uint8_t* bgr, int w, int h, FaceRect* out, int capacity);
//! bool        EstimateFaceQuality(const uint8_t* bgr, int w, int h, const FaceRect* face,
//!                                 float* quality, int* masked);
//! bool        ExtractFeatureBGR(const uint8_t* bgr, int w, int h, int rotate_deg, int mirror,
//!                               float* out512, int* err);
//! float       MatchFeature(const float* a, const float* b);
//! int         MatchFeatureNto1(const float* target, const float** feats, int n, float* min_distance);
//! ```
//!
//! All pixel buffers are packed BGR24. `ExtractFeatureBGR` locates the face
//! itself; frames reach it already upright and mirrored by the capture side.

use std::ffi::{c_char, c_float, c_int, CStr, CString};
use std::path::Path;

use libloading::Library;

use crate::embedding::EMBEDDING_DIM;
use crate::engine::{FaceQuality, RawFace, RecognitionEngine};
use crate::error::BridgeError;

/// Upper bound on faces reported by a single detect call.
const MAX_FACES: usize = 16;

type InitializeFn = unsafe extern "C" fn(*const c_char, *const c_char) -> bool;
type FinalizeFn = unsafe extern "C" fn();
type VersionFn = unsafe extern "C" fn() -> *const c_char;
type DetectFn = unsafe extern "C" fn(*const u8, c_int, c_int, *mut RawFace, c_int) -> c_int;
type QualityFn = unsafe extern "C" fn(
    *const u8,
    c_int,
    c_int,
    *const RawFace,
    *mut c_float,
    *mut c_int,
) -> bool;
type ExtractFn =
    unsafe extern "C" fn(*const u8, c_int, c_int, c_int, c_int, *mut c_float, *mut c_int) -> bool;
type MatchOneFn = unsafe extern "C" fn(*const c_float, *const c_float) -> c_float;
type MatchManyFn =
    unsafe extern "C" fn(*const c_float, *const *const c_float, c_int, *mut c_float) -> c_int;

/// Loaded engine library with resolved entry points.
pub struct NativeLibrary {
    _lib: Library,
    finalize: FinalizeFn,
    version: VersionFn,
    detect: DetectFn,
    quality: QualityFn,
    extract: ExtractFn,
    match_one: MatchOneFn,
    match_many: MatchManyFn,
}

// SAFETY: the entry points hold no thread-local state and the engine
// serialises internally; the library handle itself is immutable.
unsafe impl Send for NativeLibrary {}
unsafe impl Sync for NativeLibrary {}

impl NativeLibrary {
    /// Load the engine and initialise it with its model and SDK directories.
    pub fn load(library: &Path, model_path: &Path, sdk_path: &Path) -> Result<Self, BridgeError> {
        let model = path_cstring(model_path)?;
        let sdk = path_cstring(sdk_path)?;

        unsafe {
            let lib = Library::new(library).map_err(|e| {
                BridgeError::Library(format!("loading {}: {e}", library.display()))
            })?;

            let initialize: InitializeFn = *lib
                .get::<InitializeFn>(b"InitializeSdk\0")
                .map_err(|e| symbol_error("InitializeSdk", e))?;
            let finalize: FinalizeFn = *lib
                .get::<FinalizeFn>(b"FinalizeSdk\0")
                .map_err(|e| symbol_error("FinalizeSdk", e))?;
            let version: VersionFn = *lib
                .get::<VersionFn>(b"GetSdkVersion\0")
                .map_err(|e| symbol_error("GetSdkVersion", e))?;
            let detect: DetectFn = *lib
                .get::<DetectFn>(b"DetectFaceBGR\0")
                .map_err(|e| symbol_error("DetectFaceBGR", e))?;
            let quality: QualityFn = *lib
                .get::<QualityFn>(b"EstimateFaceQuality\0")
                .map_err(|e| symbol_error("EstimateFaceQuality", e))?;
            let extract: ExtractFn = *lib
                .get::<ExtractFn>(b"ExtractFeatureBGR\0")
                .map_err(|e| symbol_error("ExtractFeatureBGR", e))?;
            let match_one: MatchOneFn = *lib
                .get::<MatchOneFn>(b"MatchFeature\0")
                .map_err(|e| symbol_error("MatchFeature", e))?;
            let match_many: MatchManyFn = *lib
                .get::<MatchManyFn>(b"MatchFeatureNto1\0")
                .map_err(|e| symbol_error("MatchFeatureNto1", e))?;

            if !initialize(model.as_ptr(), sdk.as_ptr()) {
                return Err(BridgeError::Library(format!(
                    "InitializeSdk failed (model {}, sdk {})",
                    model_path.display(),
                    sdk_path.display()
                )));
            }

            let engine = Self {
                _lib: lib,
                finalize,
                version,
                detect,
                quality,
                extract,
                match_one,
                match_many,
            };
            log::info!(
                "loaded native face engine {} from {}",
                engine.version(),
                library.display()
            );
            Ok(engine)
        }
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        // SAFETY: the library is still loaded; `_lib` drops after this.
        unsafe { (self.finalize)() }
    }
}

impl RecognitionEngine for NativeLibrary {
    fn version(&self) -> String {
        // SAFETY: the engine returns a static NUL-terminated string or null.
        let ptr = unsafe { (self.version)() };
        if ptr.is_null() {
            return "unknown".to_string();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    fn detect(&self, bgr: &[u8], width: c_int, height: c_int) -> Result<Vec<RawFace>, c_int> {
        let mut faces = [RawFace::default(); MAX_FACES];
        // SAFETY: `bgr` covers the image and `faces` holds MAX_FACES entries.
        let found = unsafe {
            (self.detect)(
                bgr.as_ptr(),
                width,
                height,
                faces.as_mut_ptr(),
                MAX_FACES as c_int,
            )
        };
        if found < 0 {
            return Err(found);
        }
        Ok(faces[..(found as usize).min(MAX_FACES)].to_vec())
    }

    fn estimate_quality(
        &self,
        bgr: &[u8],
        width: c_int,
        height: c_int,
        face: &RawFace,
    ) -> Result<FaceQuality, c_int> {
        let mut score: c_float = 0.0;
        let mut masked: c_int = 0;
        // SAFETY: all pointers are valid locals or borrowed slices.
        let ok = unsafe {
            (self.quality)(bgr.as_ptr(), width, height, face, &mut score, &mut masked)
        };
        if !ok {
            return Err(-1);
        }
        Ok(FaceQuality {
            score,
            masked: masked != 0,
        })
    }

    fn extract(
        &self,
        bgr: &[u8],
        width: c_int,
        height: c_int,
        _face: &RawFace,
        out: &mut [f32; EMBEDDING_DIM],
    ) -> Result<(), c_int> {
        let mut err: c_int = 0;
        // SAFETY: `bgr` covers the image and `out` holds exactly
        // EMBEDDING_DIM floats.
        let ok = unsafe {
            (self.extract)(
                bgr.as_ptr(),
                width,
                height,
                0,
                0,
                out.as_mut_ptr(),
                &mut err,
            )
        };
        if ok {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn compare_one(&self, a: &[f32; EMBEDDING_DIM], b: &[f32; EMBEDDING_DIM]) -> f32 {
        // SAFETY: both arrays hold EMBEDDING_DIM floats.
        unsafe { (self.match_one)(a.as_ptr(), b.as_ptr()) }
    }

    unsafe fn compare_many(
        &self,
        target: *const f32,
        gallery: *const *const f32,
        count: c_int,
        min_distance: &mut f32,
    ) -> c_int {
        (self.match_many)(target, gallery, count, min_distance)
    }
}

fn path_cstring(path: &Path) -> Result<CString, BridgeError> {
    let s = path
        .to_str()
        .ok_or_else(|| BridgeError::Library(format!("non UTF-8 path {}", path.display())))?;
    CString::new(s).map_err(|e| BridgeError::Library(format!("invalid path {s}: {e}")))
}

fn symbol_error(name: &str, err: libloading::Error) -> BridgeError {
    BridgeError::Library(format!("missing symbol {name}: {err}"))
}
