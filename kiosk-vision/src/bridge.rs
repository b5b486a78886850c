use std::ffi::c_int;
use std::mem::size_of;
use std::ptr;
use std::sync::Arc;

use crate::embedding::{as_feature, Embedding, EMBEDDING_DIM};
use crate::engine::{FaceQuality, RawFace, RecognitionEngine};
use crate::error::BridgeError;
use crate::frame::{FaceBox, Frame};

/// A detected face with the detector's confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub face: FaceBox,
    pub confidence: f32,
}

/// Typed front of the native engine.
///
/// This is the only place that creates foreign buffers; all of them are
/// released before the creating call returns.
#[derive(Clone)]
pub struct NativeMatchBridge {
    engine: Arc<dyn RecognitionEngine>,
}

impl NativeMatchBridge {
    pub fn new(engine: Arc<dyn RecognitionEngine>) -> Self {
        Self { engine }
    }

    pub fn engine_version(&self) -> String {
        self.engine.version()
    }

    /// Primary (largest) face in the frame, or `None` when there is none.
    pub fn detect_face(&self, frame: &Frame) -> Result<Option<Detection>, BridgeError> {
        let (w, h) = dims(frame)?;
        let faces = self
            .engine
            .detect(&frame.to_bgr(), w, h)
            .map_err(|code| BridgeError::EngineError(format!("detector fault {code}")))?;

        let detection = faces
            .iter()
            .map(|raw| Detection {
                face: FaceBox::clamped(
                    raw.x,
                    raw.y,
                    raw.width,
                    raw.height,
                    frame.width(),
                    frame.height(),
                ),
                confidence: raw.confidence,
            })
            .max_by_key(|d| d.face.area());
        Ok(detection)
    }

    pub fn estimate_quality(
        &self,
        frame: &Frame,
        detection: &Detection,
    ) -> Result<FaceQuality, BridgeError> {
        let (w, h) = dims(frame)?;
        self.engine
            .estimate_quality(&frame.to_bgr(), w, h, &raw_face(detection))
            .map_err(|code| BridgeError::EngineError(format!("quality estimator fault {code}")))
    }

    pub fn extract_embedding(
        &self,
        frame: &Frame,
        detection: &Detection,
    ) -> Result<Embedding, BridgeError> {
        let (w, h) = dims(frame)?;
        let mut out = [0.0f32; EMBEDDING_DIM];
        self.engine
            .extract(&frame.to_bgr(), w, h, &raw_face(detection), &mut out)
            .map_err(BridgeError::ExtractionFailed)?;
        Ok(Embedding::from_array(out))
    }

    /// Closest gallery entry to `target` as `(index, distance)`.
    ///
    /// Every entry must be exactly [`EMBEDDING_DIM`] long; this is checked
    /// before any foreign memory is touched.
    pub fn compare_one_to_many<E: AsRef<[f32]>>(
        &self,
        target: &[f32],
        gallery: &[E],
    ) -> Result<(usize, f32), BridgeError> {
        if gallery.is_empty() {
            return Err(BridgeError::EmptyGallery);
        }
        let target = as_feature(target)?;
        for entry in gallery {
            as_feature(entry.as_ref())?;
        }
        let count = c_int::try_from(gallery.len())
            .map_err(|_| BridgeError::EngineError(format!("gallery too large: {}", gallery.len())))?;

        let batch = BatchHandle::build(self.engine.as_ref(), gallery)?;
        let mut min_distance = f32::MAX;
        // SAFETY: `batch` owns `count` live rows of EMBEDDING_DIM floats and
        // outlives the call.
        let index = unsafe {
            self.engine
                .compare_many(target.as_ptr(), batch.table(), count, &mut min_distance)
        };
        drop(batch);

        if index < 0 || index as usize >= gallery.len() {
            return Err(BridgeError::EngineError(format!(
                "batch match returned index {index} for {count} entries"
            )));
        }
        if min_distance < 0.0 || min_distance.is_nan() {
            return Err(BridgeError::EngineError(format!(
                "batch match returned distance {min_distance}"
            )));
        }
        Ok((index as usize, min_distance))
    }

    /// Pairwise distance; no foreign allocation.
    pub fn compare_one_to_one(&self, a: &[f32], b: &[f32]) -> Result<f32, BridgeError> {
        let distance = self.engine.compare_one(as_feature(a)?, as_feature(b)?);
        if distance < 0.0 || distance.is_nan() {
            return Err(BridgeError::EngineError(format!(
                "pairwise match returned {distance}"
            )));
        }
        Ok(distance)
    }
}

fn dims(frame: &Frame) -> Result<(c_int, c_int), BridgeError> {
    let w = c_int::try_from(frame.width());
    let h = c_int::try_from(frame.height());
    match (w, h) {
        (Ok(w), Ok(h)) => Ok((w, h)),
        _ => Err(BridgeError::EngineError(format!(
            "frame too large: {}x{}",
            frame.width(),
            frame.height()
        ))),
    }
}

fn raw_face(detection: &Detection) -> RawFace {
    RawFace {
        x: detection.face.x as f32,
        y: detection.face.y as f32,
        width: detection.face.w as f32,
        height: detection.face.h as f32,
        confidence: detection.confidence,
    }
}

const ROW_BYTES: usize = EMBEDDING_DIM * size_of::<f32>();

/// N foreign rows plus the N-entry address table pointing at them.
///
/// Dropping the handle frees whatever was allocated, on every path:
/// early return, engine fault or unwinding out of the native call.
struct BatchHandle<'e> {
    engine: &'e dyn RecognitionEngine,
    table: *mut *const f32,
    table_bytes: usize,
    rows: Vec<*mut f32>,
}

impl<'e> BatchHandle<'e> {
    fn build<E: AsRef<[f32]>>(
        engine: &'e dyn RecognitionEngine,
        gallery: &[E],
    ) -> Result<Self, BridgeError> {
        let table_bytes = gallery.len() * size_of::<*const f32>();
        let mut handle = Self {
            engine,
            table: ptr::null_mut(),
            table_bytes,
            rows: Vec::with_capacity(gallery.len()),
        };

        for entry in gallery {
            let row = engine.alloc(ROW_BYTES) as *mut f32;
            if row.is_null() {
                return Err(BridgeError::AllocationFailed(ROW_BYTES));
            }
            handle.rows.push(row);
            // SAFETY: entries were length-checked by the caller and `row`
            // holds ROW_BYTES.
            unsafe { ptr::copy_nonoverlapping(entry.as_ref().as_ptr(), row, EMBEDDING_DIM) };
        }

        let table = engine.alloc(table_bytes) as *mut *const f32;
        if table.is_null() {
            return Err(BridgeError::AllocationFailed(table_bytes));
        }
        handle.table = table;
        for (i, row) in handle.rows.iter().enumerate() {
            // SAFETY: the table has room for `rows.len()` pointers.
            unsafe { table.add(i).write(*row as *const f32) };
        }
        Ok(handle)
    }

    fn table(&self) -> *const *const f32 {
        self.table
    }
}

impl Drop for BatchHandle<'_> {
    fn drop(&mut self) {
        for row in self.rows.drain(..) {
            // SAFETY: each row came from `engine.alloc(ROW_BYTES)` once.
            unsafe { self.engine.free(row.cast(), ROW_BYTES) };
        }
        if !self.table.is_null() {
            // SAFETY: the table came from `engine.alloc(table_bytes)`.
            unsafe { self.engine.free(self.table.cast(), self.table_bytes) };
            self.table = ptr::null_mut();
        }
    }
}
