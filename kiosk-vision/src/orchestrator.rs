//! Per-frame recognition cycle:
//! detect → quality gate → extract → 1:N match → decide.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use once_cell::sync::OnceCell;

use crate::bridge::NativeMatchBridge;
use crate::cancel::CancelToken;
use crate::embedding::{cosine_similarity, EMBEDDING_DIM};
use crate::error::{BridgeError, RecognitionError};
use crate::frame::Frame;

/// Decision thresholds. Defaults are starting points and must be tuned
/// against the deployed engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    /// Best distance must be strictly below this.
    pub distance: f32,
    /// Best cosine similarity must be strictly above this.
    pub cosine: f32,
    /// Second-best minus best distance must be strictly above this.
    pub margin: f32,
    pub quality_unmasked: f32,
    pub quality_masked: f32,
    /// Detect/gate rounds run by [`RecognitionOrchestrator::prewarm`].
    pub prewarm_cycles: u32,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            distance: 0.263,
            cosine: 0.45,
            margin: 0.03,
            quality_unmasked: 0.5,
            quality_masked: 0.4,
            prewarm_cycles: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Detecting,
    QualityGate,
    Extracting,
    Matching,
    Decided,
}

/// Why a well-formed cycle did not authenticate anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoFaceDetected,
    LowQuality,
    EmptyGallery,
    NoMatch,
}

impl Rejection {
    /// Short prompt for the person in front of the kiosk.
    pub fn status_message(&self) -> &'static str {
        match self {
            Rejection::NoFaceDetected => "look at the camera",
            Rejection::LowQuality => "move closer / check lighting",
            Rejection::EmptyGallery => "no enrolled users are waiting",
            Rejection::NoMatch => "face not recognised, please try again",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rejection::NoFaceDetected => "no face detected",
            Rejection::LowQuality => "low quality",
            Rejection::EmptyGallery => "empty gallery",
            Rejection::NoMatch => "no match",
        };
        f.write_str(s)
    }
}

/// One enrolled user as seen by the matcher.
pub trait GalleryMember {
    type Identity: Clone;

    fn identity(&self) -> &Self::Identity;

    /// Decoded feature vector, if the member has one. Vectors of the wrong
    /// length are skipped by the matcher.
    fn embedding(&self) -> Option<&[f32]>;
}

/// Outcome of one recognition cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchVerdict<I> {
    pub accepted: bool,
    pub identity: Option<I>,
    pub primary_distance: Option<f32>,
    pub second_best_distance: Option<f32>,
    pub cosine_similarity: Option<f32>,
    pub quality: Option<f32>,
    pub rejection: Option<Rejection>,
    pub reason: Option<String>,
}

impl<I> MatchVerdict<I> {
    fn rejected(rejection: Rejection, reason: String) -> Self {
        Self {
            accepted: false,
            identity: None,
            primary_distance: None,
            second_best_distance: None,
            cosine_similarity: None,
            quality: None,
            rejection: Some(rejection),
            reason: Some(reason),
        }
    }
}

/// Clears the busy flag and resets the state when a cycle ends, whichever
/// step it ended in.
struct CycleGuard<'a> {
    orchestrator: &'a RecognitionOrchestrator,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.set_state(CycleState::Idle);
        self.orchestrator.busy.store(false, Ordering::Release);
    }
}

/// Runs recognition cycles one at a time against a caller-supplied gallery.
pub struct RecognitionOrchestrator {
    bridge: NativeMatchBridge,
    thresholds: MatchThresholds,
    busy: AtomicBool,
    state: Mutex<CycleState>,
    prewarmed: OnceCell<()>,
}

impl RecognitionOrchestrator {
    pub fn new(bridge: NativeMatchBridge, thresholds: MatchThresholds) -> Self {
        Self {
            bridge,
            thresholds,
            busy: AtomicBool::new(false),
            state: Mutex::new(CycleState::Idle),
            prewarmed: OnceCell::new(),
        }
    }

    pub fn bridge(&self) -> &NativeMatchBridge {
        &self.bridge
    }

    pub fn thresholds(&self) -> &MatchThresholds {
        &self.thresholds
    }

    pub fn state(&self) -> CycleState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: CycleState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn advance(&self, state: CycleState, cancel: &CancelToken) -> Result<(), RecognitionError> {
        if cancel.is_cancelled() {
            return Err(RecognitionError::Cancelled);
        }
        log::trace!("recognition: {:?}", state);
        self.set_state(state);
        Ok(())
    }

    pub fn is_prewarmed(&self) -> bool {
        self.prewarmed.get().is_some()
    }

    /// Force native model initialisation with a few detect/gate rounds on
    /// `frame`. Runs at most once; every failure is swallowed.
    pub fn prewarm(&self, frame: &Frame) {
        self.prewarmed.get_or_init(|| {
            let rounds = self.thresholds.prewarm_cycles;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                for _ in 0..rounds {
                    if let Ok(Some(detection)) = self.bridge.detect_face(frame) {
                        let _ = self.bridge.estimate_quality(frame, &detection);
                    }
                }
            }));
            match outcome {
                Ok(()) => log::info!("recognition engine pre-warmed ({rounds} rounds)"),
                Err(_) => log::warn!("pre-warm aborted by engine fault"),
            }
        });
    }

    /// Run one recognition cycle.
    ///
    /// Fails with [`RecognitionError::Busy`] immediately if another cycle is
    /// in progress. `gallery` is only read, and only for this call. A panic
    /// inside the engine is reported as [`BridgeError::EngineError`].
    pub fn recognize<G: GalleryMember>(
        &self,
        frame: Option<&Frame>,
        gallery: &[G],
        cancel: &CancelToken,
    ) -> Result<MatchVerdict<G::Identity>, RecognitionError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(RecognitionError::Busy);
        }
        let _guard = CycleGuard { orchestrator: self };

        let frame = frame.ok_or(RecognitionError::NoInput)?;
        catch_unwind(AssertUnwindSafe(|| self.run_cycle(frame, gallery, cancel))).unwrap_or_else(
            |payload| {
                let message = panic_message(payload.as_ref());
                log::error!("recognition aborted by engine fault: {message}");
                Err(BridgeError::EngineError(format!("engine panicked: {message}")).into())
            },
        )
    }

    fn run_cycle<G: GalleryMember>(
        &self,
        frame: &Frame,
        gallery: &[G],
        cancel: &CancelToken,
    ) -> Result<MatchVerdict<G::Identity>, RecognitionError> {
        self.advance(CycleState::Detecting, cancel)?;
        let Some(detection) = self.bridge.detect_face(frame)? else {
            return Ok(MatchVerdict::rejected(
                Rejection::NoFaceDetected,
                "no face detected".to_string(),
            ));
        };

        self.advance(CycleState::QualityGate, cancel)?;
        let quality = self.bridge.estimate_quality(frame, &detection)?;
        let need = if quality.masked {
            self.thresholds.quality_masked
        } else {
            self.thresholds.quality_unmasked
        };
        if !(quality.score >= need) {
            let mut verdict = MatchVerdict::rejected(
                Rejection::LowQuality,
                format!(
                    "low quality: {:.2} < {:.2}{}",
                    quality.score,
                    need,
                    if quality.masked { " (masked)" } else { "" }
                ),
            );
            verdict.quality = Some(quality.score);
            return Ok(verdict);
        }

        self.advance(CycleState::Extracting, cancel)?;
        let probe = self.bridge.extract_embedding(frame, &detection)?;

        self.advance(CycleState::Matching, cancel)?;
        let candidates: Vec<(&G, &[f32])> = gallery
            .iter()
            .filter_map(|member| {
                member
                    .embedding()
                    .filter(|e| e.len() == EMBEDDING_DIM)
                    .map(|e| (member, e))
            })
            .collect();
        if candidates.len() < gallery.len() {
            log::debug!(
                "skipping {} gallery entries without a valid embedding",
                gallery.len() - candidates.len()
            );
        }
        if candidates.is_empty() {
            let mut verdict = MatchVerdict::rejected(
                Rejection::EmptyGallery,
                "no enrolled embeddings to match against".to_string(),
            );
            verdict.quality = Some(quality.score);
            return Ok(verdict);
        }

        let rows: Vec<&[f32]> = candidates.iter().map(|(_, e)| *e).collect();
        let (best, first) = self.bridge.compare_one_to_many(probe.as_slice(), &rows)?;

        // Rescore everyone for the runner-up distance and the cosine of the winner.
        let mut second = f32::INFINITY;
        let mut best_cos = f32::NAN;
        for (i, row) in rows.iter().enumerate() {
            let distance = self.bridge.compare_one_to_one(probe.as_slice(), row)?;
            let cos = cosine_similarity(probe.as_slice(), row);
            log::debug!("scoreboard[{i}] dist={distance:.4} cos={cos:.3}");
            if i == best {
                best_cos = cos;
            } else if distance < second {
                second = distance;
            }
        }
        self.advance(CycleState::Decided, cancel)?;

        let t = &self.thresholds;
        let gap = second - first;
        let mut failed = Vec::new();
        if !(first < t.distance) {
            failed.push(format!("distance d1={first:.4} >= {:.4}", t.distance));
        }
        if !(best_cos > t.cosine) {
            failed.push(format!("cosine cos1={best_cos:.3} <= {:.3}", t.cosine));
        }
        if !(gap > t.margin) {
            failed.push(format!("ambiguous margin d2-d1={gap:.3} <= {:.3}", t.margin));
        }

        let accepted = failed.is_empty();
        log::info!(
            "recognition {} (d1={first:.4}, cos1={best_cos:.3}, d2-d1={gap:.3})",
            if accepted { "accepted" } else { "rejected" }
        );

        Ok(MatchVerdict {
            accepted,
            identity: accepted.then(|| candidates[best].0.identity().clone()),
            primary_distance: Some(first),
            second_best_distance: second.is_finite().then_some(second),
            cosine_similarity: Some(best_cos),
            quality: Some(quality.score),
            rejection: (!accepted).then_some(Rejection::NoMatch),
            reason: (!accepted).then(|| format!("no match: {}", failed.join("; "))),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
