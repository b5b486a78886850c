//! Exclusive camera ownership and the frame stream.
//!
//! Every driver call (open, grab, retrieve, release) happens under the
//! session's device lock, so the capture loop and [`FrameSource::capture_once`]
//! never interleave on the hardware.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::cancel::CancelToken;
use crate::error::CaptureError;
use crate::frame::{mirror_in_place, Frame};

/// Capture parameters supplied by the host configuration.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames retrieved sooner than this after the last emission are dropped.
    pub min_emit_interval: Duration,
    pub mirror: bool,
    /// Upper bound a single grab may wait for the driver.
    pub grab_timeout: Duration,
    /// How long `stop` waits for the capture worker before detaching it.
    pub stop_timeout: Duration,
    pub best_shot_ttl: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 1440,
            height: 1920,
            fps: 30,
            min_emit_interval: Duration::from_millis(200),
            mirror: true,
            grab_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            best_shot_ttl: Duration::from_secs(8),
        }
    }
}

/// What the driver actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// A physical (or scripted) camera.
pub trait CaptureDevice: Send {
    /// Whether the driver reports the device as usable after opening.
    fn is_opened(&self) -> bool {
        true
    }

    fn info(&self) -> DeviceInfo;

    /// Pull the next frame into the driver-side slot without decoding it.
    /// `Ok(false)` when no frame was ready in time.
    fn grab(&mut self) -> anyhow::Result<bool>;

    /// Decode the grabbed frame into `buf` as packed RGB24, returning its
    /// dimensions, or `None` if there was nothing to decode.
    fn retrieve(&mut self, buf: &mut Vec<u8>) -> anyhow::Result<Option<(u32, u32)>>;
}

pub type DeviceOpener =
    Arc<dyn Fn(&CaptureSettings) -> anyhow::Result<Box<dyn CaptureDevice>> + Send + Sync>;

struct BestShot {
    frame: Frame,
    score: f32,
    at: Instant,
}

/// An opened device tagged with the `start` call that opened it.
struct OpenDevice {
    generation: u64,
    device: Box<dyn CaptureDevice>,
}

/// State of one camera session, shared with the capture worker.
struct CaptureSession {
    device: Mutex<Option<OpenDevice>>,
    generation: AtomicU64,
    running: AtomicBool,
    last_emit: Mutex<Option<Instant>>,
    best_shot: Mutex<Option<BestShot>>,
    subscribers: Mutex<Vec<Sender<Frame>>>,
    sequence: AtomicU64,
    /// Single captures waiting for the device lock; the loop backs off
    /// while this is non-zero so they are not starved.
    single_waiters: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CaptureSession {
    fn new() -> Self {
        Self {
            device: Mutex::new(None),
            generation: AtomicU64::new(0),
            running: AtomicBool::new(false),
            last_emit: Mutex::new(None),
            best_shot: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            single_waiters: AtomicUsize::new(0),
        }
    }

    fn release_device(&self) {
        if lock(&self.device).take().is_some() {
            log::info!("camera released");
        }
    }

    /// Tear down after the loop of `generation` exits. The device is
    /// released only if it is still the one this loop opened; the running
    /// flag is left alone once a later `start` owns the session.
    fn finish(&self, generation: u64) {
        // Held across both steps so a concurrent `start` sees either the
        // old session fully torn down or not at all.
        let mut device = lock(&self.device);
        if device.as_ref().is_some_and(|d| d.generation == generation) {
            *device = None;
            log::info!("camera released");
        }
        if self.generation.load(Ordering::SeqCst) == generation {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Claim the emission slot if `interval` has passed since the last one.
    fn emit_due(&self, now: Instant, interval: Duration) -> bool {
        let mut last = lock(&self.last_emit);
        match *last {
            Some(prev) if now.duration_since(prev) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn broadcast(&self, frame: Frame) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            // Slow observer: drop this frame for it only.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

/// Releases the device and signals completion however the loop exits,
/// including by panic.
struct LoopCleanup<'a> {
    session: &'a CaptureSession,
    generation: u64,
    _done: Sender<()>,
}

impl Drop for LoopCleanup<'_> {
    fn drop(&mut self) {
        self.session.finish(self.generation);
        log::info!("capture loop exited");
    }
}

struct Worker {
    cancel: CancelToken,
    done: Receiver<()>,
    handle: thread::JoinHandle<()>,
}

/// Owner of the camera and producer of the frame stream.
pub struct FrameSource {
    settings: CaptureSettings,
    opener: DeviceOpener,
    session: Arc<CaptureSession>,
    worker: Mutex<Option<Worker>>,
}

impl FrameSource {
    pub fn new(settings: CaptureSettings, opener: DeviceOpener) -> Self {
        Self {
            settings,
            opener,
            session: Arc::new(CaptureSession::new()),
            worker: Mutex::new(None),
        }
    }

    /// Frame source backed by a V4L2 device node.
    pub fn v4l(settings: CaptureSettings) -> Self {
        let opener: DeviceOpener = Arc::new(|settings: &CaptureSettings| {
            let device = crate::video::V4lDevice::open(settings)?;
            Ok(Box::new(device) as Box<dyn CaptureDevice>)
        });
        Self::new(settings, opener)
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.session.running.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        lock(&self.session.device).is_some()
    }

    /// Register an observer. Each emitted frame is delivered as an owned
    /// copy; at most `capacity` undelivered frames are queued per observer.
    pub fn subscribe(&self, capacity: usize) -> Receiver<Frame> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        lock(&self.session.subscribers).push(tx);
        rx
    }

    /// Open the camera and start streaming. No-op while already running.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut worker = lock(&self.worker);
        if self.is_running() {
            return Ok(());
        }
        // A loop that stopped on its own leaves a finished worker behind.
        if let Some(stale) = worker.take() {
            if stale.handle.join().is_err() {
                log::warn!("previous capture worker panicked");
            }
        }

        log::info!("opening camera {}", self.settings.device);
        let generation = self.session.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut device = lock(&self.session.device);
            // A worker detached by a timed-out stop may still hold the
            // previous handle; the driver refuses a second open until it is
            // gone.
            if let Some(stale) = device.take() {
                log::warn!(
                    "releasing camera left by detached worker (session {})",
                    stale.generation
                );
            }
            let opened = (self.opener)(&self.settings)
                .map_err(|err| CaptureError::DeviceUnavailable(format!("{err:#}")))?;
            if !opened.is_opened() {
                drop(opened);
                return Err(CaptureError::DeviceUnavailable(format!(
                    "{} did not open",
                    self.settings.device
                )));
            }
            let info = opened.info();
            log::info!(
                "camera opened: w={} h={} fps={}",
                info.width,
                info.height,
                info.fps
            );
            *device = Some(OpenDevice {
                generation,
                device: opened,
            });
        }

        *lock(&self.session.last_emit) = None;
        self.session.running.store(true, Ordering::SeqCst);

        let cancel = CancelToken::new();
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let session = self.session.clone();
        let settings = self.settings.clone();
        let loop_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || {
                let _cleanup = LoopCleanup {
                    session: &session,
                    generation,
                    _done: done_tx,
                };
                if let Err(err) = capture_loop(&session, generation, &settings, &loop_cancel) {
                    log::error!("capture loop failed: {err:#}");
                }
            });

        match spawned {
            Ok(handle) => {
                *worker = Some(Worker {
                    cancel,
                    done,
                    handle,
                });
                Ok(())
            }
            Err(err) => {
                self.session.running.store(false, Ordering::SeqCst);
                self.session.release_device();
                Err(CaptureError::Worker(err))
            }
        }
    }

    /// Stop streaming and release the camera. No-op when not running.
    ///
    /// Waits at most `stop_timeout` for the worker. A worker stuck inside a
    /// driver call cannot be preempted: it is detached and releases the
    /// device itself once the call returns.
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        worker.cancel.cancel();
        self.session.running.store(false, Ordering::SeqCst);

        match worker.done.recv_timeout(self.settings.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "capture worker did not stop within {:?}, detaching it",
                    self.settings.stop_timeout
                );
                *lock(&self.session.last_emit) = None;
                *lock(&self.session.best_shot) = None;
                return;
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log::warn!("capture worker panicked");
                }
            }
        }

        self.session.release_device();
        *lock(&self.session.last_emit) = None;
        *lock(&self.session.best_shot) = None;
    }

    /// Grab a single frame under the device lock.
    ///
    /// `None` when the camera is closed, the grab misses, the driver fails
    /// or `cancel` fired before the device was reached.
    pub fn capture_once(&self, cancel: &CancelToken) -> Option<Frame> {
        if cancel.is_cancelled() {
            return None;
        }
        let mut buf = Vec::new();
        let (w, h) = {
            self.session.single_waiters.fetch_add(1, Ordering::SeqCst);
            let mut device = lock(&self.session.device);
            self.session.single_waiters.fetch_sub(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return None;
            }
            let open = device.as_mut()?;
            match grab_and_retrieve(&mut *open.device, &mut buf) {
                Ok(Some(dims)) => dims,
                Ok(None) => return None,
                Err(err) => {
                    log::warn!("single capture failed: {err:#}");
                    return None;
                }
            }
        };
        if self.settings.mirror {
            mirror_in_place(&mut buf, w, h);
        }
        Frame::copy_from_packed(w, h, &buf, self.session.next_sequence())
    }

    /// Keep `frame` as the best shot if it beats the current one or the
    /// current one has expired. Returns whether it was kept.
    pub fn offer_best_shot(&self, frame: &Frame, score: f32) -> bool {
        let now = Instant::now();
        let mut best = lock(&self.session.best_shot);
        let replace = match best.as_ref() {
            None => true,
            Some(current) => {
                now.duration_since(current.at) > self.settings.best_shot_ttl
                    || score > current.score
            }
        };
        if replace {
            *best = Some(BestShot {
                frame: frame.clone(),
                score,
                at: now,
            });
        }
        replace
    }

    /// The best shot, if one is held and younger than the TTL.
    pub fn best_shot(&self) -> Option<(Frame, f32)> {
        let best = lock(&self.session.best_shot);
        best.as_ref()
            .filter(|b| b.at.elapsed() <= self.settings.best_shot_ttl)
            .map(|b| (b.frame.clone(), b.score))
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn grab_and_retrieve(
    device: &mut dyn CaptureDevice,
    buf: &mut Vec<u8>,
) -> anyhow::Result<Option<(u32, u32)>> {
    if !device.grab()? {
        return Ok(None);
    }
    device.retrieve(buf)
}

fn capture_loop(
    session: &CaptureSession,
    generation: u64,
    settings: &CaptureSettings,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    // Private buffer, reused across iterations and never handed out.
    let mut buf = Vec::new();
    let mut grabbed: u64 = 0;

    while session.running.load(Ordering::SeqCst) && !cancel.is_cancelled() {
        if session.single_waiters.load(Ordering::SeqCst) > 0 {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        let dims = {
            let mut device = lock(&session.device);
            let Some(open) = device.as_mut().filter(|d| d.generation == generation) else {
                break;
            };
            grab_and_retrieve(&mut *open.device, &mut buf)?
        };
        let Some((w, h)) = dims else {
            thread::yield_now();
            continue;
        };

        grabbed += 1;
        if grabbed % 60 == 0 {
            log::debug!("capture loop: {grabbed} frames grabbed");
        }

        if !session.emit_due(Instant::now(), settings.min_emit_interval) {
            continue;
        }
        if settings.mirror {
            mirror_in_place(&mut buf, w, h);
        }
        match Frame::copy_from_packed(w, h, &buf, session.next_sequence()) {
            Some(frame) => session.broadcast(frame),
            None => log::debug!("dropping malformed {w}x{h} frame ({} bytes)", buf.len()),
        }
    }
    Ok(())
}
