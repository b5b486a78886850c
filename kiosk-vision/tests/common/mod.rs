#![allow(dead_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use kiosk_vision::{
    CaptureDevice, CaptureSettings, DeviceInfo, DeviceOpener, FaceQuality, Frame, RawFace,
    RecognitionEngine, EMBEDDING_DIM,
};

// ---------------------------------------------------------------------------
// Scripted camera
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct DeviceStats {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
    pub grabs: AtomicUsize,
}

impl DeviceStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn grabs(&self) -> usize {
        self.grabs.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct Script {
    pub width: u32,
    pub height: u32,
    pub opens: bool,
    /// Sleep inside every grab.
    pub grab_delay: Duration,
    /// Every n-th grab reports "nothing ready".
    pub miss_every: Option<usize>,
    /// Grab fails with a driver error after this many successful grabs.
    pub fail_after: Option<usize>,
    /// Refuse to open while another handle is alive, like a device node.
    pub exclusive: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            width: 4,
            height: 2,
            opens: true,
            grab_delay: Duration::from_millis(1),
            miss_every: None,
            fail_after: None,
            exclusive: false,
        }
    }
}

pub struct ScriptedDevice {
    script: Script,
    stats: Arc<DeviceStats>,
    grabbed: usize,
    pending: bool,
}

impl Drop for ScriptedDevice {
    fn drop(&mut self) {
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl CaptureDevice for ScriptedDevice {
    fn is_opened(&self) -> bool {
        self.script.opens
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            width: self.script.width,
            height: self.script.height,
            fps: 30,
        }
    }

    fn grab(&mut self) -> anyhow::Result<bool> {
        thread::sleep(self.script.grab_delay);
        self.stats.grabs.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.script.fail_after {
            if self.grabbed >= limit {
                anyhow::bail!("scripted driver failure");
            }
        }
        self.grabbed += 1;
        if let Some(n) = self.script.miss_every {
            if self.grabbed % n == 0 {
                return Ok(false);
            }
        }
        self.pending = true;
        Ok(true)
    }

    fn retrieve(&mut self, buf: &mut Vec<u8>) -> anyhow::Result<Option<(u32, u32)>> {
        if !std::mem::take(&mut self.pending) {
            return Ok(None);
        }
        buf.clear();
        buf.extend_from_slice(&gradient(self.script.width, self.script.height));
        Ok(Some((self.script.width, self.script.height)))
    }
}

/// Row-major frame whose pixel at column `x` is `[x, x, x]`.
pub fn gradient(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for _ in 0..height {
        for x in 0..width {
            out.extend_from_slice(&[x as u8, x as u8, x as u8]);
        }
    }
    out
}

pub fn scripted_opener(script: Script, stats: Arc<DeviceStats>) -> DeviceOpener {
    Arc::new(move |_settings: &CaptureSettings| {
        if script.exclusive && stats.opened() > stats.released() {
            anyhow::bail!("device busy");
        }
        stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedDevice {
            script: script.clone(),
            stats: stats.clone(),
            grabbed: 0,
            pending: false,
        }) as Box<dyn CaptureDevice>)
    })
}

pub fn fast_settings() -> CaptureSettings {
    CaptureSettings {
        device: "scripted".to_string(),
        width: 4,
        height: 2,
        fps: 30,
        min_emit_interval: Duration::from_millis(20),
        mirror: false,
        grab_timeout: Duration::from_millis(10),
        stop_timeout: Duration::from_secs(2),
        best_shot_ttl: Duration::from_secs(8),
    }
}

// ---------------------------------------------------------------------------
// Fake native engine
// ---------------------------------------------------------------------------

pub enum ExtractResult {
    Vector(Vec<f32>),
    Code(c_int),
}

/// Euclidean-distance engine with scripted detector/extractor outputs and
/// foreign allocation counting.
pub struct FakeEngine {
    pub face: Mutex<Option<RawFace>>,
    pub quality: Mutex<FaceQuality>,
    pub extract: Mutex<ExtractResult>,
    pub detect_calls: AtomicUsize,
    pub panic_on_detect: bool,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    /// When set, detect announces itself and waits for a release signal.
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl FakeEngine {
    pub fn new(probe: Vec<f32>) -> Self {
        Self {
            face: Mutex::new(Some(RawFace {
                x: 10.0,
                y: 10.0,
                width: 40.0,
                height: 40.0,
                confidence: 0.9,
            })),
            quality: Mutex::new(FaceQuality {
                score: 0.9,
                masked: false,
            }),
            extract: Mutex::new(ExtractResult::Vector(probe)),
            detect_calls: AtomicUsize::new(0),
            panic_on_detect: false,
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic_on_detect: true,
            ..Self::new(axis(0, 1.0))
        }
    }

    /// Make detect block; returns (entered, release).
    pub fn gate(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        *self.gate.lock().unwrap() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    pub fn ungate(&self) {
        *self.gate.lock().unwrap() = None;
    }

    pub fn counts(&self) -> (usize, usize) {
        (
            self.allocs.load(Ordering::SeqCst),
            self.frees.load(Ordering::SeqCst),
        )
    }
}

fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

impl RecognitionEngine for FakeEngine {
    fn version(&self) -> String {
        "fake-engine 1.0".to_string()
    }

    fn detect(&self, rgb: &[u8], width: c_int, height: c_int) -> Result<Vec<RawFace>, c_int> {
        assert_eq!(rgb.len(), (width * height * 3) as usize);
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_detect {
            panic!("detector crashed");
        }
        let gate = self.gate.lock().unwrap().clone();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        Ok(self.face.lock().unwrap().iter().copied().collect())
    }

    fn estimate_quality(
        &self,
        _rgb: &[u8],
        _width: c_int,
        _height: c_int,
        _face: &RawFace,
    ) -> Result<FaceQuality, c_int> {
        Ok(*self.quality.lock().unwrap())
    }

    fn extract(
        &self,
        _rgb: &[u8],
        _width: c_int,
        _height: c_int,
        _face: &RawFace,
        out: &mut [f32; EMBEDDING_DIM],
    ) -> Result<(), c_int> {
        match &*self.extract.lock().unwrap() {
            ExtractResult::Vector(v) => {
                out.copy_from_slice(v);
                Ok(())
            }
            ExtractResult::Code(code) => Err(*code),
        }
    }

    fn compare_one(&self, a: &[f32; EMBEDDING_DIM], b: &[f32; EMBEDDING_DIM]) -> f32 {
        l2(a, b)
    }

    unsafe fn compare_many(
        &self,
        target: *const f32,
        gallery: *const *const f32,
        count: c_int,
        min_distance: &mut f32,
    ) -> c_int {
        let target = std::slice::from_raw_parts(target, EMBEDDING_DIM);
        let mut best = -1;
        for i in 0..count as usize {
            let row = std::slice::from_raw_parts(*gallery.add(i), EMBEDDING_DIM);
            let d = l2(target, row);
            if best < 0 || d < *min_distance {
                best = i as c_int;
                *min_distance = d;
            }
        }
        best
    }

    fn alloc(&self, bytes: usize) -> *mut c_void {
        self.allocs.fetch_add(1, Ordering::SeqCst);
        unsafe { alloc(Layout::from_size_align(bytes, 16).unwrap()) as *mut c_void }
    }

    unsafe fn free(&self, ptr: *mut c_void, bytes: usize) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        dealloc(ptr as *mut u8, Layout::from_size_align(bytes, 16).unwrap());
    }
}

/// Vector with `value` at `index` and zeros elsewhere.
pub fn axis(index: usize, value: f32) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[index] = value;
    v
}

/// `base` nudged by `delta` along a second axis: L2 distance == |delta|.
pub fn nudged(base: &[f32], index: usize, delta: f32) -> Vec<f32> {
    let mut v = base.to_vec();
    v[index] += delta;
    v
}

pub fn test_frame() -> Frame {
    Frame::copy_from_packed(64, 64, &vec![128u8; 64 * 64 * 3], 0).unwrap()
}

pub struct Member {
    pub name: &'static str,
    pub embedding: Option<Vec<f32>>,
}

impl kiosk_vision::GalleryMember for Member {
    type Identity = &'static str;

    fn identity(&self) -> &Self::Identity {
        &self.name
    }

    fn embedding(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
}

pub fn member(name: &'static str, embedding: Vec<f32>) -> Member {
    Member {
        name,
        embedding: Some(embedding),
    }
}
