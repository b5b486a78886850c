use anyhow::{Context, Result};
use std::io;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::frame::packed_len;
use crate::source::{CaptureDevice, CaptureSettings, DeviceInfo};

/// V4L2 camera with grab/retrieve split: `grab` dequeues and stashes the raw
/// driver buffer, `retrieve` converts it to packed RGB24.
pub struct V4lDevice {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    fps: u32,
    fourcc: FourCC,
    pending: Vec<u8>,
    has_pending: bool,
}

impl V4lDevice {
    pub fn open(settings: &CaptureSettings) -> Result<Self> {
        let dev = Device::with_path(&settings.device)
            .with_context(|| format!("open camera {}", settings.device))?;
        let mut fmt = dev.format().context("get format")?;
        // Prefer RGB at the requested size, fallback to YUYV, else accept existing format
        let desired = Format::new(settings.width, settings.height, FourCC::new(b"RGB3"));
        fmt = dev.set_format(&desired).unwrap_or(fmt);
        if fmt.fourcc != FourCC::new(b"RGB3") {
            let yuyv = Format::new(fmt.width, fmt.height, FourCC::new(b"YUYV"));
            fmt = dev.set_format(&yuyv).unwrap_or(fmt);
        }

        if settings.fps > 0 {
            if let Err(err) = dev.set_params(&Parameters::with_fps(settings.fps)) {
                log::warn!("failed to set fps on {}: {}", settings.device, err);
            }
        }
        let fps = dev
            .params()
            .ok()
            .filter(|p| p.interval.numerator > 0)
            .map(|p| p.interval.denominator / p.interval.numerator)
            .unwrap_or(0);

        let mut stream = Stream::with_buffers(&dev, Type::VideoCapture, 4).context("stream")?;
        stream.set_timeout(settings.grab_timeout);

        Ok(Self {
            stream,
            width: fmt.width,
            height: fmt.height,
            fps,
            fourcc: fmt.fourcc,
            pending: Vec::new(),
            has_pending: false,
        })
    }
}

impl CaptureDevice for V4lDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }

    fn grab(&mut self) -> Result<bool> {
        match self.stream.next() {
            Ok((data, meta)) => {
                log::trace!("grabbed seq={} len={}", meta.sequence, data.len());
                self.pending.clear();
                self.pending.extend_from_slice(data);
                self.has_pending = true;
                Ok(true)
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                Ok(false)
            }
            Err(err) => Err(err).context("grab frame"),
        }
    }

    fn retrieve(&mut self, buf: &mut Vec<u8>) -> Result<Option<(u32, u32)>> {
        if !self.has_pending {
            return Ok(None);
        }
        self.has_pending = false;

        buf.clear();
        match self.fourcc {
            f if f == FourCC::new(b"RGB3") => buf.extend_from_slice(&self.pending),
            f if f == FourCC::new(b"YUYV") => {
                yuyv_to_rgb(self.width, self.height, &self.pending, buf)?
            }
            f if f == FourCC::new(b"GREY") => {
                grey_to_rgb(self.width, self.height, &self.pending, buf)?
            }
            other => {
                log::warn!(
                    "unexpected pixel format {:?}, passing through raw len={}",
                    other,
                    self.pending.len()
                );
                buf.extend_from_slice(&self.pending);
            }
        }

        let expected = packed_len(self.width, self.height).unwrap_or(usize::MAX);
        if buf.len() < expected {
            log::debug!(
                "buffer too small: got {}, expected {} (fourcc {:?})",
                buf.len(),
                expected,
                self.fourcc
            );
            return Ok(None);
        }
        buf.truncate(expected);
        Ok(Some((self.width, self.height)))
    }
}

fn yuyv_to_rgb(width: u32, height: u32, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected {
        return Err(anyhow::anyhow!("short YUYV buffer"));
    }
    out.reserve((width * height * 3) as usize);
    for chunk in data[..expected].chunks_exact(4) {
        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;
        for &y in &[y0, y1] {
            let r = y + 1.402 * v;
            let g = y - 0.344136 * u - 0.714136 * v;
            let b = y + 1.772 * u;
            out.push(clamp(r));
            out.push(clamp(g));
            out.push(clamp(b));
        }
    }
    Ok(())
}

fn clamp(v: f32) -> u8 {
    v.max(0.0).min(255.0) as u8
}

fn grey_to_rgb(width: u32, height: u32, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let expected = (width * height) as usize;
    if data.len() < expected {
        return Err(anyhow::anyhow!("short GREY buffer"));
    }
    out.reserve(expected * 3);
    for &y in &data[..expected] {
        out.extend_from_slice(&[y, y, y]);
    }
    Ok(())
}
