use image::{ImageBuffer, Rgb, RgbImage};
use std::time::Instant;

/// Bytes per pixel of every packed buffer: RGB24 on the capture side,
/// BGR24 across the native boundary. Row-major, no alpha.
pub const CHANNELS: usize = 3;

/// An owned camera frame.
///
/// Whoever receives a `Frame` owns it; dropping it releases the pixels.
/// Frames handed out by the capture loop are copies of the loop's private
/// buffer, so they never alias device memory.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Copy exactly `width * height * 3` bytes out of `packed`.
    ///
    /// Returns `None` for empty dimensions or a short buffer; trailing bytes
    /// beyond the expected length are ignored.
    pub fn copy_from_packed(width: u32, height: u32, packed: &[u8], sequence: u64) -> Option<Self> {
        let expected = packed_len(width, height)?;
        if expected == 0 || packed.len() < expected {
            return None;
        }
        if packed.len() > expected {
            log::warn!(
                "buffer larger than expected ({} > {}), truncating",
                packed.len(),
                expected
            );
        }
        let image: RgbImage = ImageBuffer::from_raw(width, height, packed[..expected].to_vec())?;
        Some(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn image(&self) -> &ImageBuffer<Rgb<u8>, Vec<u8>> {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Packed BGR24 copy, the channel order the native engine expects.
    pub fn to_bgr(&self) -> Vec<u8> {
        let mut out = self.image.as_raw().clone();
        for px in out.chunks_exact_mut(CHANNELS) {
            px.swap(0, 2);
        }
        out
    }
}

/// `width * height * 3`, or `None` on overflow.
pub fn packed_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(CHANNELS)
}

/// Flip a packed RGB24 buffer left-to-right in place.
pub fn mirror_in_place(packed: &mut [u8], width: u32, height: u32) {
    let Some(expected) = packed_len(width, height) else {
        return;
    };
    if width < 2 || packed.len() < expected {
        return;
    }
    let row_len = width as usize * CHANNELS;
    for row in packed[..expected].chunks_exact_mut(row_len) {
        let (mut left, mut right) = (0, width as usize - 1);
        while left < right {
            for c in 0..CHANNELS {
                row.swap(left * CHANNELS + c, right * CHANNELS + c);
            }
            left += 1;
            right -= 1;
        }
    }
}

/// Axis-aligned face rectangle in frame pixels, always inside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl FaceBox {
    /// Clamp a detector rectangle to a `frame_w` x `frame_h` frame.
    ///
    /// Origin is floored at zero, extent is at least one pixel and never
    /// crosses the right or bottom edge.
    pub fn clamped(x: f32, y: f32, w: f32, h: f32, frame_w: u32, frame_h: u32) -> Self {
        let max_x = frame_w.saturating_sub(1);
        let max_y = frame_h.saturating_sub(1);
        let x = (finite_or_zero(x).max(0.0) as u32).min(max_x);
        let y = (finite_or_zero(y).max(0.0) as u32).min(max_y);
        let w = (finite_or_zero(w) as u32).min(frame_w.saturating_sub(x)).max(1);
        let h = (finite_or_zero(h) as u32).min(frame_h.saturating_sub(y)).max(1);
        Self { x, y, w, h }
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
