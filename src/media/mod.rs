//! Media Pipeline
//!
//! Frame decoding and display. Frames arrive as encoded images (JPEG/PNG/WebP),
//! are decoded to RGBA and blitted to a display surface. No frame is kept after
//! it has been drawn.

use image::RgbaImage;
use log::{debug, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

mod renderer;
mod sink;

pub use renderer::{FrameRenderer, RenderError};
pub use sink::FrameSink;

/// Global frame ID counter for unique frame identification
static FRAME_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique frame ID
pub fn next_frame_id() -> u64 {
    FRAME_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Display target for decoded frames
pub trait FrameSurface: Send + 'static {
    /// Match the surface to the frame's native dimensions
    fn resize(&mut self, width: u32, height: u32);

    /// Copy the frame's pixels onto the surface
    fn blit(&mut self, frame: &RgbaImage, frame_id: u64);
}

/// Frame counters shared between the renderer, the latest-wins slot and
/// whoever reports them
#[derive(Debug, Default)]
pub struct RenderCounters {
    drawn: AtomicU64,
    dropped: AtomicU64,
    decode_failures: AtomicU64,
}

impl RenderCounters {
    pub fn snapshot(&self) -> RenderStats {
        RenderStats {
            frames_drawn: self.drawn.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_drawn(&self) {
        self.drawn.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`RenderCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_drawn: u64,
    /// Frames superseded before they were decoded (latest-wins only)
    pub frames_dropped: u64,
    pub decode_failures: u64,
}

#[derive(Debug, Default)]
struct SurfaceState {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    frames_drawn: u64,
    snapshot_path: Option<PathBuf>,
    snapshot_interval: u64,
}

/// In-memory RGBA surface.
///
/// Clones share the same pixels, so one clone can be handed to the renderer
/// while another is kept for inspection. Optionally writes every Nth frame
/// to a PNG file on the blocking pool.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(path: PathBuf, interval: u64) -> Self {
        let surface = Self::default();
        {
            let mut state = surface.state.lock();
            state.snapshot_path = Some(path);
            state.snapshot_interval = interval.max(1);
        }
        surface
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.width, state.height)
    }

    pub fn frames_drawn(&self) -> u64 {
        self.state.lock().frames_drawn
    }

    /// RGBA value at (x, y), if inside the surface
    #[cfg(test)]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let state = self.state.lock();
        if x >= state.width || y >= state.height {
            return None;
        }
        let i = ((y * state.width + x) * 4) as usize;
        state
            .pixels
            .get(i..i + 4)
            .map(|p| [p[0], p[1], p[2], p[3]])
    }
}

impl FrameSurface for MemorySurface {
    fn resize(&mut self, width: u32, height: u32) {
        let mut state = self.state.lock();
        if state.width != width || state.height != height {
            debug!("Surface resized to {}x{}", width, height);
            state.width = width;
            state.height = height;
            state.pixels = vec![0; (width as usize) * (height as usize) * 4];
        }
    }

    fn blit(&mut self, frame: &RgbaImage, frame_id: u64) {
        let mut state = self.state.lock();
        let raw = frame.as_raw();
        if state.pixels.len() == raw.len() {
            state.pixels.copy_from_slice(raw);
        } else {
            state.pixels = raw.clone();
        }
        state.frames_drawn += 1;

        let Some(path) = state.snapshot_path.clone() else {
            return;
        };
        if state.frames_drawn % state.snapshot_interval != 0 {
            return;
        }
        drop(state);

        // Encoding a PNG is too slow for the dispatch thread
        let frame = frame.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = frame.save(&path) {
                warn!("Failed to write snapshot of frame {} to {:?}: {}", frame_id, path, e);
            } else {
                debug!("Wrote snapshot of frame {} to {:?}", frame_id, path);
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    /// Encode a solid-colour PNG of the given size
    pub fn png_frame(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba(color));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }
}
