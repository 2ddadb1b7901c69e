//! Frame Renderer
//!
//! Decodes one encoded image at a time and draws it to the owned surface.
//! The encoded buffer is held by a [`FrameHandle`] that is released on every
//! exit path: after the blit, on decode failure, and if the render future is
//! dropped mid-decode.

use bytes::Bytes;
use image::RgbaImage;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{next_frame_id, FrameSurface, RenderCounters};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decode task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("renderer disposed")]
    Disposed,
}

/// Transient handle on one encoded frame.
///
/// Counts itself in the renderer's live-handle gauge while it exists.
pub struct FrameHandle {
    data: Bytes,
    live: Arc<AtomicUsize>,
}

impl FrameHandle {
    fn acquire(data: Bytes, live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::AcqRel);
        Self {
            data,
            live: Arc::clone(live),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl Drop for FrameHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct FrameRenderer {
    surface: Box<dyn FrameSurface>,
    disposed: Arc<AtomicBool>,
    live_handles: Arc<AtomicUsize>,
    counters: Arc<RenderCounters>,
}

impl FrameRenderer {
    pub fn new(surface: impl FrameSurface) -> Self {
        Self {
            surface: Box::new(surface),
            disposed: Arc::new(AtomicBool::new(false)),
            live_handles: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(RenderCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<RenderCounters> {
        Arc::clone(&self.counters)
    }

    /// Flag shared with whoever may tear the surface down while a decode is
    /// in flight
    pub fn disposed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.disposed)
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Encoded buffers currently held (0 when idle)
    #[cfg(test)]
    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::Acquire)
    }

    /// Decode `data` and draw it. Returns the drawn dimensions.
    pub async fn render(&mut self, data: Bytes) -> Result<(u32, u32), RenderError> {
        if self.is_disposed() {
            return Err(RenderError::Disposed);
        }

        let handle = FrameHandle::acquire(data, &self.live_handles);
        let encoded = handle.bytes().clone();

        let decoded = tokio::task::spawn_blocking(move || decode(&encoded)).await?;
        let image = match decoded {
            Ok(image) => image,
            Err(e) => {
                self.counters.record_decode_failure();
                return Err(e.into());
            }
        };

        // Teardown may have happened while decoding
        if self.is_disposed() {
            return Err(RenderError::Disposed);
        }

        let (width, height) = image.dimensions();
        let frame_id = next_frame_id();
        self.surface.resize(width, height);
        self.surface.blit(&image, frame_id);
        self.counters.record_drawn();
        drop(handle);

        debug!("Drew frame {} ({}x{})", frame_id, width, height);
        Ok((width, height))
    }
}

fn decode(encoded: &[u8]) -> Result<RgbaImage, image::ImageError> {
    Ok(image::load_from_memory(encoded)?.to_rgba8())
}
