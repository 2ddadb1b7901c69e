//! Frame delivery from the dispatch loop to the renderer.
//!
//! `Sequential` renders inline, so frame N+1 is never decoded before frame N is
//! drawn. `LatestWins` hands frames to a render task through a single slot: a
//! frame that arrives while another is waiting replaces it.

use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{FrameRenderer, RenderCounters, RenderError, RenderStats};
use crate::app::config::FramePolicy;

/// Single-slot holder for the newest undecoded frame.
/// Writer replaces, reader takes; nothing is ever queued behind the slot.
pub struct FrameSlot {
    frame: Mutex<Option<Bytes>>,
    notify: Notify,
    closed: AtomicBool,
    counters: Arc<RenderCounters>,
}

impl FrameSlot {
    pub fn new(counters: Arc<RenderCounters>) -> Self {
        Self {
            frame: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            counters,
        }
    }

    /// Store a frame, superseding any frame not yet taken
    pub fn write(&self, data: Bytes) {
        if self.frame.lock().replace(data).is_some() {
            self.counters.record_dropped();
        }
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<Bytes> {
        self.frame.lock().take()
    }

    /// Wait for the next frame; `None` once the slot is closed
    pub async fn next(&self) -> Option<Bytes> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = self.take() {
                return Some(frame);
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.frame.lock().take();
        self.notify.notify_one();
    }
}

/// Where the session sends decoded-to-be frames
pub enum FrameSink {
    Inline {
        renderer: FrameRenderer,
    },
    LatestWins {
        slot: Arc<FrameSlot>,
        disposed: Arc<AtomicBool>,
        counters: Arc<RenderCounters>,
        task: JoinHandle<()>,
    },
}

impl FrameSink {
    /// Must be called from within a Tokio runtime for `LatestWins`.
    pub fn new(renderer: FrameRenderer, policy: FramePolicy) -> Self {
        match policy {
            FramePolicy::Sequential => FrameSink::Inline { renderer },
            FramePolicy::LatestWins => {
                let counters = renderer.counters();
                let disposed = renderer.disposed_flag();
                let slot = Arc::new(FrameSlot::new(Arc::clone(&counters)));
                let task = tokio::spawn(render_loop(renderer, Arc::clone(&slot)));
                FrameSink::LatestWins {
                    slot,
                    disposed,
                    counters,
                    task,
                }
            }
        }
    }

    pub async fn submit(&mut self, data: Bytes) {
        match self {
            FrameSink::Inline { renderer } => {
                if let Err(e) = renderer.render(data).await {
                    log_render_error(&e);
                }
            }
            FrameSink::LatestWins { slot, .. } => slot.write(data),
        }
    }

    pub fn stats(&self) -> RenderStats {
        match self {
            FrameSink::Inline { renderer } => renderer.counters().snapshot(),
            FrameSink::LatestWins { counters, .. } => counters.snapshot(),
        }
    }

    /// Stop drawing. An in-flight decode finishing later is discarded.
    pub fn dispose(&mut self) {
        match self {
            FrameSink::Inline { renderer } => renderer.dispose(),
            FrameSink::LatestWins {
                slot,
                disposed,
                task,
                ..
            } => {
                disposed.store(true, Ordering::Release);
                slot.close();
                task.abort();
            }
        }
        debug!("Frame sink disposed");
    }
}

impl Drop for FrameSink {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn render_loop(mut renderer: FrameRenderer, slot: Arc<FrameSlot>) {
    while let Some(data) = slot.next().await {
        match renderer.render(data).await {
            Ok(_) => {}
            Err(RenderError::Disposed) => break,
            Err(e) => log_render_error(&e),
        }
    }
    debug!("Render loop finished");
}

fn log_render_error(e: &RenderError) {
    match e {
        RenderError::Disposed => debug!("Frame discarded: {}", e),
        _ => warn!("Frame dropped: {}", e),
    }
}
