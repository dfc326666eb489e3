//! Rate-limited hand-off of cumulative stream content to the UI.
//!
//! Frames are cumulative, so only the newest one matters: a burst of pushes
//! inside one interval collapses into a single render of the last frame.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::model::ToolCall;

/// What the UI callback receives.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderFrame {
    pub content: String,
    pub reasoning_content: String,
    pub completion_tokens: u32,
    pub speed: f64,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
}

pub type Renderer = Arc<dyn Fn(&RenderFrame) + Send + Sync>;

#[derive(Default)]
struct Slots {
    /// Newest frame not yet handed to a flush, tagged with its push sequence.
    pending: Option<(u64, RenderFrame)>,
    /// Frame taken by the flush in progress.
    dispatch: Option<(u64, RenderFrame)>,
    next_seq: u64,
    flushing: bool,
    timer: Option<JoinHandle<()>>,
    complete: bool,
}

#[derive(Default)]
struct Display {
    shown_seq: Option<u64>,
    frame: Option<RenderFrame>,
    renders: usize,
}

/// Cheap clone handle; clones share slots, timer and renderer.
#[derive(Clone)]
pub struct RenderBuffer {
    slots: Arc<Mutex<Slots>>,
    // Serialises renderer calls so frames are shown in push order.
    display: Arc<Mutex<Display>>,
    renderer: Renderer,
    interval: Duration,
}

impl fmt::Debug for RenderBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // one lock at a time; render() nests display -> slots
        let (complete, in_flight) = {
            let slots = self.slots();
            (slots.complete, slots.dispatch.is_some())
        };
        let render_count = self.render_count();
        f.debug_struct("RenderBuffer")
            .field("interval", &self.interval)
            .field("complete", &complete)
            .field("in_flight", &in_flight)
            .field("render_count", &render_count)
            .finish()
    }
}

impl RenderBuffer {
    pub fn new<F>(interval: Duration, renderer: F) -> Self
    where
        F: Fn(&RenderFrame) + Send + Sync + 'static,
    {
        Self::with_renderer(interval, Arc::new(renderer))
    }

    pub fn with_renderer(interval: Duration, renderer: Renderer) -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots::default())),
            display: Arc::new(Mutex::new(Display::default())),
            renderer,
            interval,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn display(&self) -> MutexGuard<'_, Display> {
        self.display.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the pending frame. A flush is scheduled only when none is
    /// scheduled or running; a running flush picks the frame up when it ends.
    pub fn push(&self, frame: RenderFrame) {
        let mut slots = self.slots();
        if slots.complete {
            return;
        }
        let seq = slots.next_seq;
        slots.next_seq += 1;
        slots.pending = Some((seq, frame));
        if slots.timer.is_some() || slots.flushing {
            return;
        }
        if !self.schedule(&mut slots) {
            // No runtime to defer on: render inline.
            let taken = slots.pending.take();
            drop(slots);
            if let Some((seq, frame)) = taken {
                self.render(seq, &frame, false);
            }
        }
    }

    fn schedule(&self, slots: &mut Slots) -> bool {
        let Ok(handle) = Handle::try_current() else {
            return false;
        };
        let this = self.clone();
        let interval = self.interval;
        slots.timer = Some(handle.spawn(async move {
            tokio::time::sleep(interval).await;
            this.run_flush().await;
        }));
        true
    }

    async fn run_flush(&self) {
        let (seq, frame) = {
            let mut slots = self.slots();
            slots.timer = None;
            if slots.flushing || slots.complete {
                return;
            }
            let Some(taken) = slots.pending.take() else {
                return;
            };
            slots.flushing = true;
            slots.dispatch = Some(taken.clone());
            taken
        };

        // next paint opportunity
        tokio::task::yield_now().await;
        self.render(seq, &frame, false);

        let mut slots = self.slots();
        slots.flushing = false;
        slots.dispatch = None;
        if !slots.complete && slots.pending.is_some() && slots.timer.is_none() {
            self.schedule(&mut slots);
        }
    }

    /// Render `frame` unless something newer is already on screen. `last`
    /// renders are allowed after completion; ordinary ones are not.
    fn render(&self, seq: u64, frame: &RenderFrame, last: bool) -> bool {
        let mut display = self.display();
        if !last && self.slots().complete {
            return false;
        }
        if display.shown_seq.is_some_and(|shown| shown >= seq) {
            return false;
        }
        (self.renderer)(frame);
        display.shown_seq = Some(seq);
        display.frame = Some(frame.clone());
        display.renders += 1;
        true
    }

    /// Render whatever is pending right now, skipping the timer.
    pub fn flush_now(&self) -> bool {
        let taken = {
            let mut slots = self.slots();
            if let Some(timer) = slots.timer.take() {
                timer.abort();
            }
            slots.pending.take()
        };
        match taken {
            Some((seq, frame)) => self.render(seq, &frame, false),
            None => false,
        }
    }

    /// One-shot mode: bypass buffering, render `frame` immediately and mark the
    /// buffer complete. Repeated calls re-render the given frame.
    pub fn render_now(&self, frame: RenderFrame) {
        if let Some(seq) = self.seal(true) {
            self.render(seq, &frame, true);
        }
    }

    /// Render the final frame exactly once and stop accepting pushes. Returns
    /// `false` when the buffer was already complete.
    pub fn finish(&self, frame: RenderFrame) -> bool {
        match self.seal(false) {
            Some(seq) => self.render(seq, &frame, true),
            None => false,
        }
    }

    // Cancel the timer, drop pending frames and mark complete; returns the
    // sequence number reserved for the final frame. Without `reseal` an
    // already complete buffer yields `None`, so only one caller wins.
    fn seal(&self, reseal: bool) -> Option<u64> {
        let mut slots = self.slots();
        if slots.complete && !reseal {
            return None;
        }
        if let Some(timer) = slots.timer.take() {
            timer.abort();
        }
        slots.pending = None;
        slots.complete = true;
        let seq = slots.next_seq;
        slots.next_seq += 1;
        Some(seq)
    }

    /// Drop pending output and forget completion, keeping the renderer.
    pub fn clear(&self) {
        let mut slots = self.slots();
        if let Some(timer) = slots.timer.take() {
            timer.abort();
        }
        slots.pending = None;
        slots.complete = false;
    }

    pub fn is_complete(&self) -> bool {
        self.slots().complete
    }

    pub fn has_pending(&self) -> bool {
        self.slots().pending.is_some()
    }

    /// Last frame handed to the renderer.
    pub fn displayed(&self) -> Option<RenderFrame> {
        self.display().frame.clone()
    }

    pub fn render_count(&self) -> usize {
        self.display().renders
    }
}
