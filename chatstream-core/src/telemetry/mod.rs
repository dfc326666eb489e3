//! Telemetry for stream lifecycles.
//! By default, no telemetry is emitted unless a sink is installed via `set_telemetry_sink`.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive stream telemetry.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record` may be called from any thread, including from inside a tokio task.
/// - Keep overhead minimal; this runs on every state transition.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, trace: StreamTrace);

    /// Called once per stream that reaches COMPLETED or ERROR.
    fn record_completion(&self, _log: CompletionLog) {}
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to only the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

#[cfg(test)]
fn capture_enabled() -> bool {
    TEST_CAPTURE.with(|c| c.get())
}

#[cfg(not(test))]
#[inline]
fn capture_enabled() -> bool {
    true
}

/// Emit a transition record if a sink is installed.
///
/// In tests, emission is suppressed unless explicitly enabled via `test_set_capture_enabled`.
#[inline]
pub(crate) fn emit(trace: StreamTrace) {
    if !capture_enabled() {
        return;
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record(trace);
    }
}

#[inline]
pub(crate) fn emit_completion(log: CompletionLog) {
    if !capture_enabled() {
        return;
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_completion(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable capture for the current test thread.
///
/// Spawned threads in a test must call this as well if they should emit.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}
