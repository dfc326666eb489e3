//! Per-message stream records and their lifecycle.
//!
//! Contract:
//! - Status moves STREAMING <-> PAUSED, then to COMPLETED or ERROR; terminal
//!   records never change status again.
//! - Accumulated content and reasoning never shrink.
//! - Every mutation is written to the persistence adapter before the in-memory
//!   record changes; a failed write leaves the record as it was.
//! - The record table lock is never held while calling the message store or a
//!   renderer, and never across an `.await`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::accumulator::Progress;
use crate::config::StreamsCfg;
use crate::error::{ChatStreamError, CoreResult};
use crate::message_store::MessageStore;
use crate::model::{MessageUpdate, StreamStatus, ToolCall, now_ms};
use crate::persistence::{PersistenceAdapter, StreamSnapshot};
use crate::render::{RenderBuffer, RenderFrame};
use crate::telemetry::{self, CompletionLog, StreamTrace};

/// Handed to whoever drives the transport. The token is a child of the
/// record's abort capability: it fires when the stream is aborted, completed
/// or failed, but cancelling it does not release the capability.
#[derive(Debug, Clone)]
pub struct StreamTicket {
    pub stream_id: String,
    pub cancel: CancellationToken,
}

/// Cumulative values after an accumulation step. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamUpdate {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub completion_tokens: Option<u32>,
    pub speed: Option<f64>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl StreamUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }
}

impl From<Progress> for StreamUpdate {
    fn from(p: Progress) -> Self {
        Self {
            content: Some(p.content),
            reasoning_content: Some(p.reasoning_content),
            completion_tokens: Some(p.completion_tokens),
            speed: Some(p.speed),
            tool_calls: Some(p.tool_calls),
        }
    }
}

/// Message for a connection that was cut without anyone asking.
pub const INTERRUPTED: &str = "request interrupted";

/// How a connection ended, as seen by whoever was reading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// `[DONE]` or end of input: the server has sent everything.
    Finished,
    /// The connection token fired.
    Cancelled,
    /// Transport or decoding failure.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Sent to the message store and the attached renderer.
    Forwarded,
    /// Recorded and persisted while paused; shown on resume.
    Buffered,
    /// No live record for the id.
    Ignored,
}

/// What a caller needs to continue a paused generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeDescriptor {
    pub last_content: String,
    pub last_reasoning: String,
    pub last_tokens: u32,
    pub paused_at: Option<i64>,
    /// No connection is alive and the server has not finished: a new request
    /// carrying the prefix is required.
    pub needs_reconnect: bool,
}

/// Read-only view of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamState {
    pub message_id: String,
    pub status: StreamStatus,
    pub content: String,
    pub reasoning_content: String,
    pub completion_tokens: u32,
    pub speed: f64,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
    pub started_at: i64,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub is_paused_for_ui: bool,
    pub is_content_complete: bool,
    pub has_live_connection: bool,
}

impl StreamState {
    pub fn frame(&self) -> RenderFrame {
        RenderFrame {
            content: self.content.clone(),
            reasoning_content: self.reasoning_content.clone(),
            completion_tokens: self.completion_tokens,
            speed: self.speed,
            tool_calls: self.tool_calls.clone(),
            error: self.error.clone(),
        }
    }
}

/// The serialisable part of a record.
#[derive(Debug, Clone, PartialEq)]
struct RecordData {
    status: StreamStatus,
    started_at: i64,
    paused_at: Option<i64>,
    completed_at: Option<i64>,
    content: String,
    reasoning: String,
    completion_tokens: u32,
    speed: f64,
    tool_calls: Vec<ToolCall>,
    is_paused_for_ui: bool,
    is_content_complete: bool,
    error: Option<String>,
}

impl RecordData {
    fn new() -> Self {
        Self {
            status: StreamStatus::Streaming,
            started_at: now_ms(),
            paused_at: None,
            completed_at: None,
            content: String::new(),
            reasoning: String::new(),
            completion_tokens: 0,
            speed: 0.0,
            tool_calls: Vec::new(),
            is_paused_for_ui: false,
            is_content_complete: false,
            error: None,
        }
    }

    fn from_snapshot(s: StreamSnapshot) -> Self {
        Self {
            status: s.status,
            started_at: s.timestamp,
            paused_at: s.paused_at,
            completed_at: s.completed_at,
            content: s.content,
            reasoning: s.reasoning_content,
            completion_tokens: s.completion_tokens,
            speed: s.speed,
            tool_calls: s.tool_calls,
            is_paused_for_ui: s.is_paused_for_ui || s.status == StreamStatus::Paused,
            is_content_complete: s.is_content_complete,
            error: s.error,
        }
    }

    fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            content: self.content.clone(),
            reasoning_content: self.reasoning.clone(),
            completion_tokens: self.completion_tokens,
            speed: self.speed,
            status: self.status,
            error: self.error.clone(),
            timestamp: self.started_at,
            saved_at: now_ms(),
            paused_at: self.paused_at,
            completed_at: self.completed_at,
            is_content_complete: self.is_content_complete,
            is_paused_for_ui: self.is_paused_for_ui,
            tool_calls: self.tool_calls.clone(),
        }
    }

    fn merge(&mut self, update: StreamUpdate) {
        // cumulative values: a shorter string is stale, never a correction
        if let Some(content) = update.content
            && content.len() >= self.content.len()
        {
            self.content = content;
        }
        if let Some(reasoning) = update.reasoning_content
            && reasoning.len() >= self.reasoning.len()
        {
            self.reasoning = reasoning;
        }
        if let Some(tokens) = update.completion_tokens {
            self.completion_tokens = tokens;
        }
        if let Some(speed) = update.speed {
            self.speed = speed;
        }
        if let Some(calls) = update.tool_calls
            && calls.len() >= self.tool_calls.len()
        {
            self.tool_calls = calls;
        }
    }

    fn message_update(&self) -> MessageUpdate {
        MessageUpdate {
            content: Some(self.content.clone()),
            reasoning_content: Some(self.reasoning.clone()),
            completion_tokens: Some(self.completion_tokens),
            speed: Some(self.speed),
            tool_calls: (!self.tool_calls.is_empty()).then(|| self.tool_calls.clone()),
            error: self.error.clone(),
        }
    }

    fn frame(&self) -> RenderFrame {
        RenderFrame {
            content: self.content.clone(),
            reasoning_content: self.reasoning.clone(),
            completion_tokens: self.completion_tokens,
            speed: self.speed,
            tool_calls: self.tool_calls.clone(),
            error: self.error.clone(),
        }
    }
}

/// Owned cancellation capability of a live connection. Releasing consumes it,
/// so it can only happen once.
#[derive(Debug)]
struct AbortHandle(CancellationToken);

impl AbortHandle {
    fn release(self) {
        self.0.cancel();
    }
}

#[derive(Debug)]
struct StreamRecord {
    data: RecordData,
    abort: Option<AbortHandle>,
    abort_requested: bool,
    renderer: Option<RenderBuffer>,
    generation: u64,
}

impl StreamRecord {
    fn view(&self, message_id: &str) -> StreamState {
        view_of(message_id, &self.data, self.abort.is_some())
    }

    fn release_abort(&mut self) -> bool {
        match self.abort.take() {
            Some(handle) => {
                handle.release();
                true
            }
            None => false,
        }
    }
}

fn view_of(message_id: &str, d: &RecordData, live: bool) -> StreamState {
    StreamState {
        message_id: message_id.to_string(),
        status: d.status,
        content: d.content.clone(),
        reasoning_content: d.reasoning.clone(),
        completion_tokens: d.completion_tokens,
        speed: d.speed,
        tool_calls: d.tool_calls.clone(),
        error: d.error.clone(),
        started_at: d.started_at,
        paused_at: d.paused_at,
        completed_at: d.completed_at,
        is_paused_for_ui: d.is_paused_for_ui,
        is_content_complete: d.is_content_complete,
        has_live_connection: live,
    }
}

struct Shared {
    records: Mutex<HashMap<String, StreamRecord>>,
    message_store: Arc<dyn MessageStore>,
    persistence: PersistenceAdapter,
    cfg: StreamsCfg,
    generations: AtomicU64,
    // parent of every connection token; cancelling it interrupts all streams
    root: CancellationToken,
}

// Side effects collected under the lock and run after it is released.
struct Delivery {
    update: MessageUpdate,
    frame: RenderFrame,
    renderer: Option<RenderBuffer>,
}

// What a terminal transition still has to do once the lock is released.
struct Settled {
    delivery: Delivery,
    log: CompletionLog,
    generation: u64,
}

/// Owner of all stream records. Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct StreamManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("records", &self.records().len())
            .field("persistence", &self.shared.persistence)
            .finish()
    }
}

impl StreamManager {
    pub fn new(
        message_store: Arc<dyn MessageStore>,
        persistence: PersistenceAdapter,
        cfg: StreamsCfg,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(HashMap::new()),
                message_store,
                persistence,
                cfg,
                generations: AtomicU64::new(0),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn persistence(&self) -> &PersistenceAdapter {
        &self.shared.persistence
    }

    pub fn message_store(&self) -> &Arc<dyn MessageStore> {
        &self.shared.message_store
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, StreamRecord>> {
        self.shared.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn save(&self, message_id: &str, data: &RecordData) -> CoreResult<()> {
        self.shared
            .persistence
            .save(message_id, &data.snapshot())
            .inspect_err(|e| tracing::warn!(message_id, error = %e, "stream snapshot write failed"))
    }

    fn deliver(&self, message_id: &str, delivery: Delivery, last: bool) {
        if let Err(e) = self.shared.message_store.update_message(message_id, delivery.update) {
            tracing::warn!(message_id, error = %e, "message store rejected stream update");
        }
        if let Some(renderer) = delivery.renderer {
            if last {
                renderer.finish(delivery.frame);
            } else {
                renderer.push(delivery.frame);
            }
        }
    }

    fn new_connection(&self) -> (AbortHandle, CancellationToken) {
        let token = self.shared.root.child_token();
        let child = token.child_token();
        (AbortHandle(token), child)
    }

    /// Create a STREAMING record for `message_id`. A terminal record for the
    /// same id is replaced; a live one is rejected.
    pub fn start_stream(&self, message_id: &str) -> CoreResult<StreamTicket> {
        if message_id.is_empty() {
            return Err(ChatStreamError::Validation("message id is empty".into()));
        }
        let mut records = self.records();
        if let Some(existing) = records.get(message_id)
            && !existing.data.status.is_terminal()
        {
            return Err(ChatStreamError::AlreadyActive {
                message_id: message_id.to_string(),
            });
        }
        let data = RecordData::new();
        self.save(message_id, &data)?;
        let (abort, cancel) = self.new_connection();
        let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed) + 1;
        records.insert(
            message_id.to_string(),
            StreamRecord {
                data,
                abort: Some(abort),
                abort_requested: false,
                renderer: None,
                generation,
            },
        );
        drop(records);

        tracing::info!(message_id, "stream started");
        telemetry::emit(StreamTrace::new(message_id, "start", StreamStatus::Streaming));
        Ok(StreamTicket {
            stream_id: format!("stream_{message_id}"),
            cancel,
        })
    }

    /// Give a non-terminal record without a connection a fresh capability,
    /// e.g. before reissuing a request after resume.
    pub fn attach_connection(&self, message_id: &str) -> CoreResult<StreamTicket> {
        let mut records = self.records();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| ChatStreamError::NotFound {
                message_id: message_id.to_string(),
            })?;
        if record.data.status.is_terminal() {
            return Err(ChatStreamError::InvalidState {
                message_id: message_id.to_string(),
                op: "reconnect",
                status: record.data.status,
            });
        }
        if record.abort.is_some() {
            return Err(ChatStreamError::AlreadyActive {
                message_id: message_id.to_string(),
            });
        }
        let (abort, cancel) = self.new_connection();
        record.abort = Some(abort);
        record.abort_requested = false;
        drop(records);

        tracing::info!(message_id, "stream reconnected");
        telemetry::emit(StreamTrace::new(message_id, "reconnect", StreamStatus::Streaming));
        Ok(StreamTicket {
            stream_id: format!("stream_{message_id}"),
            cancel,
        })
    }

    pub fn update_stream(&self, message_id: &str, update: StreamUpdate) -> CoreResult<UpdateOutcome> {
        let mut records = self.records();
        let Some(record) = records.get_mut(message_id) else {
            return Ok(UpdateOutcome::Ignored);
        };
        if record.data.status.is_terminal() {
            return Ok(UpdateOutcome::Ignored);
        }
        let mut next = record.data.clone();
        next.merge(update);
        self.save(message_id, &next)?;
        record.data = next;

        if record.data.is_paused_for_ui {
            return Ok(UpdateOutcome::Buffered);
        }
        let delivery = Delivery {
            update: record.data.message_update(),
            frame: record.data.frame(),
            renderer: record.renderer.clone(),
        };
        drop(records);

        self.deliver(message_id, delivery, false);
        Ok(UpdateOutcome::Forwarded)
    }

    /// Soft pause: the connection stays open and later updates are buffered.
    /// Returns `false` if the record was already paused.
    pub fn pause_stream(&self, message_id: &str) -> CoreResult<bool> {
        let mut records = self.records();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| ChatStreamError::NotFound {
                message_id: message_id.to_string(),
            })?;
        match record.data.status {
            StreamStatus::Paused => return Ok(false),
            s if s.is_terminal() => {
                return Err(ChatStreamError::InvalidState {
                    message_id: message_id.to_string(),
                    op: "pause",
                    status: s,
                });
            }
            _ => {}
        }
        let mut next = record.data.clone();
        next.status = StreamStatus::Paused;
        next.paused_at = Some(now_ms());
        next.is_paused_for_ui = true;
        self.save(message_id, &next)?;
        record.data = next;
        let renderer = record.renderer.clone();
        let content_len = record.data.content.len();
        drop(records);

        // freeze the picture on the last value received
        if let Some(renderer) = renderer {
            renderer.flush_now();
        }
        tracing::info!(message_id, content_len, "stream paused");
        telemetry::emit(StreamTrace::new(message_id, "pause", StreamStatus::Paused).content_len(content_len));
        Ok(true)
    }

    pub fn resume_stream(&self, message_id: &str) -> CoreResult<ResumeDescriptor> {
        let mut records = self.records();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| ChatStreamError::NotFound {
                message_id: message_id.to_string(),
            })?;
        if record.data.status != StreamStatus::Paused {
            return Err(ChatStreamError::InvalidState {
                message_id: message_id.to_string(),
                op: "resume",
                status: record.data.status,
            });
        }
        let mut next = record.data.clone();
        next.status = StreamStatus::Streaming;
        next.is_paused_for_ui = false;
        next.paused_at = None;
        self.save(message_id, &next)?;
        let paused_at = record.data.paused_at;
        record.data = next;

        let descriptor = ResumeDescriptor {
            last_content: record.data.content.clone(),
            last_reasoning: record.data.reasoning.clone(),
            last_tokens: record.data.completion_tokens,
            paused_at,
            needs_reconnect: record.abort.is_none() && !record.data.is_content_complete,
        };
        let content_complete = record.data.is_content_complete;
        let delivery = Delivery {
            update: record.data.message_update(),
            frame: record.data.frame(),
            renderer: record.renderer.clone(),
        };
        drop(records);

        tracing::info!(message_id, needs_reconnect = descriptor.needs_reconnect, "stream resumed");
        telemetry::emit(
            StreamTrace::new(message_id, "resume", StreamStatus::Streaming)
                .content_len(descriptor.last_content.len()),
        );
        if content_complete {
            // the server finished while paused; completion delivers the final values
            self.complete_stream(message_id)?;
        } else {
            let renderer = delivery.renderer.clone();
            self.deliver(message_id, delivery, false);
            if let Some(renderer) = renderer {
                renderer.flush_now();
            }
        }
        Ok(descriptor)
    }

    /// Hard stop: release the connection capability if the record holds one.
    /// Returns `false` when there was nothing to release.
    pub fn abort_stream(&self, message_id: &str) -> CoreResult<bool> {
        let mut records = self.records();
        let Some(record) = records.get_mut(message_id) else {
            return Ok(false);
        };
        record.abort_requested = true;
        let released = record.release_abort();
        let status = record.data.status;
        drop(records);

        if released {
            tracing::info!(message_id, %status, "stream aborted");
            telemetry::emit(StreamTrace::new(message_id, "abort", status));
        }
        Ok(released)
    }

    /// Drop the capability of a connection that has ended on its own. Unlike
    /// [`abort_stream`](Self::abort_stream) this does not count as a caller request.
    pub fn release_connection(&self, message_id: &str) -> bool {
        self.records()
            .get_mut(message_id)
            .is_some_and(|r| r.release_abort())
    }

    /// Whether the last connection teardown was asked for by a caller.
    pub fn cancellation_requested(&self, message_id: &str) -> bool {
        self.records()
            .get(message_id)
            .is_some_and(|r| r.abort_requested)
    }

    pub fn complete_stream(&self, message_id: &str) -> CoreResult<bool> {
        let mut records = self.records();
        let Some(record) = records.get_mut(message_id) else {
            return Ok(false);
        };
        let settled = self.complete_record(message_id, record)?;
        drop(records);

        let Some(settled) = settled else {
            return Ok(false);
        };
        self.announce_completed(message_id, settled);
        Ok(true)
    }

    fn complete_record(&self, message_id: &str, record: &mut StreamRecord) -> CoreResult<Option<Settled>> {
        match record.data.status {
            StreamStatus::Completed => return Ok(None),
            StreamStatus::Error => {
                return Err(ChatStreamError::InvalidState {
                    message_id: message_id.to_string(),
                    op: "complete",
                    status: StreamStatus::Error,
                });
            }
            _ => {}
        }
        let mut next = record.data.clone();
        next.status = StreamStatus::Completed;
        next.is_content_complete = true;
        next.is_paused_for_ui = false;
        next.completed_at = Some(now_ms());
        self.save(message_id, &next)?;
        record.data = next;
        record.release_abort();
        Ok(Some(settled(message_id, record)))
    }

    fn announce_completed(&self, message_id: &str, settled: Settled) {
        let Settled {
            delivery,
            log,
            generation,
        } = settled;
        self.deliver(message_id, delivery, true);
        tracing::info!(message_id, tokens = log.tokens_completion, "stream completed");
        telemetry::emit(
            StreamTrace::new(message_id, "complete", StreamStatus::Completed)
                .tokens(log.tokens_completion.unwrap_or(0), log.speed.unwrap_or(0.0)),
        );
        telemetry::emit_completion(log);
        self.schedule_removal(message_id, generation, self.shared.cfg.cleanup_grace());
    }

    /// Remember that the server has sent everything, without changing status.
    pub fn mark_content_complete(&self, message_id: &str) -> CoreResult<bool> {
        let mut records = self.records();
        let Some(record) = records.get_mut(message_id) else {
            return Ok(false);
        };
        let marked = self.mark_record_complete(message_id, record)?;
        drop(records);

        if marked {
            tracing::debug!(message_id, "stream content complete");
        }
        Ok(marked)
    }

    fn mark_record_complete(&self, message_id: &str, record: &mut StreamRecord) -> CoreResult<bool> {
        if record.data.status.is_terminal() || record.data.is_content_complete {
            return Ok(false);
        }
        let mut next = record.data.clone();
        next.is_content_complete = true;
        self.save(message_id, &next)?;
        record.data = next;
        Ok(true)
    }

    pub fn set_stream_error(&self, message_id: &str, message: &str) -> CoreResult<bool> {
        let mut records = self.records();
        let Some(record) = records.get_mut(message_id) else {
            return Ok(false);
        };
        let settled = self.fail_record(message_id, record, message)?;
        drop(records);

        self.announce_failed(message_id, message, settled);
        Ok(true)
    }

    fn fail_record(&self, message_id: &str, record: &mut StreamRecord, message: &str) -> CoreResult<Settled> {
        if record.data.status.is_terminal() {
            return Err(ChatStreamError::InvalidState {
                message_id: message_id.to_string(),
                op: "fail",
                status: record.data.status,
            });
        }
        let mut next = record.data.clone();
        next.status = StreamStatus::Error;
        next.error = Some(message.to_string());
        next.is_paused_for_ui = false;
        next.completed_at = Some(now_ms());
        self.save(message_id, &next)?;
        record.data = next;
        record.release_abort();
        Ok(settled(message_id, record))
    }

    fn announce_failed(&self, message_id: &str, message: &str, settled: Settled) {
        self.deliver(message_id, settled.delivery, true);
        tracing::info!(message_id, error = message, "stream failed");
        telemetry::emit(StreamTrace::new(message_id, "error", StreamStatus::Error).error("stream", message));
        telemetry::emit_completion(settled.log);
    }

    /// Settle a record whose connection has gone away. The status is read and
    /// changed under one lock, so a concurrent pause cannot be overtaken:
    ///
    /// - finished while PAUSED: only marked content-complete; resume completes it
    /// - finished otherwise: COMPLETED
    /// - failed: ERROR with the failure message
    /// - cancelled while PAUSED: stays paused; resume reconnects
    /// - cancelled by a caller: COMPLETED with the partial content
    /// - cancelled by nobody (shutdown): ERROR with [`INTERRUPTED`]
    ///
    /// Terminal records are left alone.
    pub fn end_stream(&self, message_id: &str, end: StreamEnd) -> CoreResult<StreamStatus> {
        let mut records = self.records();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| ChatStreamError::NotFound {
                message_id: message_id.to_string(),
            })?;
        let status = record.data.status;
        if status.is_terminal() {
            return Ok(status);
        }
        let requested = record.abort_requested;
        record.release_abort();

        enum Outcome {
            Completed(Settled),
            Failed(String, Settled),
        }
        let outcome = match (end, status) {
            (StreamEnd::Finished, StreamStatus::Paused) => {
                if self.mark_record_complete(message_id, record)? {
                    tracing::debug!(message_id, "stream content complete while paused");
                }
                None
            }
            (StreamEnd::Cancelled, StreamStatus::Paused) => None,
            (StreamEnd::Failed(message), _) => {
                let settled = self.fail_record(message_id, record, &message)?;
                Some(Outcome::Failed(message, settled))
            }
            (StreamEnd::Cancelled, _) if !requested => {
                let settled = self.fail_record(message_id, record, INTERRUPTED)?;
                Some(Outcome::Failed(INTERRUPTED.to_string(), settled))
            }
            (StreamEnd::Finished | StreamEnd::Cancelled, _) => {
                self.complete_record(message_id, record)?.map(Outcome::Completed)
            }
        };
        let status = record.data.status;
        drop(records);

        match outcome {
            Some(Outcome::Completed(settled)) => self.announce_completed(message_id, settled),
            Some(Outcome::Failed(message, settled)) => self.announce_failed(message_id, &message, settled),
            None => {}
        }
        Ok(status)
    }

    /// Current view of a record. A record missing from memory is recovered
    /// from its snapshot and its content pushed to the message store once.
    /// COMPLETED records past their cleanup grace are removed instead, so a
    /// process that exited before its removal timer fired does not leave them
    /// behind; younger ones get a timer for the rest of the grace.
    pub fn get_stream_state(&self, message_id: &str) -> CoreResult<Option<StreamState>> {
        let expired = {
            let records = self.records();
            match records.get(message_id) {
                Some(record) if self.is_expired(&record.data) => Some(record.generation),
                Some(record) => return Ok(Some(record.view(message_id))),
                None => None,
            }
        };
        if let Some(generation) = expired {
            self.remove_completed(message_id, generation);
            return Ok(None);
        }

        let Some(snapshot) = self.shared.persistence.load(message_id)? else {
            return Ok(None);
        };
        let data = RecordData::from_snapshot(snapshot);
        if self.is_expired(&data) {
            // removal is only valid if nobody restarted the id meanwhile
            let records = self.records();
            if !records.contains_key(message_id) {
                if let Err(e) = self.shared.persistence.remove(message_id) {
                    tracing::warn!(message_id, error = %e, "could not remove expired snapshot");
                }
                drop(records);
                tracing::debug!(message_id, "expired completed snapshot removed");
                return Ok(None);
            }
            return Ok(records.get(message_id).map(|r| r.view(message_id)));
        }

        let mut records = self.records();
        let generation = match records.entry(message_id.to_string()) {
            // someone recovered or restarted it meanwhile
            Entry::Occupied(e) => return Ok(Some(e.get().view(message_id))),
            Entry::Vacant(v) => {
                tracing::info!(message_id, status = %data.status, "stream recovered from snapshot");
                let generation = self.shared.generations.fetch_add(1, Ordering::Relaxed) + 1;
                v.insert(StreamRecord {
                    data,
                    abort: None,
                    abort_requested: false,
                    renderer: None,
                    generation,
                });
                generation
            }
        };
        let record = &records[message_id];
        let view = record.view(message_id);
        let restore = (!record.data.content.is_empty() || !record.data.reasoning.is_empty())
            .then(|| record.data.message_update());
        let remaining = (record.data.status == StreamStatus::Completed).then(|| self.grace_left(&record.data));
        drop(records);

        if let Some(update) = restore
            && let Err(e) = self.shared.message_store.update_message(message_id, update)
        {
            tracing::warn!(message_id, error = %e, "could not restore recovered content");
        }
        if let Some(remaining) = remaining {
            self.schedule_removal(message_id, generation, remaining);
        }
        Ok(Some(view))
    }

    /// Forget a terminal record and delete its snapshot.
    pub fn clear_stream(&self, message_id: &str) -> CoreResult<bool> {
        let mut records = self.records();
        let in_memory = match records.get(message_id) {
            Some(record) if !record.data.status.is_terminal() => {
                return Err(ChatStreamError::InvalidState {
                    message_id: message_id.to_string(),
                    op: "clear",
                    status: record.data.status,
                });
            }
            Some(_) => true,
            None => false,
        };
        if !in_memory {
            match self.shared.persistence.load(message_id)? {
                Some(s) if !s.status.is_terminal() => {
                    return Err(ChatStreamError::InvalidState {
                        message_id: message_id.to_string(),
                        op: "clear",
                        status: s.status,
                    });
                }
                Some(_) => {}
                None => return Ok(false),
            }
        }
        self.shared.persistence.remove(message_id)?;
        let removed = records.remove(message_id);
        drop(records);

        if let Some(renderer) = removed.and_then(|r| r.renderer) {
            renderer.clear();
        }
        tracing::debug!(message_id, "stream cleared");
        Ok(true)
    }

    pub fn attach_renderer(&self, message_id: &str, renderer: RenderBuffer) -> CoreResult<()> {
        let mut records = self.records();
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| ChatStreamError::NotFound {
                message_id: message_id.to_string(),
            })?;
        record.renderer = Some(renderer);
        Ok(())
    }

    pub fn has_renderer(&self, message_id: &str) -> bool {
        self.records()
            .get(message_id)
            .is_some_and(|r| r.renderer.is_some())
    }

    /// Ids of all non-terminal records, sorted.
    pub fn active_streams(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records()
            .iter()
            .filter(|(_, r)| !r.data.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Interrupt every live connection. Records are left to whoever drives
    /// them; an unrequested cancellation of a streaming record is an error.
    pub fn shutdown(&self) {
        self.shared.root.cancel();
    }

    fn grace_left(&self, data: &RecordData) -> Duration {
        let grace = self.shared.cfg.cleanup_grace();
        let elapsed_ms = data.completed_at.map_or(0, |at| now_ms().saturating_sub(at).max(0) as u64);
        grace.saturating_sub(Duration::from_millis(elapsed_ms))
    }

    fn is_expired(&self, data: &RecordData) -> bool {
        data.status == StreamStatus::Completed && self.grace_left(data).is_zero()
    }

    // Without a runtime there is no timer; the record then expires lazily on
    // the next `get_stream_state` after the grace.
    fn schedule_removal(&self, message_id: &str, generation: u64, delay: Duration) {
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!(message_id, "no runtime for removal timer; record expires on next lookup");
            return;
        };
        let this = self.clone();
        let id = message_id.to_string();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            this.remove_completed(&id, generation);
        });
    }

    fn remove_completed(&self, message_id: &str, generation: u64) {
        let mut records = self.records();
        let current = records
            .get(message_id)
            .is_some_and(|r| r.generation == generation && r.data.status == StreamStatus::Completed);
        if !current {
            return;
        }
        if let Err(e) = self.shared.persistence.remove(message_id) {
            tracing::warn!(message_id, error = %e, "could not remove completed snapshot");
        }
        records.remove(message_id);
        drop(records);
        tracing::debug!(message_id, "completed stream removed");
    }
}

fn settled(message_id: &str, record: &StreamRecord) -> Settled {
    Settled {
        delivery: Delivery {
            update: record.data.message_update(),
            frame: record.data.frame(),
            renderer: record.renderer.clone(),
        },
        log: completion_log(message_id, &record.data),
        generation: record.generation,
    }
}

fn completion_log(message_id: &str, d: &RecordData) -> CompletionLog {
    let mut log = CompletionLog::new()
        .message_id(message_id)
        .status(d.status)
        .started_at_ms(d.started_at)
        .text(&d.content)
        .reasoning_len(d.reasoning.len())
        .tokens(d.completion_tokens, d.speed)
        .error_kind_opt(d.error.as_ref().map(|_| "stream"))
        .error_message_opt(d.error.as_deref());
    if let Some(done) = d.completed_at {
        log = log.latency_ms(done.saturating_sub(d.started_at).max(0) as u64);
    }
    log
}
