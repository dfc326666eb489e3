//! Per-message entry points for the UI: start, pause, resume, cancel and
//! inspect a generation. Composes the state machine, a transport and one
//! render buffer per message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::accumulator::{Applied, DeltaAccumulator, calculate_speed};
use crate::config::{Config, RenderCfg};
use crate::error::{ChatStreamError, CoreResult};
use crate::message_store::MessageStore;
use crate::model::CompletionRequest;
use crate::persistence::PersistenceAdapter;
use crate::render::{RenderBuffer, RenderFrame};
use crate::sse::{SseOptions, SseTranscoder};
use crate::state::{ResumeDescriptor, StreamEnd, StreamManager, StreamState, StreamTicket, StreamUpdate};
use crate::transport::{ByteStream, CompletionTransport, HttpTransport};

/// UI callback: message id and the frame to show.
pub type UiCallback = Arc<dyn Fn(&str, &RenderFrame) + Send + Sync>;

pub use crate::state::INTERRUPTED;

// How an ingestion loop ended.
#[derive(Debug)]
enum End {
    Done,
    Eof,
    Cancelled,
    Failed(ChatStreamError),
}

impl End {
    fn into_stream_end(self) -> StreamEnd {
        match self {
            End::Done | End::Eof => StreamEnd::Finished,
            End::Cancelled => StreamEnd::Cancelled,
            End::Failed(e) => StreamEnd::Failed(e.to_string()),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            End::Done => "done",
            End::Eof => "eof",
            End::Cancelled => "cancelled",
            End::Failed(_) => "failed",
        }
    }
}

#[derive(Clone)]
pub struct StreamController {
    manager: StreamManager,
    transport: Arc<dyn CompletionTransport>,
    render_interval: Duration,
    ui: Option<UiCallback>,
    sse: SseOptions,
    // last base request per message, for reissuing after a lost connection
    requests: Arc<Mutex<HashMap<String, CompletionRequest>>>,
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("transport", &self.transport.name())
            .field("render_interval", &self.render_interval)
            .field("manager", &self.manager)
            .finish()
    }
}

impl StreamController {
    pub fn new(manager: StreamManager, transport: Arc<dyn CompletionTransport>, render: &RenderCfg) -> Self {
        Self {
            manager,
            transport,
            render_interval: render.interval(),
            ui: None,
            sse: SseOptions::default(),
            requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wire everything from config: snapshot storage, HTTP transport and timings.
    pub fn from_config(cfg: &Config, message_store: Arc<dyn MessageStore>) -> CoreResult<Self> {
        let persistence = PersistenceAdapter::from_config(&cfg.persistence)?;
        let manager = StreamManager::new(message_store, persistence, cfg.streams.clone());
        let transport = HttpTransport::from_config(&cfg.endpoint, &cfg.http)?;
        Ok(Self::new(manager, Arc::new(transport), &cfg.render))
    }

    pub fn with_ui<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &RenderFrame) + Send + Sync + 'static,
    {
        self.ui = Some(Arc::new(callback));
        self
    }

    /// Fails with `Validation` when a separator is empty.
    pub fn with_sse_options(mut self, opts: SseOptions) -> CoreResult<Self> {
        opts.validate()?;
        self.sse = opts;
        Ok(self)
    }

    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    fn requests(&self) -> MutexGuard<'_, HashMap<String, CompletionRequest>> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn attach_ui(&self, message_id: &str) -> CoreResult<Option<RenderBuffer>> {
        let Some(ui) = self.ui.clone() else {
            return Ok(None);
        };
        let id = message_id.to_string();
        let buffer = RenderBuffer::new(self.render_interval, move |frame: &RenderFrame| ui(&id, frame));
        self.manager.attach_renderer(message_id, buffer.clone())?;
        Ok(Some(buffer))
    }

    fn state_of(&self, message_id: &str) -> CoreResult<StreamState> {
        self.manager
            .get_stream_state(message_id)?
            .ok_or_else(|| ChatStreamError::NotFound {
                message_id: message_id.to_string(),
            })
    }

    /// Start a generation and drive it until the stream ends, is cancelled or
    /// fails. Pause, resume and cancel are called from other tasks meanwhile.
    /// Transport failures end up on the record, not in the returned error.
    pub async fn generate(&self, message_id: &str, request: CompletionRequest) -> CoreResult<StreamState> {
        let request = request.for_message(message_id);
        let ticket = self.manager.start_stream(message_id)?;
        self.attach_ui(message_id)?;
        self.requests().insert(message_id.to_string(), request.clone());
        self.run(message_id, &request, ticket, DeltaAccumulator::new()).await
    }

    async fn run(
        &self,
        message_id: &str,
        request: &CompletionRequest,
        ticket: StreamTicket,
        acc: DeltaAccumulator,
    ) -> CoreResult<StreamState> {
        let opened = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => None,
            res = self.transport.open_stream(request) => Some(res),
        };
        match opened {
            None => self.settle(message_id, End::Cancelled)?,
            Some(Err(e)) => {
                tracing::info!(message_id, stream_id = %ticket.stream_id, error = %e, "stream request failed");
                self.settle(message_id, End::Failed(e))?
            }
            Some(Ok(bytes)) => return self.ingest(message_id, bytes, ticket.cancel, acc).await,
        }
        self.state_of(message_id)
    }

    /// Feed a raw event stream into an already started record.
    pub async fn ingest(
        &self,
        message_id: &str,
        bytes: ByteStream,
        cancel: CancellationToken,
        mut acc: DeltaAccumulator,
    ) -> CoreResult<StreamState> {
        let span = tracing::info_span!(
            "stream.ingest",
            stream.message_id = %message_id,
            events = tracing::field::Empty,
            end = tracing::field::Empty,
        );
        async {
            let mut events = SseTranscoder::with_options(bytes, self.sse.clone())?.with_cancel(cancel.clone());
            let mut applied: u64 = 0;
            let end = loop {
                match events.next().await {
                    None if cancel.is_cancelled() => break End::Cancelled,
                    None => break End::Eof,
                    Some(Err(e)) => break End::Failed(e),
                    Some(Ok(event)) => match acc.apply(&event) {
                        Applied::Delta(progress) => {
                            applied += 1;
                            if let Err(e) = self.manager.update_stream(message_id, StreamUpdate::from(progress)) {
                                // cannot persist: stop reading rather than show unsaved text
                                self.manager.release_connection(message_id);
                                return Err(e);
                            }
                        }
                        Applied::Done => break End::Done,
                        Applied::Skipped(reason) => {
                            tracing::debug!(message_id, ?reason, "event skipped");
                        }
                    },
                }
            };
            drop(events);
            let span = tracing::Span::current();
            span.record("events", applied);
            span.record("end", end.label());

            self.settle(message_id, end)?;
            self.state_of(message_id)
        }
        .instrument(span)
        .await
    }

    // Decide the record's next status once its connection is gone.
    fn settle(&self, message_id: &str, end: End) -> CoreResult<()> {
        let status = self.manager.end_stream(message_id, end.into_stream_end())?;
        tracing::debug!(message_id, %status, "stream settled");
        Ok(())
    }

    pub fn pause(&self, message_id: &str) -> CoreResult<bool> {
        self.manager.pause_stream(message_id)
    }

    /// Resume a paused record. When its connection is gone and the answer was
    /// not finished, the original request is reissued with the text received
    /// so far as a prefix, and this call runs until that stream ends.
    pub async fn resume(&self, message_id: &str) -> CoreResult<ResumeDescriptor> {
        let descriptor = self.manager.resume_stream(message_id)?;
        if descriptor.needs_reconnect {
            let request = self.requests().get(message_id).cloned();
            match request {
                Some(request) => {
                    self.reconnect(message_id, &request).await?;
                }
                None => {
                    tracing::info!(message_id, "no request known for resumed stream; waiting for reconnect");
                }
            }
        }
        Ok(descriptor)
    }

    /// Continue a live record without a connection by reissuing `request`
    /// with the accumulated prefix appended.
    pub async fn reconnect(&self, message_id: &str, request: &CompletionRequest) -> CoreResult<StreamState> {
        let state = self.state_of(message_id)?;
        let ticket = self.manager.attach_connection(message_id)?;
        // records recovered from storage come back without a renderer
        if !self.manager.has_renderer(message_id) {
            self.attach_ui(message_id)?;
        }
        self.requests().insert(message_id.to_string(), request.clone());
        let continuation = request
            .continuation(&state.content, &state.reasoning_content)
            .for_message(message_id);
        let acc = DeltaAccumulator::with_prefix(&state.content, &state.reasoning_content);
        tracing::info!(message_id, prefix_len = state.content.len(), "reissuing request with prefix");
        self.run(message_id, &continuation, ticket, acc).await
    }

    /// Hard stop of the connection.
    pub fn cancel(&self, message_id: &str) -> CoreResult<bool> {
        self.manager.abort_stream(message_id)
    }

    pub fn state(&self, message_id: &str) -> CoreResult<Option<StreamState>> {
        self.manager.get_stream_state(message_id)
    }

    /// Forget a finished or failed record and its snapshot.
    pub fn dismiss(&self, message_id: &str) -> CoreResult<bool> {
        let cleared = self.manager.clear_stream(message_id)?;
        self.requests().remove(message_id);
        Ok(cleared)
    }

    /// Rebuild records for every STREAMING or PAUSED snapshot, e.g. after a
    /// restart. Returns the recovered states; none of them has a connection.
    pub fn recover_pending(&self) -> CoreResult<Vec<StreamState>> {
        let mut ids = self.manager.persistence().message_ids()?;
        ids.sort();
        let mut pending = Vec::new();
        for id in ids {
            let Some(state) = self.manager.get_stream_state(&id)? else {
                continue;
            };
            if state.status.is_terminal() {
                continue;
            }
            if !self.manager.has_renderer(&id) {
                self.attach_ui(&id)?;
            }
            pending.push(state);
        }
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "recovered unfinished streams");
        }
        Ok(pending)
    }

    /// Non-streaming generation: one request, one render.
    pub async fn respond_once(&self, message_id: &str, request: CompletionRequest) -> CoreResult<StreamState> {
        let request = request.for_message(message_id);
        let ticket = self.manager.start_stream(message_id)?;
        let ui = self.attach_ui(message_id)?;
        self.requests().insert(message_id.to_string(), request.clone());
        let started = Instant::now();

        let res = tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => None,
            res = self.transport.complete(&request) => Some(res),
        };
        let resp = match res {
            None => {
                self.settle(message_id, End::Cancelled)?;
                return self.state_of(message_id);
            }
            Some(Err(e)) => {
                self.settle(message_id, End::Failed(e))?;
                return self.state_of(message_id);
            }
            Some(Ok(resp)) => resp,
        };

        let tokens = resp.usage.map(|u| u.completion_tokens).unwrap_or(0);
        let Some(choice) = resp.choices.into_iter().next() else {
            self.manager.set_stream_error(message_id, "empty response")?;
            return self.state_of(message_id);
        };
        self.manager.update_stream(
            message_id,
            StreamUpdate {
                content: Some(choice.message.content),
                reasoning_content: choice.message.reasoning_content,
                completion_tokens: Some(tokens),
                speed: Some(calculate_speed(tokens, started.elapsed())),
                tool_calls: choice.message.tool_calls,
            },
        )?;
        if let Some(ui) = ui {
            ui.render_now(self.state_of(message_id)?.frame());
        }
        self.manager.complete_stream(message_id)?;
        self.state_of(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamsCfg;
    use crate::message_store::InMemoryMessageStore;
    use crate::model::{ChatMessage, CompletionResponse, Role, StreamStatus};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::channel::mpsc;
    use futures::stream;
    use serde_json::json;
    use std::collections::VecDeque;

    type Chunk = Result<Bytes, std::io::Error>;

    /// Transport serving queued byte streams and recording requests.
    #[derive(Default)]
    struct FakeTransport {
        streams: Mutex<VecDeque<CoreResult<ByteStream>>>,
        response: Mutex<Option<CompletionResponse>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl FakeTransport {
        fn push_stream(&self, s: CoreResult<ByteStream>) {
            self.streams.lock().unwrap().push_back(s);
        }

        fn push_chunks(&self, chunks: Vec<String>) {
            let items: Vec<Chunk> = chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
            self.push_stream(Ok(Box::pin(stream::iter(items))));
        }

        fn push_channel(&self) -> mpsc::UnboundedSender<Chunk> {
            let (tx, rx) = mpsc::unbounded::<Chunk>();
            self.push_stream(Ok(Box::pin(rx)));
            tx
        }
    }

    #[async_trait]
    impl CompletionTransport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn open_stream(&self, req: &CompletionRequest) -> CoreResult<ByteStream> {
            self.requests.lock().unwrap().push(req.clone());
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ChatStreamError::ProviderUnavailable { provider: "fake".into() }))
        }

        async fn complete(&self, req: &CompletionRequest) -> CoreResult<CompletionResponse> {
            self.requests.lock().unwrap().push(req.clone());
            self.response
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| ChatStreamError::ProviderUnavailable { provider: "fake".into() })
        }
    }

    struct Harness {
        ctrl: StreamController,
        transport: Arc<FakeTransport>,
        store: Arc<InMemoryMessageStore>,
        persistence: PersistenceAdapter,
        frames: Arc<Mutex<Vec<(String, RenderFrame)>>>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryMessageStore::new());
        let persistence = PersistenceAdapter::in_memory();
        let manager = StreamManager::new(store.clone(), persistence.clone(), StreamsCfg::default());
        let transport = Arc::new(FakeTransport::default());
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let ctrl = StreamController::new(manager, transport.clone(), &RenderCfg::default())
            .with_ui(move |id: &str, f: &RenderFrame| sink.lock().unwrap().push((id.to_string(), f.clone())));
        Harness {
            ctrl,
            transport,
            store,
            persistence,
            frames,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("test-model", vec![ChatMessage::new(Role::User, "Hi")])
    }

    fn delta(text: &str) -> String {
        format!("data: {}\n\n", json!({ "choices": [{ "delta": { "content": text } }] }))
    }

    fn done() -> String {
        "data: [DONE]\n\n".to_string()
    }

    async fn wait_for_content(ctrl: &StreamController, id: &str, content: &str) {
        for _ in 0..200 {
            if let Ok(Some(s)) = ctrl.state(id)
                && s.content == content
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("content never became {content:?}");
    }

    #[tokio::test]
    async fn generate_runs_to_completion_regardless_of_chunking() {
        let wire = format!("{}{}{}", delta("Hel"), delta("lo wörld"), done());
        for size in [1, 3, 7, wire.len()] {
            let h = harness();
            let items: Vec<Chunk> = wire.as_bytes().chunks(size).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
            h.transport.push_stream(Ok(Box::pin(stream::iter(items))));

            let state = h.ctrl.generate("m1", request()).await.unwrap();
            assert_eq!(state.status, StreamStatus::Completed, "chunk size {size}");
            assert_eq!(state.content, "Hello wörld");
            assert_eq!(h.store.get_message("m1").unwrap().content, "Hello wörld");
            let frames = h.frames.lock().unwrap();
            assert_eq!(frames.last().unwrap().1.content, "Hello wörld");
        }
    }

    #[tokio::test]
    async fn end_of_stream_without_done_completes() {
        let h = harness();
        h.transport.push_chunks(vec![delta("tail"), "data: {bad json}\n\n".into()]);
        let state = h.ctrl.generate("m", request()).await.unwrap();
        assert_eq!(state.status, StreamStatus::Completed);
        assert_eq!(state.content, "tail");
    }

    #[tokio::test]
    async fn open_failure_becomes_error_state() {
        let h = harness();
        h.transport.push_stream(Err(ChatStreamError::RateLimited {
            provider: "fake".into(),
            retry_after: Some(3),
        }));
        let state = h.ctrl.generate("m", request()).await.unwrap();
        assert_eq!(state.status, StreamStatus::Error);
        assert!(state.error.unwrap().contains("rate limited"));
        let last = h.frames.lock().unwrap().last().cloned().unwrap();
        assert!(last.1.error.is_some());
    }

    #[tokio::test]
    async fn transport_error_mid_stream_fails_record() {
        let h = harness();
        let tx = h.transport.push_channel();
        let ctrl = h.ctrl.clone();
        let task = tokio::spawn(async move { ctrl.generate("m3", request()).await });

        tx.unbounded_send(Ok(Bytes::from(delta("X")))).unwrap();
        wait_for_content(&h.ctrl, "m3", "X").await;
        tx.unbounded_send(Err(std::io::Error::other("connection reset"))).unwrap();

        let state = task.await.unwrap().unwrap();
        assert_eq!(state.status, StreamStatus::Error);
        assert_eq!(state.content, "X");
        assert!(state.error.as_deref().unwrap().contains("connection reset"));
        assert!(!state.has_live_connection);
        assert!(matches!(h.ctrl.resume("m3").await, Err(ChatStreamError::InvalidState { .. })));
        assert!(h.persistence.load("m3").unwrap().is_some());
    }

    #[tokio::test]
    async fn done_while_paused_completes_on_resume() {
        let h = harness();
        let tx = h.transport.push_channel();
        let ctrl = h.ctrl.clone();
        let task = tokio::spawn(async move { ctrl.generate("m2", request()).await });

        tx.unbounded_send(Ok(Bytes::from(delta("ABC")))).unwrap();
        wait_for_content(&h.ctrl, "m2", "ABC").await;
        assert!(h.ctrl.pause("m2").unwrap());
        tx.unbounded_send(Ok(Bytes::from(delta("DEF")))).unwrap();
        tx.unbounded_send(Ok(Bytes::from(done()))).unwrap();

        let state = task.await.unwrap().unwrap();
        assert_eq!(state.status, StreamStatus::Paused);
        assert!(state.is_content_complete);
        assert_eq!(state.content, "ABCDEF");
        assert_eq!(h.store.get_message("m2").unwrap().content, "ABC");

        let d = h.ctrl.resume("m2").await.unwrap();
        assert!(!d.needs_reconnect);
        assert_eq!(d.last_content, "ABCDEF");
        let state = h.ctrl.state("m2").unwrap().unwrap();
        assert_eq!(state.status, StreamStatus::Completed);
        assert_eq!(h.store.get_message("m2").unwrap().content, "ABCDEF");
        assert_eq!(h.transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_while_streaming_keeps_partial_answer() {
        let h = harness();
        let tx = h.transport.push_channel();
        let ctrl = h.ctrl.clone();
        let task = tokio::spawn(async move { ctrl.generate("m4", request()).await });

        tx.unbounded_send(Ok(Bytes::from(delta("Y")))).unwrap();
        wait_for_content(&h.ctrl, "m4", "Y").await;
        assert!(h.ctrl.cancel("m4").unwrap());
        assert!(!h.ctrl.cancel("m4").unwrap());

        let state = task.await.unwrap().unwrap();
        assert_eq!(state.status, StreamStatus::Completed);
        assert_eq!(state.content, "Y");
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn cancel_while_paused_then_resume_reissues_with_prefix() {
        let h = harness();
        let tx = h.transport.push_channel();
        let ctrl = h.ctrl.clone();
        let task = tokio::spawn(async move { ctrl.generate("m", request()).await });

        tx.unbounded_send(Ok(Bytes::from(delta("AB")))).unwrap();
        wait_for_content(&h.ctrl, "m", "AB").await;
        h.ctrl.pause("m").unwrap();
        h.ctrl.cancel("m").unwrap();
        let state = task.await.unwrap().unwrap();
        assert_eq!(state.status, StreamStatus::Paused);
        assert!(!state.has_live_connection);

        h.transport.push_chunks(vec![delta("CD"), done()]);
        let d = h.ctrl.resume("m").await.unwrap();
        assert!(d.needs_reconnect);
        assert_eq!(d.last_content, "AB");

        let state = h.ctrl.state("m").unwrap().unwrap();
        assert_eq!(state.status, StreamStatus::Completed);
        assert_eq!(state.content, "ABCD");
        let requests = h.transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let prefix = requests[1].messages.last().unwrap();
        assert_eq!(prefix.role, Role::Assistant);
        assert_eq!(prefix.content, "AB");
        assert!(requests.iter().all(|r| r.message_id.as_deref() == Some("m")));
    }

    #[tokio::test]
    async fn unrequested_cancellation_is_an_interruption() {
        let h = harness();
        let tx = h.transport.push_channel();
        let ctrl = h.ctrl.clone();
        let task = tokio::spawn(async move { ctrl.generate("m", request()).await });

        tx.unbounded_send(Ok(Bytes::from(delta("half")))).unwrap();
        wait_for_content(&h.ctrl, "m", "half").await;
        h.ctrl.manager().shutdown();

        let state = task.await.unwrap().unwrap();
        assert_eq!(state.status, StreamStatus::Error);
        assert_eq!(state.error.as_deref(), Some(INTERRUPTED));
        assert_eq!(state.content, "half");
    }

    #[tokio::test]
    async fn respond_once_renders_a_single_frame() {
        let h = harness();
        *h.transport.response.lock().unwrap() = Some(
            serde_json::from_value(json!({
                "choices": [{ "message": { "content": "Complete answer" }, "finish_reason": "stop" }],
                "usage": { "prompt_tokens": 2, "completion_tokens": 2 }
            }))
            .unwrap(),
        );
        let state = h.ctrl.respond_once("m", request()).await.unwrap();
        assert_eq!(state.status, StreamStatus::Completed);
        assert_eq!(state.content, "Complete answer");
        assert_eq!(state.completion_tokens, 2);
        let frames = h.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, "m");
        assert_eq!(frames[0].1.content, "Complete answer");
    }

    #[tokio::test]
    async fn recover_pending_after_restart() {
        let h = harness();
        let tx = h.transport.push_channel();
        let ctrl = h.ctrl.clone();
        let task = tokio::spawn(async move { ctrl.generate("m", request()).await });
        tx.unbounded_send(Ok(Bytes::from(delta("draft")))).unwrap();
        wait_for_content(&h.ctrl, "m", "draft").await;
        h.ctrl.pause("m").unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        // same storage, fresh process
        let store = Arc::new(InMemoryMessageStore::new());
        let manager = StreamManager::new(store.clone(), h.persistence.clone(), StreamsCfg::default());
        let transport = Arc::new(FakeTransport::default());
        let ctrl = StreamController::new(manager, transport.clone(), &RenderCfg::default());
        let pending = ctrl.recover_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, StreamStatus::Paused);
        assert!(pending[0].is_content_complete);
        assert_eq!(store.get_message("m").unwrap().content, "draft");

        // the server already finished, so resume completes without a request
        let d = ctrl.resume("m").await.unwrap();
        assert!(!d.needs_reconnect);
        assert!(transport.requests.lock().unwrap().is_empty());
        assert_eq!(ctrl.state("m").unwrap().unwrap().status, StreamStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_pending_cleans_up_completed_snapshots() {
        let h = harness();
        h.transport.push_chunks(vec![delta("fin"), done()]);
        h.ctrl.generate("m", request()).await.unwrap();

        // storage as a process that exited before its removal timer left it
        let storage = PersistenceAdapter::in_memory();
        storage.save("m", &h.persistence.load("m").unwrap().unwrap()).unwrap();

        let store = Arc::new(InMemoryMessageStore::new());
        let manager = StreamManager::new(store, storage.clone(), StreamsCfg::default());
        let ctrl = StreamController::new(manager, Arc::new(FakeTransport::default()), &RenderCfg::default());
        assert!(ctrl.recover_pending().unwrap().is_empty());
        assert_eq!(storage.message_ids().unwrap(), vec!["m".to_string()]);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(storage.message_ids().unwrap().is_empty());
        assert!(ctrl.state("m").unwrap().is_none());
    }

    #[test]
    fn empty_sse_separator_is_rejected() {
        let h = harness();
        let opts = SseOptions {
            stream_separator: String::new(),
            ..Default::default()
        };
        assert!(matches!(h.ctrl.with_sse_options(opts), Err(ChatStreamError::Validation(_))));
    }

    #[tokio::test]
    async fn dismiss_clears_failed_stream() {
        let h = harness();
        let state = h.ctrl.generate("m", request()).await.unwrap();
        assert_eq!(state.status, StreamStatus::Error);
        assert!(h.ctrl.dismiss("m").unwrap());
        assert!(h.ctrl.state("m").unwrap().is_none());
    }

    #[tokio::test]
    async fn ingest_span_carries_message_id() {
        let (spans, _guard) = crate::telemetry::test_span::install_capture();
        let h = harness();
        h.transport.push_chunks(vec![delta("a"), delta("b"), done()]);
        h.ctrl.generate("span-1", request()).await.unwrap();

        let fields = spans.fields_of("stream.ingest");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].get("stream.message_id").map(String::as_str), Some("span-1"));
        assert_eq!(fields[0].get("events").map(String::as_str), Some("2"));
        assert_eq!(fields[0].get("end").map(String::as_str), Some("done"));
    }
}
