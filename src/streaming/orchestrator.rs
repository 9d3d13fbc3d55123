//! Per-request coordination of the translation pipeline.
//!
//! [`StreamSession`] is the synchronous core: bytes in, validated outbound
//! events out. [`StreamOrchestrator`] drives a session from an upstream body,
//! handling read errors, retries, cancellation and delivery to the client.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::aggregator::ArgumentAggregator;
use super::content::ContentBlockManager;
use super::frame::{DecoderConfig, DecoderStats, EventStreamDecoder};
use super::normalizer::{EventNormalizer, UpstreamEvent};
use super::protocol::OutboundStateMachine;
use super::sink::EventSink;
use super::tools::{TEXT_BLOCK_INDEX, ToolLifecycleManager};
use super::usage::UsageTracker;
use crate::config::StreamConfig;
use crate::error::{ProxyError, Result};
use crate::models::claude::{
    MessageDeltaData, MessageMetadata, MessageResponse, StopReason, StreamEvent, UsageInfo,
};
use crate::provider::{ByteStream, StatsRecorder};

/// What the engine needs to know about the client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub model: String,
    pub stream: bool,
    pub input_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    UpstreamError,
    ReadFailed,
    ProtocolError,
    Cancelled,
}

/// Final accounting of one response
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub message_id: String,
    pub model: String,
    pub usage: UsageInfo,
    pub stop_reason: Option<StopReason>,
    pub bytes_read: usize,
    pub upstream_events: usize,
    pub events_emitted: usize,
    pub tools: usize,
    pub violations: usize,
    pub decoder: DecoderStats,
    pub outcome: SessionOutcome,
}

/// Mutable state of one response; owned by a single task
pub struct StreamSession {
    message_id: String,
    model: String,
    decoder: EventStreamDecoder,
    normalizer: EventNormalizer,
    tools: ToolLifecycleManager,
    aggregator: ArgumentAggregator,
    guard: OutboundStateMachine,
    usage: UsageTracker,
    bytes_read: usize,
    upstream_events: usize,
    events_emitted: usize,
    stop_override: Option<StopReason>,
    final_stop_reason: Option<StopReason>,
    /// Upstream signalled the end; remaining bytes are ignored
    upstream_done: bool,
    terminated: bool,
    outcome: SessionOutcome,
}

impl StreamSession {
    pub fn new(request: &RequestDescriptor, config: &StreamConfig) -> Self {
        Self {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: request.model.clone(),
            decoder: EventStreamDecoder::with_config(DecoderConfig::from(config)),
            normalizer: EventNormalizer::new(),
            tools: ToolLifecycleManager::new(),
            aggregator: ArgumentAggregator::new(),
            guard: OutboundStateMachine::new(config.protocol_mode),
            usage: UsageTracker::new(request.input_tokens),
            bytes_read: 0,
            upstream_events: 0,
            events_emitted: 0,
            stop_override: None,
            final_stop_reason: None,
            upstream_done: false,
            terminated: false,
            outcome: SessionOutcome::Completed,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// No further upstream input will be used
    pub fn is_done(&self) -> bool {
        self.upstream_done || self.terminated
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// `message_start` followed by a `ping`
    pub fn start(&mut self) -> Result<Vec<StreamEvent>> {
        let mut out = Vec::new();
        let message = MessageMetadata::new(
            self.message_id.clone(),
            self.model.clone(),
            self.usage.input_tokens(),
        );
        self.emit(StreamEvent::MessageStart { message }, &mut out)?;
        self.emit(StreamEvent::Ping, &mut out)?;
        Ok(out)
    }

    /// Decode a chunk of upstream bytes into outbound events
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>> {
        let mut out = Vec::new();
        if self.is_done() {
            debug!(bytes = chunk.len(), "Ignoring upstream bytes after end of response");
            return Ok(out);
        }
        self.bytes_read += chunk.len();

        for message in self.decoder.feed(chunk) {
            for event in self.normalizer.normalize(&message) {
                self.upstream_events += 1;
                self.route(event, &mut out)?;
                if self.is_done() {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    /// Close everything and emit the terminal `message_delta` and `message_stop`
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        let mut out = Vec::new();
        if self.terminated {
            return Ok(out);
        }

        for (id, outcome) in self.aggregator.finalize_pending() {
            if let Some(index) = self.tools.block_index(&id)
                && !outcome.emitted.is_empty()
            {
                self.emit(StreamEvent::input_json_delta(index, outcome.emitted), &mut out)?;
            }
            if !outcome.arguments.trim().is_empty() {
                self.tools.update_arguments(&id, outcome.parsed);
            }
        }
        for id in self.tools.active_ids() {
            self.close_tool(&id, &mut out)?;
        }

        let stop_reason = self.stop_override.unwrap_or(if self.tools.has_tools() {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        });
        self.final_stop_reason = Some(stop_reason);

        // closes any block still open before the usage snapshot below
        for stop in self.guard.close_open_blocks() {
            self.record(stop, &mut out);
        }

        let delta = StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self.usage.usage(),
        };
        self.emit(delta, &mut out)?;
        self.emit(StreamEvent::MessageStop, &mut out)?;
        self.terminated = true;
        Ok(out)
    }

    /// Best-effort termination after an unrecoverable read failure
    pub fn fail(&mut self, err: &ProxyError) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.terminated {
            return out;
        }
        self.outcome = SessionOutcome::ReadFailed;

        for id in self.tools.active_ids() {
            if let Err(e) = self.close_tool(&id, &mut out) {
                warn!(error = %e, "Failed to close tool during teardown");
            }
        }
        for stop in self.guard.close_open_blocks() {
            self.record(stop, &mut out);
        }
        if let Err(e) = self.emit(StreamEvent::error(err.error_type(), err.to_string()), &mut out)
        {
            warn!(error = %e, "Failed to emit error event");
        }
        match self.finish() {
            Ok(events) => out.extend(events),
            Err(e) => warn!(error = %e, "Failed to emit terminal events"),
        }
        out
    }

    /// Tear the session down, keeping only its accounting
    pub fn release(self, outcome: Option<SessionOutcome>) -> StreamSummary {
        StreamSummary {
            usage: self.usage.usage(),
            stop_reason: self.final_stop_reason,
            bytes_read: self.bytes_read,
            upstream_events: self.upstream_events,
            events_emitted: self.events_emitted,
            tools: self.tools.tool_count(),
            violations: self.guard.violations(),
            decoder: self.decoder.stats(),
            outcome: outcome.unwrap_or(self.outcome),
            message_id: self.message_id,
            model: self.model,
        }
    }

    fn route(&mut self, event: UpstreamEvent, out: &mut Vec<StreamEvent>) -> Result<()> {
        match event {
            UpstreamEvent::TextDelta { text } => {
                if self.guard.is_block_stopped(TEXT_BLOCK_INDEX) {
                    debug!(len = text.len(), "Dropping text for closed lead block");
                    return Ok(());
                }
                self.emit(StreamEvent::text_delta(TEXT_BLOCK_INDEX, text), out)
            }
            UpstreamEvent::ToolFragment {
                tool_use_id,
                name,
                fragment,
                stop,
            } => {
                if self.tools.is_finished(&tool_use_id) {
                    debug!(tool_use_id = %tool_use_id, "Fragment for finished tool ignored");
                    return Ok(());
                }
                if !self.tools.is_active(&tool_use_id) {
                    let events =
                        self.tools
                            .register_or_update(&tool_use_id, &name, &serde_json::json!({}));
                    self.emit_all(events, out)?;
                }

                let outcome = self
                    .aggregator
                    .process(&tool_use_id, &name, &fragment, stop);
                if !outcome.emitted.is_empty()
                    && let Some(index) = self.tools.block_index(&tool_use_id)
                {
                    self.emit(StreamEvent::input_json_delta(index, outcome.emitted), out)?;
                }
                if outcome.complete {
                    if !outcome.arguments.trim().is_empty() {
                        self.tools.update_arguments(&tool_use_id, outcome.parsed);
                    }
                    let events = self.tools.complete(&tool_use_id, None);
                    self.emit_all(events, out)?;
                }
                Ok(())
            }
            UpstreamEvent::ToolCallRequest {
                tool_use_id,
                name,
                arguments,
            } => {
                let events = self
                    .tools
                    .register_or_update(&tool_use_id, &name, &arguments);
                self.emit_all(events, out)
            }
            UpstreamEvent::ToolCallError {
                tool_use_id,
                message,
            } => {
                self.aggregator.discard(&tool_use_id);
                let events = self.tools.fail(&tool_use_id, &message);
                self.emit_all(events, out)
            }
            UpstreamEvent::SessionStart { session_id } => {
                debug!(
                    session_id = session_id.as_deref().unwrap_or("unknown"),
                    "Upstream session started"
                );
                Ok(())
            }
            UpstreamEvent::SessionEnd { .. } => Ok(()),
            UpstreamEvent::Completion { stop_reason } => {
                if let Some(reason @ (StopReason::MaxTokens | StopReason::StopSequence)) =
                    stop_reason
                {
                    self.stop_override = Some(reason);
                }
                for id in self.tools.active_ids() {
                    self.close_tool(&id, out)?;
                }
                Ok(())
            }
            ref error @ UpstreamEvent::Error { .. } if error.is_content_length_exceeded() => {
                info!("Upstream reported content length exceeded, ending with max_tokens");
                self.stop_override = Some(StopReason::MaxTokens);
                self.upstream_done = true;
                Ok(())
            }
            UpstreamEvent::Error { code, message, .. } => {
                for id in self.tools.active_ids() {
                    self.close_tool(&id, out)?;
                }
                for stop in self.guard.close_open_blocks() {
                    self.record(stop, out);
                }
                let error_type = upstream_error_type(code.as_deref());
                self.emit(StreamEvent::error(error_type, message), out)?;
                self.outcome = SessionOutcome::UpstreamError;
                self.terminated = true;
                Ok(())
            }
        }
    }

    /// Flush a tool's pending arguments and close its block
    fn close_tool(&mut self, id: &str, out: &mut Vec<StreamEvent>) -> Result<()> {
        if self.aggregator.is_streaming(id) {
            let name = self
                .tools
                .get(id)
                .map(|tool| tool.name.clone())
                .unwrap_or_default();
            let outcome = self.aggregator.process(id, &name, &[], true);
            if !outcome.emitted.is_empty()
                && let Some(index) = self.tools.block_index(id)
            {
                self.emit(StreamEvent::input_json_delta(index, outcome.emitted), out)?;
            }
            if !outcome.arguments.trim().is_empty() {
                self.tools.update_arguments(id, outcome.parsed);
            }
        }
        let events = self.tools.complete(id, None);
        self.emit_all(events, out)
    }

    fn emit_all(&mut self, events: Vec<StreamEvent>, out: &mut Vec<StreamEvent>) -> Result<()> {
        for event in events {
            self.emit(event, out)?;
        }
        Ok(())
    }

    fn emit(&mut self, event: StreamEvent, out: &mut Vec<StreamEvent>) -> Result<()> {
        for accepted in self.guard.process(event)? {
            self.record(accepted, out);
        }
        Ok(())
    }

    fn record(&mut self, event: StreamEvent, out: &mut Vec<StreamEvent>) {
        self.usage.observe(&event);
        self.events_emitted += 1;
        out.push(event);
    }
}

fn upstream_error_type(code: Option<&str>) -> &'static str {
    match code {
        Some(c) if c.contains("Throttling") || c.contains("TooManyRequests") => {
            "rate_limit_error"
        }
        Some(c) if c.contains("ServiceUnavailable") || c.contains("Overloaded") => {
            "overloaded_error"
        }
        Some(c) if c.contains("Validation") => "invalid_request_error",
        Some(c) if c.contains("AccessDenied") => "permission_error",
        _ => "api_error",
    }
}

/// Drives sessions for the HTTP layer
#[derive(Clone)]
pub struct StreamOrchestrator {
    config: StreamConfig,
    stats: Arc<dyn StatsRecorder>,
}

impl StreamOrchestrator {
    pub fn new(config: StreamConfig, stats: Arc<dyn StatsRecorder>) -> Self {
        Self { config, stats }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Translate an upstream body into client events written to `sink`.
    ///
    /// Returns the session summary; a strict-mode protocol violation is
    /// returned as an error after an error event was written.
    pub async fn run_stream<S: EventSink>(
        &self,
        mut body: ByteStream,
        request: &RequestDescriptor,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary> {
        let mut session = StreamSession::new(request, &self.config);
        info!(
            message_id = session.message_id(),
            model = %request.model,
            "Starting response stream"
        );

        let events = match session.start() {
            Ok(events) => events,
            Err(e) => return self.abort(session, sink, e).await,
        };
        if !deliver(sink, events, cancel).await {
            return Ok(self.conclude(session, Some(SessionOutcome::Cancelled)));
        }

        let mut failures: u32 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Request cancelled, stopping upstream read");
                    return Ok(self.conclude(session, Some(SessionOutcome::Cancelled)));
                }
                next = body.next() => next,
            };

            match next {
                None => break,
                Some(Ok(chunk)) => {
                    failures = 0;
                    let events = match session.ingest(&chunk) {
                        Ok(events) => events,
                        Err(e) => return self.abort(session, sink, e).await,
                    };
                    if !deliver(sink, events, cancel).await {
                        return Ok(self.conclude(session, Some(SessionOutcome::Cancelled)));
                    }
                    if session.is_done() {
                        break;
                    }
                }
                Some(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(error = %e, "Upstream closed the body");
                    break;
                }
                Some(Err(e)) => {
                    failures += 1;
                    if failures > self.config.max_read_retries {
                        error!(error = %e, attempts = failures, "Upstream read failed, giving up");
                        let events = session.fail(&ProxyError::TransportError(e.to_string()));
                        deliver(sink, events, cancel).await;
                        return Ok(self.conclude(session, None));
                    }

                    let backoff = self.config.retry_backoff() * failures;
                    warn!(
                        error = %e,
                        attempt = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Upstream read failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Request cancelled during retry backoff");
                            return Ok(self.conclude(session, Some(SessionOutcome::Cancelled)));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        let events = match session.finish() {
            Ok(events) => events,
            Err(e) => return self.abort(session, sink, e).await,
        };
        deliver(sink, events, cancel).await;
        Ok(self.conclude(session, None))
    }

    /// Run the pipeline over a fully buffered body and assemble one message.
    ///
    /// Parsing runs on the blocking pool under the configured timeout; a
    /// panic there surfaces as [`ProxyError::InternalError`].
    pub async fn collect_response(
        &self,
        body: Bytes,
        request: &RequestDescriptor,
        cancel: &CancellationToken,
    ) -> Result<MessageResponse> {
        let config = self.config.clone();
        let descriptor = request.clone();
        let response = run_bounded(
            move || assemble(&body, &descriptor, &config),
            self.config.non_stream_timeout(),
            cancel,
        )
        .await?;

        self.stats.record(
            response.usage.input_tokens,
            response.usage.output_tokens,
            &request.model,
        );
        Ok(response)
    }

    async fn abort<S: EventSink>(
        &self,
        session: StreamSession,
        sink: &mut S,
        err: ProxyError,
    ) -> Result<StreamSummary> {
        error!(error = %err, "Aborting response stream");
        let event = StreamEvent::error(err.error_type(), err.to_string());
        if let Err(e) = sink.send(&event).await {
            debug!(error = %e, "Could not deliver abort event");
        }
        self.conclude(session, Some(SessionOutcome::ProtocolError));
        Err(err)
    }

    fn conclude(&self, session: StreamSession, outcome: Option<SessionOutcome>) -> StreamSummary {
        let summary = session.release(outcome);
        self.stats.record(
            summary.usage.input_tokens,
            summary.usage.output_tokens,
            &summary.model,
        );
        info!(
            message_id = %summary.message_id,
            outcome = ?summary.outcome,
            stop_reason = summary.stop_reason.map(|r| r.as_str()).unwrap_or("none"),
            input_tokens = summary.usage.input_tokens,
            output_tokens = summary.usage.output_tokens,
            bytes = summary.bytes_read,
            events = summary.events_emitted,
            tools = summary.tools,
            "Response stream finished"
        );
        summary
    }
}

/// Write events in order; false once the client is gone
async fn deliver<S: EventSink>(
    sink: &mut S,
    events: Vec<StreamEvent>,
    cancel: &CancellationToken,
) -> bool {
    for event in events {
        if let Err(e) = sink.send(&event).await {
            warn!(error = %e, event = event.event_name(), "Client write failed, cancelling");
            cancel.cancel();
            return false;
        }
    }
    true
}

/// Run parse work on the blocking pool under `timeout`
async fn run_bounded<T, F>(work: F, timeout: Duration, cancel: &CancellationToken) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);

    let joined = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
        joined = tokio::time::timeout(timeout, task) => joined,
    };

    match joined {
        Err(_) => {
            error!(timeout_ms = timeout.as_millis() as u64, "Response parsing timed out");
            Err(ProxyError::ParseTimeout(timeout.as_secs()))
        }
        Ok(Err(e)) => {
            error!(error = %e, "Response parsing task failed");
            Err(ProxyError::InternalError(format!(
                "response parsing failed: {}",
                e
            )))
        }
        Ok(Ok(result)) => result,
    }
}

/// Synchronous non-streaming pipeline
fn assemble(
    body: &[u8],
    request: &RequestDescriptor,
    config: &StreamConfig,
) -> Result<MessageResponse> {
    let mut session = StreamSession::new(request, config);
    let mut content = ContentBlockManager::new();

    let mut events = session.start()?;
    events.extend(session.ingest(body)?);
    events.extend(session.finish()?);
    for event in &events {
        content.apply(event);
    }

    let summary = session.release(None);
    if summary.outcome == SessionOutcome::UpstreamError {
        let message = content
            .error()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "upstream error".to_string());
        return Err(ProxyError::UpstreamError {
            status: 502,
            message,
        });
    }

    debug!(
        message_id = %summary.message_id,
        blocks = content.len(),
        "Assembled non-streaming response"
    );
    Ok(content.into_response())
}

/// Read a whole body into memory, honouring cancellation
pub async fn buffer_body(mut body: ByteStream, cancel: &CancellationToken) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            next = body.next() => next,
        };
        match next {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Some(Err(e)) => return Err(ProxyError::TransportError(e.to_string())),
            None => break,
        }
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::frame::{encode_error, encode_event};
    use serde_json::json;

    fn request() -> RequestDescriptor {
        RequestDescriptor {
            model: "claude-sonnet-4-5".to_string(),
            stream: true,
            input_tokens: 10,
        }
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    #[test]
    fn test_text_session() {
        let mut session = StreamSession::new(&request(), &StreamConfig::default());
        let mut events = session.start().unwrap();
        events.extend(
            session
                .ingest(&encode_event(
                    "assistantResponseEvent",
                    &json!({"content": "hello", "stop": false}),
                ))
                .unwrap(),
        );
        events.extend(session.finish().unwrap());

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        let summary = session.release(None);
        assert_eq!(summary.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(summary.usage.output_tokens, 1);
        assert_eq!(summary.outcome, SessionOutcome::Completed);
    }

    #[test]
    fn test_fragmented_tool_use() {
        let mut session = StreamSession::new(&request(), &StreamConfig::default());
        session.start().unwrap();
        let mut events = Vec::new();
        for (input, stop) in [(r#"{"pattern""#, false), (r#":"**/*.go""#, false), ("}", true)] {
            events.extend(
                session
                    .ingest(&encode_event(
                        "toolUseEvent",
                        &json!({"toolUseId": "t1", "name": "Glob", "input": input, "stop": stop}),
                    ))
                    .unwrap(),
            );
        }

        // lead text block opened for the intro, then closed by the tool start
        assert_eq!(
            names(&events[..4]),
            vec![
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start"
            ]
        );
        assert_eq!(events[1], StreamEvent::text_delta(0, ""));
        assert_eq!(events[3], StreamEvent::tool_use_start(1, "t1", "Glob"));
        assert_eq!(events.last(), Some(&StreamEvent::ContentBlockStop { index: 1 }));
        let args: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: crate::models::claude::Delta::InputJsonDelta { partial_json },
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(args, r#"{"pattern":"**/*.go"}"#);

        let end = session.finish().unwrap();
        assert_eq!(names(&end), vec!["message_delta", "message_stop"]);
        assert_eq!(session.release(None).stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn test_content_length_maps_to_max_tokens() {
        let mut session = StreamSession::new(&request(), &StreamConfig::default());
        session.start().unwrap();
        session
            .ingest(&encode_event(
                "assistantResponseEvent",
                &json!({"content": "partial"}),
            ))
            .unwrap();
        let events = session
            .ingest(&encode_error(
                "exception",
                "ContentLengthExceededException",
                &json!({"message": "too long"}),
            ))
            .unwrap();
        assert!(events.is_empty());
        assert!(session.is_done());

        let end = session.finish().unwrap();
        assert_eq!(
            names(&end),
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
        assert_eq!(session.release(None).stop_reason, Some(StopReason::MaxTokens));
    }

    #[test]
    fn test_upstream_error_ends_without_terminal_delta() {
        let mut session = StreamSession::new(&request(), &StreamConfig::default());
        session.start().unwrap();
        session
            .ingest(&encode_event("assistantResponseEvent", &json!({"content": "a"})))
            .unwrap();
        let events = session
            .ingest(&encode_error(
                "exception",
                "ThrottlingException",
                &json!({"message": "slow down"}),
            ))
            .unwrap();
        assert_eq!(names(&events), vec!["content_block_stop", "error"]);
        assert!(session.is_terminated());
        match &events[1] {
            StreamEvent::Error { error } => assert_eq!(error.error_type, "rate_limit_error"),
            other => panic!("Expected error, got {:?}", other),
        }
        assert!(session.finish().unwrap().is_empty());
        assert_eq!(session.release(None).outcome, SessionOutcome::UpstreamError);
    }

    #[test]
    fn test_fail_emits_error_then_terminal_events() {
        let mut session = StreamSession::new(&request(), &StreamConfig::default());
        session.start().unwrap();
        session
            .ingest(&encode_event(
                "toolCallRequest",
                &json!({"toolCallId": "c1", "name": "x", "arguments": {}}),
            ))
            .unwrap();
        let events = session.fail(&ProxyError::TransportError("reset".into()));
        assert_eq!(
            names(&events),
            vec!["content_block_stop", "error", "message_delta", "message_stop"]
        );
        assert_eq!(session.release(None).outcome, SessionOutcome::ReadFailed);
    }

    #[test]
    fn test_late_text_for_closed_lead_block_dropped() {
        let mut session = StreamSession::new(&request(), &StreamConfig::default());
        session.start().unwrap();
        session
            .ingest(&encode_event("assistantResponseEvent", &json!({"content": "a"})))
            .unwrap();
        session
            .ingest(&encode_event(
                "toolCallRequest",
                &json!({"toolCallId": "c1", "name": "x", "arguments": {}}),
            ))
            .unwrap();
        let events = session
            .ingest(&encode_event("assistantResponseEvent", &json!({"content": "late"})))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(session.release(None).violations, 0);
    }

    #[test]
    fn test_tool_error_discards_partial_arguments() {
        let mut session = StreamSession::new(&request(), &StreamConfig::default());
        session.start().unwrap();
        session
            .ingest(&encode_event(
                "toolUseEvent",
                &json!({"toolUseId": "t1", "name": "Bash", "input": "{\"cmd\":", "stop": false}),
            ))
            .unwrap();
        assert!(session.aggregator.is_streaming("t1"));

        let events = session
            .ingest(&encode_event(
                "toolCallError",
                &json!({"toolCallId": "t1", "error": "sandbox refused"}),
            ))
            .unwrap();
        assert_eq!(names(&events), vec!["error", "content_block_stop"]);
        assert!(!session.aggregator.is_streaming("t1"));
        assert_eq!(session.aggregator.active_count(), 0);

        let events = session.finish().unwrap();
        assert!(!names(&events).contains(&"content_block_delta"));
    }

    #[test]
    fn test_tool_fragments_split_inside_character() {
        let headers = crate::streaming::headers::Headers::new()
            .with_str(crate::streaming::headers::MESSAGE_TYPE, "event")
            .with_str(crate::streaming::headers::EVENT_TYPE, "toolUseEvent");
        let mut session = StreamSession::new(&request(), &StreamConfig::default());
        session.start().unwrap();
        for payload in [
            &b"{\"toolUseId\":\"t1\",\"name\":\"geo\",\"input\":\"{\\\"city\\\":\\\"Z\xC3\",\"stop\":false}"[..],
            &b"{\"toolUseId\":\"t1\",\"name\":\"geo\",\"input\":\"\xBCrich\\\"}\",\"stop\":true}"[..],
        ] {
            session
                .ingest(&crate::streaming::frame::encode_message(&headers, payload))
                .unwrap();
        }

        let tool = session.tools.get("t1").unwrap();
        assert_eq!(tool.arguments, json!({"city": "Zürich"}));
        assert_eq!(session.aggregator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_bounded_parse_times_out() {
        let result = run_bounded(
            || {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            },
            Duration::from_millis(20),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ProxyError::ParseTimeout(0))));
    }

    #[tokio::test]
    async fn test_bounded_parse_panic_is_internal_error() {
        let result: Result<()> = run_bounded(
            || panic!("parser exploded"),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await;
        match result {
            Err(ProxyError::InternalError(message)) => {
                assert!(message.starts_with("response parsing failed"))
            }
            other => panic!("Expected internal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bounded_parse_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_bounded(|| Ok(1), Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(ProxyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_collect_response_assembles_message() {
        let orchestrator = StreamOrchestrator::new(
            StreamConfig::default(),
            Arc::new(crate::metrics::UsageStats::new()),
        );
        let body = encode_event("assistantResponseEvent", &json!({"content": "hi"}));
        let response = orchestrator
            .collect_response(body, &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.content.len(), 1);
    }

    #[test]
    fn test_upstream_error_type_mapping() {
        assert_eq!(upstream_error_type(Some("ThrottlingException")), "rate_limit_error");
        assert_eq!(upstream_error_type(Some("ValidationException")), "invalid_request_error");
        assert_eq!(upstream_error_type(None), "api_error");
    }
}
