//! Canonical streaming events and the normalizer that produces them.
//!
//! Adapters yield [`ProviderChunk`]s in whatever granularity their upstream
//! offers; [`normalize`] turns that sequence into ordered [`StreamEvent`]s
//! with exactly one terminal event.

pub mod sse;

use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::ProviderError;
use crate::core::types::{FinishReason, ToolCall, Usage, Warning};
use crate::warnings::WarningCollector;

/// Adapter-side incremental output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChunk {
    TextDelta(String),
    /// Ends the current assistant turn-segment; later text opens a new span.
    SegmentEnd,
    ToolCall(ToolCall),
    Usage(Usage),
    Finish(FinishReason),
    Warning(Warning),
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderChunk, ProviderError>> + Send>>;

pub type CanonicalStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        text: String,
    },
    TextEnd {
        id: String,
    },
    ToolCall {
        tool_call: ToolCall,
    },
    Finish {
        reason: FinishReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<Warning>,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextStart { .. } => "text_start",
            Self::TextDelta { .. } => "text_delta",
            Self::TextEnd { .. } => "text_end",
            Self::ToolCall { .. } => "tool_call",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }
}

/// Incremental state machine behind [`normalize`].
///
/// Every method returns the events to emit for its input. Once a terminal
/// event has been produced all further input yields nothing.
#[derive(Debug, Default)]
pub struct StreamNormalizer {
    next_span: usize,
    open_span: Option<String>,
    saw_tool_call: bool,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    warnings: WarningCollector,
    terminated: bool,
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with warnings recorded before the stream opened.
    pub fn with_warnings(warnings: WarningCollector) -> Self {
        Self {
            warnings,
            ..Self::default()
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn push(&mut self, chunk: ProviderChunk) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }

        let mut events = Vec::new();
        match chunk {
            ProviderChunk::TextDelta(text) => {
                if text.is_empty() {
                    return events;
                }
                let id = match &self.open_span {
                    Some(id) => id.clone(),
                    None => {
                        let id = format!("text-{}", self.next_span);
                        self.next_span += 1;
                        self.open_span = Some(id.clone());
                        events.push(StreamEvent::TextStart { id: id.clone() });
                        id
                    }
                };
                events.push(StreamEvent::TextDelta { id, text });
            }
            ProviderChunk::SegmentEnd => self.close_span(&mut events),
            ProviderChunk::ToolCall(tool_call) => {
                self.close_span(&mut events);
                self.saw_tool_call = true;
                events.push(StreamEvent::ToolCall { tool_call });
            }
            ProviderChunk::Usage(usage) => match &mut self.usage {
                Some(existing) => existing.merge(&usage),
                None => self.usage = Some(usage),
            },
            ProviderChunk::Finish(reason) => self.finish_reason = Some(reason),
            ProviderChunk::Warning(warning) => self.warnings.push(warning),
        }
        events
    }

    /// Clean end of the upstream sequence: closes the open span and emits
    /// `Finish` with the accumulated usage.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.close_span(&mut events);

        let reason = self.finish_reason.unwrap_or(if self.saw_tool_call {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });
        events.push(StreamEvent::Finish {
            reason,
            usage: self.usage.take(),
            warnings: self.warnings.drain(),
        });
        self.terminated = true;
        events
    }

    /// Upstream failure: emits a single `Error` and leaves any open span
    /// unterminated, so already-relayed deltas stay as they were sent.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }

        self.terminated = true;
        vec![StreamEvent::Error {
            message: message.into(),
        }]
    }

    fn close_span(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(id) = self.open_span.take() {
            events.push(StreamEvent::TextEnd { id });
        }
    }
}

/// Converts an adapter stream into the canonical event stream.
///
/// Cancellation ends the stream immediately without a terminal event.
pub fn normalize(
    inner: ProviderStream,
    cancel: CancellationToken,
    warnings: WarningCollector,
) -> CanonicalStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        let mut normalizer = StreamNormalizer::with_warnings(warnings);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = inner.next() => Some(item),
            };

            let Some(next) = next else {
                debug!("stream canceled before completion");
                break;
            };

            let events = match next {
                Some(Ok(chunk)) => normalizer.push(chunk),
                Some(Err(error)) => {
                    warn!(%error, "upstream stream failed");
                    normalizer.fail(error.to_string())
                }
                None => normalizer.finish(),
            };

            for event in events {
                yield event;
            }

            if normalizer.is_terminated() {
                break;
            }
        }
    })
}

/// Full result of a provider without native incremental output.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedText {
    /// Logical chunks, emitted as one delta each.
    pub segments: Vec<String>,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

impl CompletedText {
    pub fn whole(text: impl Into<String>) -> Self {
        Self {
            segments: vec![text.into()],
            finish_reason: FinishReason::Stop,
            usage: None,
        }
    }
}

/// Emulates streaming for a result that was computed in one piece.
///
/// Empty segments are dropped the same way empty upstream deltas are, so an
/// empty result produces no text span and only the terminal `Finish`.
pub fn synthesize(completed: CompletedText) -> ProviderStream {
    let mut chunks = completed
        .segments
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .map(ProviderChunk::TextDelta)
        .collect::<Vec<_>>();
    if let Some(usage) = completed.usage {
        chunks.push(ProviderChunk::Usage(usage));
    }
    chunks.push(ProviderChunk::Finish(completed.finish_reason));

    Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
}
