//! Server-Sent-Events framing on both sides of the gateway.

use std::fmt;

use eventsource_stream::{Event, Eventsource};
use futures::{Stream, StreamExt};

use crate::core::error::ProviderError;
use crate::streaming::{ProviderChunk, ProviderStream, StreamEvent};

const DONE_SENTINEL: &str = "[DONE]";

/// Encodes one canonical event as an SSE frame ready to relay to a client.
pub fn encode_frame(event: &StreamEvent) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(event)?;
    Ok(format!("event: {}\ndata: {data}\n\n", event.event_type()))
}

/// Stateful per-event decoder for an upstream SSE body.
pub trait EventDecoder: Send + 'static {
    fn decode(&mut self, event: &Event) -> Result<Vec<ProviderChunk>, ProviderError>;

    /// Runs once when the upstream ends cleanly, at `[DONE]` or end of body.
    /// Not called after an error.
    fn finish(&mut self) -> Vec<ProviderChunk> {
        Vec::new()
    }
}

struct FnDecoder<F>(F);

impl<F> EventDecoder for FnDecoder<F>
where
    F: FnMut(&Event) -> Result<Vec<ProviderChunk>, ProviderError> + Send + 'static,
{
    fn decode(&mut self, event: &Event) -> Result<Vec<ProviderChunk>, ProviderError> {
        (self.0)(event)
    }
}

/// Decodes an upstream `text/event-stream` response into adapter chunks.
pub fn decode_response<F>(provider: &str, response: reqwest::Response, decode: F) -> ProviderStream
where
    F: FnMut(&Event) -> Result<Vec<ProviderChunk>, ProviderError> + Send + 'static,
{
    decode_byte_stream(provider, response.bytes_stream(), decode)
}

/// Like [`decode_response`], for decoders that hold output back until the
/// stream ends.
pub fn decode_response_with<D>(
    provider: &str,
    response: reqwest::Response,
    decoder: D,
) -> ProviderStream
where
    D: EventDecoder,
{
    decode_byte_stream_with(provider, response.bytes_stream(), decoder)
}

/// Decodes any SSE byte stream. Blank events are skipped and `[DONE]` ends
/// the stream; the first decode or transport error is yielded and ends it.
pub fn decode_byte_stream<S, B, E, F>(provider: &str, bytes: S, decode: F) -> ProviderStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
    F: FnMut(&Event) -> Result<Vec<ProviderChunk>, ProviderError> + Send + 'static,
{
    decode_byte_stream_with(provider, bytes, FnDecoder(decode))
}

pub fn decode_byte_stream_with<S, B, E, D>(
    provider: &str,
    bytes: S,
    mut decoder: D,
) -> ProviderStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
    D: EventDecoder,
{
    let provider = provider.to_string();
    let mut events = Box::pin(bytes.eventsource());

    Box::pin(async_stream::stream! {
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    yield Err(ProviderError::Transport {
                        provider: provider.clone(),
                        request_id: None,
                        message: format!("event stream error: {error}"),
                    });
                    return;
                }
            };

            let data = event.data.trim();
            if data == DONE_SENTINEL {
                break;
            }
            if data.is_empty() {
                continue;
            }

            match decoder.decode(&event) {
                Ok(chunks) => {
                    for chunk in chunks {
                        yield Ok(chunk);
                    }
                }
                Err(error) => {
                    yield Err(error);
                    return;
                }
            }
        }

        for chunk in decoder.finish() {
            yield Ok(chunk);
        }
    })
}
