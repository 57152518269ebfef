use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::core::error::ProviderError;
use crate::core::types::{
    ChatRequest, ContentPart, FinishReason, GeneratedImage, ImageRequest, ImageResponse, Message,
    MessageRole, RealtimeToken, RealtimeTokenRequest, ResponseFormat, SpeechRequest,
    StructuredRequest, StructuredResponse, ToolCall, ToolDefinition, TranscriptSegment,
    TranscriptionResponse, Usage, Warning, WarningKind,
};
use crate::media::MediaReference;
use crate::streaming::ProviderChunk;
use crate::warnings::WarningCollector;

const DEFAULT_VOICE: &str = "alloy";
const DEFAULT_SPEECH_FORMAT: &str = "mp3";

/// Provider key and upstream model, carried into every error.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Target<'a> {
    pub provider: &'a str,
    pub model: &'a str,
}

impl Target<'_> {
    pub fn error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::protocol(self.provider, Some(self.model), message)
    }
}

pub(crate) fn encode_chat_request(
    req: &ChatRequest,
    target: Target<'_>,
    warnings: &mut WarningCollector,
) -> Result<Value, ProviderError> {
    if req.messages.is_empty() {
        return Err(target.error("chat request requires at least one message"));
    }
    validate_temperature(req.temperature, target)?;

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(target.model.to_string()));
    body.insert(
        "messages".to_string(),
        Value::Array(map_chat_messages(&req.messages, target)?),
    );
    body.insert("stream".to_string(), Value::Bool(true));
    body.insert("stream_options".to_string(), json!({"include_usage": true}));

    if !req.tools.is_empty() {
        let tools = req
            .tools
            .iter()
            .map(|tool| map_chat_tool(tool, target))
            .collect::<Result<Vec<_>, _>>()?;
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(temperature) = req.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_output_tokens) = req.max_output_tokens {
        body.insert("max_tokens".to_string(), json!(max_output_tokens));
    }
    if !req.stop.is_empty() {
        if req.stop.len() > 4 {
            warnings.ignored(
                "stop",
                format!("only the first 4 of {} stop sequences are sent", req.stop.len()),
            );
        }
        body.insert("stop".to_string(), json!(req.stop.iter().take(4).collect::<Vec<_>>()));
    }
    if !req.metadata.is_empty() {
        warnings.ignored("metadata", "chat completions are not stored upstream");
    }

    Ok(Value::Object(body))
}

fn map_chat_messages(
    messages: &[Message],
    target: Target<'_>,
) -> Result<Vec<Value>, ProviderError> {
    let mut mapped = Vec::new();

    for message in messages {
        let mut content = Vec::new();
        let mut tool_calls = Vec::new();

        for part in &message.content {
            match part {
                ContentPart::Text { text } => content.push(json!({"type": "text", "text": text})),
                ContentPart::Image { image } => {
                    if message.role != MessageRole::User {
                        return Err(target.error("image content is only allowed in user messages"));
                    }
                    content.push(json!({
                        "type": "image_url",
                        "image_url": {"url": media_url(image)},
                    }));
                }
                ContentPart::ToolCall { tool_call } => {
                    if message.role != MessageRole::Assistant {
                        return Err(
                            target.error("tool calls are only allowed in assistant messages")
                        );
                    }
                    tool_calls.push(json!({
                        "id": tool_call.id,
                        "type": "function",
                        "function": {
                            "name": tool_call.name,
                            "arguments": tool_call.arguments_json.to_string(),
                        },
                    }));
                }
                ContentPart::ToolResult {
                    tool_call_id,
                    content: output,
                } => {
                    mapped.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_call_id,
                        "content": output,
                    }));
                }
            }
        }

        if content.is_empty() && tool_calls.is_empty() {
            continue;
        }

        let mut item = Map::new();
        item.insert(
            "role".to_string(),
            Value::String(message.role.as_str().to_string()),
        );
        let text_only = content
            .iter()
            .all(|part| part.get("type").and_then(Value::as_str) == Some("text"));
        if text_only {
            item.insert(
                "content".to_string(),
                Value::String(message.text_content()),
            );
        } else {
            item.insert("content".to_string(), Value::Array(content));
        }
        if !tool_calls.is_empty() {
            item.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        mapped.push(Value::Object(item));
    }

    Ok(mapped)
}

fn map_chat_tool(tool: &ToolDefinition, target: Target<'_>) -> Result<Value, ProviderError> {
    validate_tool(tool, target)?;

    let mut function = Map::new();
    function.insert("name".to_string(), Value::String(tool.name.clone()));
    if let Some(description) = &tool.description {
        function.insert(
            "description".to_string(),
            Value::String(description.clone()),
        );
    }
    function.insert("parameters".to_string(), tool.parameters_schema.clone());

    Ok(json!({"type": "function", "function": Value::Object(function)}))
}

/// Tool call fragments accumulated across chat completion chunks.
#[derive(Debug, Default)]
pub(crate) struct ChatStreamState {
    pending_tool_calls: BTreeMap<u64, PendingToolCall>,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Decodes one `chat.completion.chunk` event.
pub(crate) fn decode_chat_stream_event(
    data: &str,
    state: &mut ChatStreamState,
    target: Target<'_>,
) -> Result<Vec<ProviderChunk>, ProviderError> {
    let payload = serde_json::from_str::<Value>(data)
        .map_err(|error| target.error(format!("invalid stream chunk: {error}")))?;
    if let Some(message) = error_message(&payload) {
        return Err(target.error(message));
    }

    let mut chunks = Vec::new();
    let choice = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first());

    if let Some(choice) = choice {
        let delta = choice.get("delta");

        if let Some(text) = delta
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
        {
            chunks.push(ProviderChunk::TextDelta(text.to_string()));
        }

        for fragment in delta
            .and_then(|delta| delta.get("tool_calls"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
            let pending = state.pending_tool_calls.entry(index).or_default();
            if let Some(id) = fragment.get("id").and_then(Value::as_str) {
                pending.id = id.to_string();
            }
            let function = fragment.get("function");
            if let Some(name) = function
                .and_then(|function| function.get("name"))
                .and_then(Value::as_str)
            {
                pending.name.push_str(name);
            }
            if let Some(arguments) = function
                .and_then(|function| function.get("arguments"))
                .and_then(Value::as_str)
            {
                pending.arguments.push_str(arguments);
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            flush_tool_calls(state, &mut chunks);
            chunks.push(ProviderChunk::Finish(map_chat_finish_reason(reason)));
        }
    }

    if let Some(usage) = payload.get("usage").filter(|usage| usage.is_object()) {
        flush_tool_calls(state, &mut chunks);
        chunks.push(ProviderChunk::Usage(decode_usage(
            usage,
            "prompt_tokens",
            "completion_tokens",
        )));
    }

    Ok(chunks)
}

/// Releases tool calls still pending when the upstream ends without a
/// finish reason or usage frame.
pub(crate) fn finish_chat_stream(state: &mut ChatStreamState) -> Vec<ProviderChunk> {
    let mut chunks = Vec::new();
    flush_tool_calls(state, &mut chunks);
    chunks
}

fn flush_tool_calls(state: &mut ChatStreamState, chunks: &mut Vec<ProviderChunk>) {
    for (_, pending) in std::mem::take(&mut state.pending_tool_calls) {
        let (arguments_json, warning) = parse_tool_arguments(&pending.name, &pending.arguments);
        if let Some(warning) = warning {
            chunks.push(ProviderChunk::Warning(warning));
        }
        chunks.push(ProviderChunk::ToolCall(ToolCall {
            id: pending.id,
            name: pending.name,
            arguments_json,
        }));
    }
}

fn parse_tool_arguments(name: &str, raw: &str) -> (Value, Option<Warning>) {
    if raw.trim().is_empty() {
        return (json!({}), None);
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => (value, None),
        Err(_) => (
            Value::String(raw.to_string()),
            Some(Warning {
                kind: WarningKind::ProviderResponseMissingField,
                feature: "tool_call.arguments".to_string(),
                detail: Some(format!(
                    "arguments for tool {name:?} were not valid JSON; passed through as a string"
                )),
            }),
        ),
    }
}

fn map_chat_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Other,
    }
}

pub(crate) fn encode_image_request(
    req: &ImageRequest,
    target: Target<'_>,
    warnings: &mut WarningCollector,
) -> Result<Value, ProviderError> {
    if req.prompt.trim().is_empty() {
        return Err(target.error("image prompt must not be empty"));
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(target.model.to_string()));
    body.insert("prompt".to_string(), Value::String(req.prompt.clone()));
    body.insert("response_format".to_string(), json!("b64_json"));
    if let Some(n) = req.n {
        body.insert("n".to_string(), json!(n));
    }

    match (&req.size, &req.aspect_ratio) {
        (Some(size), aspect_ratio) => {
            body.insert("size".to_string(), Value::String(size.clone()));
            if aspect_ratio.is_some() {
                warnings.ignored("aspect_ratio", "size takes precedence");
            }
        }
        (None, Some(aspect_ratio)) => match size_for_aspect_ratio(aspect_ratio) {
            Some(size) => {
                body.insert("size".to_string(), json!(size));
            }
            None => warnings.unsupported(
                "aspect_ratio",
                format!("no supported size for aspect ratio {aspect_ratio}"),
            ),
        },
        (None, None) => {}
    }

    if req.negative_prompt.is_some() {
        warnings.unsupported("negative_prompt", "not accepted by the images endpoint");
    }
    if req.seed.is_some() {
        warnings.unsupported("seed", "not accepted by the images endpoint");
    }
    if !req.input_images.is_empty() {
        warnings.unsupported("input_images", "image edits are not routed through this call");
    }

    Ok(Value::Object(body))
}

fn size_for_aspect_ratio(aspect_ratio: &str) -> Option<&'static str> {
    match aspect_ratio.trim() {
        "1:1" => Some("1024x1024"),
        "16:9" | "7:4" => Some("1792x1024"),
        "9:16" | "4:7" => Some("1024x1792"),
        _ => None,
    }
}

pub(crate) fn decode_image_response(
    body: Value,
    target: Target<'_>,
) -> Result<ImageResponse, ProviderError> {
    if let Some(message) = error_message(&body) {
        return Err(target.error(message));
    }

    let entries = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| target.error("image response missing data array"))?;

    let mut images = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if let Some(data) = entry.get("b64_json").and_then(Value::as_str) {
            images.push(GeneratedImage::Base64 {
                media_type: "image/png".to_string(),
                data: data.to_string(),
            });
        } else if let Some(url) = entry.get("url").and_then(Value::as_str) {
            images.push(GeneratedImage::Url {
                url: url.to_string(),
            });
        } else {
            return Err(target.error(format!(
                "image entry {index} has neither b64_json nor url"
            )));
        }
    }

    Ok(ImageResponse {
        images,
        provider: target.provider.to_string(),
        model: target.model.to_string(),
        raw_provider_response: None,
        warnings: Vec::new(),
    })
}

pub(crate) fn encode_speech_request(
    req: &SpeechRequest,
    target: Target<'_>,
) -> Result<Value, ProviderError> {
    if req.input.trim().is_empty() {
        return Err(target.error("speech input must not be empty"));
    }
    if let Some(speed) = req.speed
        && !(0.25..=4.0).contains(&speed)
    {
        return Err(target.error(format!("speed must be in [0.25, 4.0], got {speed}")));
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(target.model.to_string()));
    body.insert("input".to_string(), Value::String(req.input.clone()));
    body.insert(
        "voice".to_string(),
        json!(req.voice.as_deref().unwrap_or(DEFAULT_VOICE)),
    );
    body.insert(
        "response_format".to_string(),
        json!(speech_format(req)),
    );
    if let Some(speed) = req.speed {
        body.insert("speed".to_string(), json!(speed));
    }

    Ok(Value::Object(body))
}

pub(crate) fn speech_format(req: &SpeechRequest) -> &str {
    req.format.as_deref().unwrap_or(DEFAULT_SPEECH_FORMAT)
}

/// Media type for synthesized audio; a specific `Content-Type` from the
/// upstream wins over the requested container.
pub(crate) fn speech_media_type(format: &str, content_type: Option<&str>) -> String {
    if let Some(content_type) = content_type
        .map(|value| value.split(';').next().unwrap_or(value).trim())
        .filter(|value| value.starts_with("audio/"))
    {
        return content_type.to_string();
    }

    match format {
        "mp3" => "audio/mpeg",
        "opus" => "audio/opus",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "pcm" => "audio/pcm",
        _ => "application/octet-stream",
    }
    .to_string()
}

pub(crate) fn decode_transcription_response(
    body: Value,
    target: Target<'_>,
    warnings: &mut WarningCollector,
) -> Result<TranscriptionResponse, ProviderError> {
    if let Some(message) = error_message(&body) {
        return Err(target.error(message));
    }

    let text = body
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| target.error("transcription response missing text"))?
        .to_string();

    let segments = body
        .get("segments")
        .and_then(Value::as_array)
        .map(|segments| {
            segments
                .iter()
                .filter_map(|segment| {
                    Some(TranscriptSegment {
                        start_seconds: segment.get("start")?.as_f64()?,
                        end_seconds: segment.get("end")?.as_f64()?,
                        text: segment.get("text")?.as_str()?.trim().to_string(),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let duration_seconds = body.get("duration").and_then(Value::as_f64);
    if duration_seconds.is_none() {
        warnings.missing_field("duration", "upstream did not report audio duration");
    }

    Ok(TranscriptionResponse {
        text,
        language: body
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string),
        duration_seconds,
        segments,
        provider: target.provider.to_string(),
        model: target.model.to_string(),
        warnings: Vec::new(),
    })
}

pub(crate) fn encode_realtime_session(
    req: &RealtimeTokenRequest,
    target: Target<'_>,
    warnings: &mut WarningCollector,
) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(target.model.to_string()));
    if let Some(voice) = &req.voice {
        body.insert("voice".to_string(), Value::String(voice.clone()));
    }
    if let Some(instructions) = &req.instructions {
        body.insert(
            "instructions".to_string(),
            Value::String(instructions.clone()),
        );
    }
    if req.expires_in_seconds.is_some() {
        warnings.ignored(
            "expires_in_seconds",
            "session token lifetime is fixed upstream",
        );
    }
    Value::Object(body)
}

pub(crate) fn decode_realtime_session(
    body: Value,
    target: Target<'_>,
) -> Result<RealtimeToken, ProviderError> {
    if let Some(message) = error_message(&body) {
        return Err(target.error(message));
    }

    let secret = body
        .get("client_secret")
        .ok_or_else(|| target.error("realtime session missing client_secret"))?;
    let token = secret
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| target.error("realtime session missing client_secret.value"))?;

    Ok(RealtimeToken {
        token: token.to_string(),
        expires_at: secret.get("expires_at").and_then(Value::as_u64),
        provider: target.provider.to_string(),
        model: target.model.to_string(),
        warnings: Vec::new(),
    })
}

pub(crate) fn encode_structured_request(
    req: &StructuredRequest,
    target: Target<'_>,
    stream: bool,
) -> Result<Value, ProviderError> {
    let input = map_response_input(&req.input, target)?;
    if input.is_empty() {
        return Err(target.error("structured request requires input"));
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(target.model.to_string()));
    body.insert("store".to_string(), Value::Bool(false));
    body.insert("input".to_string(), Value::Array(input));
    body.insert(
        "text".to_string(),
        json!({"format": map_response_format(&req.response_format, target)?}),
    );
    if let Some(instructions) = &req.instructions {
        body.insert(
            "instructions".to_string(),
            Value::String(instructions.clone()),
        );
    }
    if !req.tools.is_empty() {
        let tools = req
            .tools
            .iter()
            .map(|tool| {
                validate_tool(tool, target)?;
                let mut payload = Map::new();
                payload.insert("type".to_string(), json!("function"));
                payload.insert("name".to_string(), Value::String(tool.name.clone()));
                if let Some(description) = &tool.description {
                    payload.insert(
                        "description".to_string(),
                        Value::String(description.clone()),
                    );
                }
                payload.insert("parameters".to_string(), tool.parameters_schema.clone());
                Ok(Value::Object(payload))
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(max_output_tokens) = req.max_output_tokens {
        body.insert("max_output_tokens".to_string(), json!(max_output_tokens));
    }
    if stream {
        body.insert("stream".to_string(), Value::Bool(true));
    }

    Ok(Value::Object(body))
}

fn map_response_input(
    messages: &[Message],
    target: Target<'_>,
) -> Result<Vec<Value>, ProviderError> {
    let mut items = Vec::new();

    for message in messages {
        let text_type = if message.role == MessageRole::Assistant {
            "output_text"
        } else {
            "input_text"
        };
        let mut parts = Vec::new();

        for part in &message.content {
            match part {
                ContentPart::Text { text } => parts.push(json!({"type": text_type, "text": text})),
                ContentPart::Image { image } => {
                    if message.role != MessageRole::User {
                        return Err(target.error("image content is only allowed in user messages"));
                    }
                    parts.push(json!({"type": "input_image", "image_url": media_url(image)}));
                }
                ContentPart::ToolCall { tool_call } => items.push(json!({
                    "type": "function_call",
                    "call_id": tool_call.id,
                    "name": tool_call.name,
                    "arguments": tool_call.arguments_json.to_string(),
                })),
                ContentPart::ToolResult {
                    tool_call_id,
                    content,
                } => items.push(json!({
                    "type": "function_call_output",
                    "call_id": tool_call_id,
                    "output": content,
                })),
            }
        }

        if !parts.is_empty() {
            items.push(json!({"role": message.role.as_str(), "content": parts}));
        }
    }

    Ok(items)
}

fn map_response_format(
    format: &ResponseFormat,
    target: Target<'_>,
) -> Result<Value, ProviderError> {
    match format {
        ResponseFormat::Text => Ok(json!({"type": "text"})),
        ResponseFormat::JsonObject => Ok(json!({"type": "json_object"})),
        ResponseFormat::JsonSchema { name, schema } => {
            if name.trim().is_empty() {
                return Err(target.error("json_schema response format requires a non-empty name"));
            }
            Ok(json!({
                "type": "json_schema",
                "name": name,
                "schema": schema,
                "strict": true,
            }))
        }
    }
}

pub(crate) fn decode_structured_response(
    body: Value,
    requested_format: &ResponseFormat,
    target: Target<'_>,
    warnings: &mut WarningCollector,
) -> Result<StructuredResponse, ProviderError> {
    if let Some(message) = error_message(&body) {
        return Err(target.error(message));
    }

    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| target.error("response missing status"))?;
    if status == "failed" {
        return Err(target.error("response status is failed"));
    }

    let mut output = Vec::new();
    for item in body
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        decode_output_item(item, &mut output, warnings);
    }

    let usage = match body.get("usage") {
        Some(usage) if usage.is_object() => {
            decode_usage(usage, "input_tokens", "output_tokens")
        }
        _ => {
            warnings.missing_field("usage", "response did not report token usage");
            Usage::default()
        }
    };

    let has_tool_calls = output
        .iter()
        .any(|part| matches!(part, ContentPart::ToolCall { .. }));
    let finish_reason = map_response_status(&body, status, has_tool_calls);
    let structured_output = decode_structured_output(requested_format, &output, warnings);

    Ok(StructuredResponse {
        id: body
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        output,
        structured_output,
        usage,
        finish_reason,
        provider: target.provider.to_string(),
        model: target.model.to_string(),
        warnings: Vec::new(),
    })
}

fn decode_output_item(
    item: &Value,
    output: &mut Vec<ContentPart>,
    warnings: &mut WarningCollector,
) {
    match item.get("type").and_then(Value::as_str) {
        Some("message") => {
            for part in item
                .get("content")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                match part.get("type").and_then(Value::as_str) {
                    Some("output_text") => {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            output.push(ContentPart::Text {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("refusal") => warnings.missing_field(
                        "output",
                        "model refused; refusal text omitted from output",
                    ),
                    _ => {}
                }
            }
        }
        Some("function_call") => {
            if let Some(tool_call) = decode_function_call(item, warnings) {
                output.push(ContentPart::ToolCall { tool_call });
            }
        }
        _ => {}
    }
}

fn decode_function_call(item: &Value, warnings: &mut WarningCollector) -> Option<ToolCall> {
    let name = item.get("name").and_then(Value::as_str)?;
    let id = item
        .get("call_id")
        .or_else(|| item.get("id"))
        .and_then(Value::as_str)?;
    let raw_arguments = item
        .get("arguments")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let (arguments_json, warning) = parse_tool_arguments(name, raw_arguments);
    if let Some(warning) = warning {
        warnings.push(warning);
    }

    Some(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments_json,
    })
}

fn map_response_status(body: &Value, status: &str, has_tool_calls: bool) -> FinishReason {
    if status == "incomplete" {
        return match body
            .get("incomplete_details")
            .and_then(|details| details.get("reason"))
            .and_then(Value::as_str)
        {
            Some("max_output_tokens") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Other,
        };
    }
    if has_tool_calls {
        FinishReason::ToolCalls
    } else if status == "completed" {
        FinishReason::Stop
    } else {
        FinishReason::Other
    }
}

fn decode_structured_output(
    requested_format: &ResponseFormat,
    output: &[ContentPart],
    warnings: &mut WarningCollector,
) -> Option<Value> {
    if matches!(requested_format, ResponseFormat::Text) {
        return None;
    }

    let text = output
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<String>();
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Some(value),
        Err(error) => {
            warnings.missing_field(
                "structured_output",
                format!("output text was not valid JSON: {error}"),
            );
            None
        }
    }
}

/// Decodes one Responses API stream event.
pub(crate) fn decode_structured_stream_event(
    data: &str,
    target: Target<'_>,
) -> Result<Vec<ProviderChunk>, ProviderError> {
    let payload = serde_json::from_str::<Value>(data)
        .map_err(|error| target.error(format!("invalid stream event: {error}")))?;

    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut chunks = Vec::new();

    match event_type {
        "response.output_text.delta" => {
            if let Some(delta) = payload.get("delta").and_then(Value::as_str) {
                chunks.push(ProviderChunk::TextDelta(delta.to_string()));
            }
        }
        "response.output_item.done" => {
            if let Some(item) = payload
                .get("item")
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
            {
                let mut warnings = WarningCollector::new();
                if let Some(tool_call) = decode_function_call(item, &mut warnings) {
                    chunks.extend(warnings.drain().into_iter().map(ProviderChunk::Warning));
                    chunks.push(ProviderChunk::ToolCall(tool_call));
                }
            }
        }
        "response.completed" | "response.incomplete" => {
            let response = payload.get("response").cloned().unwrap_or(Value::Null);
            if let Some(usage) = response.get("usage").filter(|usage| usage.is_object()) {
                chunks.push(ProviderChunk::Usage(decode_usage(
                    usage,
                    "input_tokens",
                    "output_tokens",
                )));
            }
            let status = response
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("completed");
            if status == "incomplete" {
                chunks.push(ProviderChunk::Finish(map_response_status(
                    &response, status, false,
                )));
            }
        }
        "response.failed" => {
            let message = payload
                .get("response")
                .and_then(error_message)
                .unwrap_or_else(|| "response failed".to_string());
            return Err(target.error(message));
        }
        "error" => {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("stream error");
            return Err(target.error(message.to_string()));
        }
        _ => {}
    }

    Ok(chunks)
}

fn decode_usage(usage: &Value, input_key: &str, output_key: &str) -> Usage {
    Usage {
        input_tokens: usage.get(input_key).and_then(Value::as_u64),
        output_tokens: usage.get(output_key).and_then(Value::as_u64),
        total_tokens: usage.get("total_tokens").and_then(Value::as_u64),
    }
}

fn error_message(payload: &Value) -> Option<String> {
    let error = payload.get("error").filter(|error| !error.is_null())?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("unknown error");

    match error.get("code").and_then(Value::as_str) {
        Some(code) => Some(format!("{message} [code={code}]")),
        None => Some(message.to_string()),
    }
}

fn media_url(reference: &MediaReference) -> String {
    match reference {
        MediaReference::Url(url) => url.clone(),
        MediaReference::Inline { media_type, data } => format!("data:{media_type};base64,{data}"),
    }
}

fn validate_temperature(temperature: Option<f32>, target: Target<'_>) -> Result<(), ProviderError> {
    if let Some(temperature) = temperature
        && !(0.0..=2.0).contains(&temperature)
    {
        return Err(target.error(format!(
            "temperature must be in [0.0, 2.0], got {temperature}"
        )));
    }
    Ok(())
}

fn validate_tool(tool: &ToolDefinition, target: Target<'_>) -> Result<(), ProviderError> {
    if tool.name.trim().is_empty() {
        return Err(target.error("tool definitions require non-empty names"));
    }
    if !tool.parameters_schema.is_object() {
        return Err(target.error(format!(
            "tool '{}' parameters_schema must be a JSON object",
            tool.name
        )));
    }
    Ok(())
}
