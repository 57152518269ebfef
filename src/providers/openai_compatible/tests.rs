use futures::StreamExt;
use serde_json::json;

use super::*;
use crate::core::types::{
    FinishReason, Message, MessageRole, ResponseFormat, ToolCall, Usage,
};
use crate::media::MediaReference;
use crate::streaming::ProviderChunk;
use crate::test_support::{MockResponse, MockServer};

fn adapter(server: &MockServer, api_key: Option<&str>) -> OpenAiCompatibleAdapter {
    let transport = HttpTransport::new(2_000, RetryPolicy::none()).expect("transport");
    OpenAiCompatibleAdapter::with_transport(api_key.map(str::to_string), server.url(), transport)
}

fn call(model: &str) -> CallContext {
    CallContext::standalone(model).expect("default media policy")
}

#[tokio::test]
async fn test_chat_stream_posts_completion_request_and_decodes_frames() {
    let mut server = MockServer::start(vec![MockResponse::event_stream(&[
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":2,\"completion_tokens\":2,\"total_tokens\":4}}\n\n",
        "data: [DONE]\n\n",
    ])]);
    let adapter = adapter(&server, Some("sk-test"));
    let mut call = call("gpt-4.1-mini");
    let req = ChatRequest::new("openai/gpt-4.1-mini", vec![Message::text(MessageRole::User, "hi")]);

    let stream = adapter.chat_stream(&req, &mut call).await.expect("stream");
    let chunks = stream
        .map(|chunk| chunk.expect("chunk"))
        .collect::<Vec<_>>()
        .await;

    assert_eq!(chunks, vec![
        ProviderChunk::TextDelta("Hel".to_string()),
        ProviderChunk::TextDelta("lo".to_string()),
        ProviderChunk::Finish(FinishReason::Stop),
        ProviderChunk::Usage(Usage {
            input_tokens: Some(2),
            output_tokens: Some(2),
            total_tokens: Some(4),
        }),
    ]);

    server.shutdown();
    let requests = server.requests();
    assert_eq!(requests[0].path, "/v1/chat/completions");
    assert_eq!(
        requests[0].headers.get("authorization").map(String::as_str),
        Some("Bearer sk-test")
    );
    assert_eq!(
        requests[0].headers.get("accept").map(String::as_str),
        Some("text/event-stream")
    );
    assert_eq!(requests[0].json_body()["model"], "gpt-4.1-mini");
}

#[tokio::test]
async fn test_chat_stream_releases_tool_calls_when_upstream_ends_at_done() {
    let mut server = MockServer::start(vec![MockResponse::event_stream(&[
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"lookup\",\"arguments\":\"{\\\"q\\\":\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"rust\\\"}\"}}]}}]}\n\n",
        "data: [DONE]\n\n",
    ])]);
    let adapter = adapter(&server, Some("sk-test"));
    let mut call = call("gpt-4.1-mini");
    let req = ChatRequest::new("openai/gpt-4.1-mini", vec![Message::text(MessageRole::User, "hi")]);

    let chunks = adapter
        .chat_stream(&req, &mut call)
        .await
        .expect("stream")
        .map(|chunk| chunk.expect("chunk"))
        .collect::<Vec<_>>()
        .await;

    assert_eq!(chunks, vec![ProviderChunk::ToolCall(ToolCall {
        id: "call_1".to_string(),
        name: "lookup".to_string(),
        arguments_json: json!({"q": "rust"}),
    })]);

    server.shutdown();
}

#[tokio::test]
async fn test_chat_stream_setup_failure_is_typed_error() {
    let mut server = MockServer::start(vec![MockResponse::json(
        500,
        r#"{"error":{"message":"upstream down"}}"#,
    )]);
    let adapter = adapter(&server, Some("sk-test"));
    let mut call = call("gpt-4.1-mini");
    let req = ChatRequest::new("m", vec![Message::text(MessageRole::User, "hi")]);

    let error = match adapter.chat_stream(&req, &mut call).await {
        Ok(_) => panic!("expected status error"),
        Err(error) => error,
    };

    assert!(matches!(error, ProviderError::Status { status_code: 500, .. }));
    server.shutdown();
}

#[tokio::test]
async fn test_image_uses_metadata_key_and_collects_warnings() {
    let mut server = MockServer::start(vec![MockResponse::json(
        200,
        r#"{"data":[{"b64_json":"aGk="}]}"#,
    )]);
    let adapter = adapter(&server, None);
    let mut call = call("gpt-image-1");
    call.metadata
        .insert("openai.api_key".to_string(), "sk-meta".to_string());
    let mut req = ImageRequest::new("openai/gpt-image-1", "a lighthouse");
    req.seed = Some(42);

    let response = adapter.image(&req, &mut call).await.expect("image");

    assert_eq!(response.images.len(), 1);
    assert_eq!(response.provider, "openai");
    assert_eq!(call.warnings.as_slice()[0].feature, "seed");

    server.shutdown();
    let requests = server.requests();
    assert_eq!(requests[0].path, "/v1/images/generations");
    assert_eq!(
        requests[0].headers.get("authorization").map(String::as_str),
        Some("Bearer sk-meta")
    );
    assert!(!requests[0].headers.contains_key("openai.api_key"));
}

#[tokio::test]
async fn test_speech_returns_audio_bytes() {
    let mut server = MockServer::start(vec![MockResponse::binary("audio/mpeg", b"ID3audio")]);
    let adapter = adapter(&server, Some("sk-test"));
    let mut call = call("tts-1");
    let req = SpeechRequest {
        model: "openai/tts-1".to_string(),
        input: "hello".to_string(),
        voice: Some("nova".to_string()),
        format: None,
        speed: None,
    };

    let response = adapter.speech(&req, &mut call).await.expect("speech");

    assert_eq!(response.audio, b"ID3audio".to_vec());
    assert_eq!(response.media_type, "audio/mpeg");
    server.shutdown();
    assert_eq!(server.requests()[0].json_body()["voice"], "nova");
}

#[tokio::test]
async fn test_transcription_sends_resolved_audio_as_multipart() {
    let mut server = MockServer::start(vec![MockResponse::json(
        200,
        r#"{"text":"hi there","language":"english","duration":0.8}"#,
    )]);
    let adapter = adapter(&server, Some("sk-test"));
    let mut call = call("whisper-1");
    let req = TranscriptionRequest {
        model: "openai/whisper-1".to_string(),
        audio: MediaReference::inline("audio/wav", b"RIFFdata"),
        language: Some("en".to_string()),
        prompt: None,
    };

    let response = adapter
        .transcription(&req, &mut call)
        .await
        .expect("transcription");

    assert_eq!(response.text, "hi there");
    assert_eq!(response.duration_seconds, Some(0.8));

    server.shutdown();
    let request = &server.requests()[0];
    assert_eq!(request.path, "/v1/audio/transcriptions");
    let body = request.body_text();
    assert!(body.contains("name=\"model\""));
    assert!(body.contains("whisper-1"));
    assert!(body.contains("name=\"language\""));
    assert!(body.contains("filename=\"audio."));
    assert!(body.contains("RIFFdata"));
}

#[tokio::test]
async fn test_transcription_rejects_private_audio_url_before_any_upstream_call() {
    let mut server = MockServer::start(Vec::new());
    let adapter = adapter(&server, Some("sk-test"));
    let mut call = call("whisper-1");
    let req = TranscriptionRequest {
        model: "openai/whisper-1".to_string(),
        audio: MediaReference::url("http://169.254.169.254/latest/meta-data"),
        language: None,
        prompt: None,
    };

    let error = adapter
        .transcription(&req, &mut call)
        .await
        .expect_err("blocked");

    assert!(matches!(error, ProviderError::Media(_)));
    server.shutdown();
    assert_eq!(server.request_count(), 0);
}

#[tokio::test]
async fn test_realtime_token_and_structured_response() {
    let mut server = MockServer::start(vec![
        MockResponse::json(
            200,
            r#"{"client_secret":{"value":"ek_123","expires_at":1700000100}}"#,
        ),
        MockResponse::json(
            200,
            &json!({
                "id": "resp_1",
                "status": "completed",
                "output": [{"type": "message", "content": [{"type": "output_text", "text": "{\"ok\":true}"}]}],
                "usage": {"input_tokens": 1, "output_tokens": 2, "total_tokens": 3},
            })
            .to_string(),
        ),
    ]);
    let adapter = adapter(&server, Some("sk-test"));

    let mut realtime_call = call("gpt-4o-realtime-preview");
    let token = adapter
        .realtime_token(
            &RealtimeTokenRequest {
                model: "openai/gpt-4o-realtime-preview".to_string(),
                voice: None,
                instructions: Some("be kind".to_string()),
                expires_in_seconds: None,
            },
            &mut realtime_call,
        )
        .await
        .expect("token");
    assert_eq!(token.token, "ek_123");

    let mut structured_call = call("gpt-4.1-mini");
    let response = adapter
        .structured_response(
            &StructuredRequest {
                model: "openai/gpt-4.1-mini".to_string(),
                input: vec![Message::text(MessageRole::User, "ok?")],
                instructions: None,
                response_format: ResponseFormat::JsonObject,
                tools: Vec::new(),
                max_output_tokens: None,
            },
            &mut structured_call,
        )
        .await
        .expect("structured");
    assert_eq!(response.structured_output, Some(json!({"ok": true})));

    server.shutdown();
    let requests = server.requests();
    assert_eq!(requests[0].path, "/v1/realtime/sessions");
    assert_eq!(requests[1].path, "/v1/responses");
    assert_eq!(requests[1].json_body()["store"], false);
}

#[test]
fn test_with_key_rebrands_adapter() {
    let transport = HttpTransport::new(1_000, RetryPolicy::none()).expect("transport");
    let adapter =
        OpenAiCompatibleAdapter::with_transport(None, "https://api.groq.com/openai/", transport)
            .with_key("groq");

    assert_eq!(adapter.key(), "groq");
    assert_eq!(
        adapter.url("/v1/chat/completions"),
        "https://api.groq.com/openai/v1/chat/completions"
    );
    assert!(adapter.capabilities().contains(Capability::StructuredResponseStream));
    assert!(!adapter.capabilities().contains(Capability::Rerank));
}

#[test]
fn test_audio_file_name_follows_media_type() {
    let known = audio_file_name("audio/wav");
    assert!(known.starts_with("audio.") && known != "audio.bin", "{known}");
    assert_eq!(audio_file_name("application/x-unknown-thing"), "audio.bin");
}
