use futures::StreamExt;
use serde_json::json;

use super::*;
use crate::core::types::{Message, WarningKind};
use crate::streaming::ProviderChunk;
use crate::test_support::{MockResponse, MockServer};

fn translate_request(messages: Vec<Message>) -> ChatRequest {
    let mut req = ChatRequest::new("deepl/default", messages);
    req.metadata
        .insert("target_lang".to_string(), "de".to_string());
    req
}

#[tokio::test]
async fn test_chat_stream_translates_and_synthesizes_chunks() {
    let mut server = MockServer::start(vec![MockResponse::json(
        200,
        r#"{"translations":[{"detected_source_language":"EN","text":"Guten Morgen"}]}"#,
    )]);
    let transport = HttpTransport::new(2_000, RetryPolicy::none()).expect("transport");
    let adapter = DeepLAdapter::with_transport(Some("dl-key".to_string()), server.url(), transport);
    let mut call = CallContext::standalone("default").expect("context");
    let req = translate_request(vec![
        Message::text(MessageRole::System, "formal register"),
        Message::text(MessageRole::User, "Good morning"),
    ]);

    let stream = adapter.chat_stream(&req, &mut call).await.expect("stream");
    let chunks = stream
        .map(|chunk| chunk.expect("chunk"))
        .collect::<Vec<_>>()
        .await;

    assert_eq!(chunks, vec![
        ProviderChunk::TextDelta("Guten Morgen".to_string()),
        ProviderChunk::Finish(FinishReason::Stop),
    ]);
    assert!(call.warnings.is_empty());

    server.shutdown();
    let request = &server.requests()[0];
    assert_eq!(request.path, "/v2/translate");
    assert_eq!(
        request.headers.get("authorization").map(String::as_str),
        Some("DeepL-Auth-Key dl-key")
    );
    assert_eq!(
        request.json_body(),
        json!({"text": ["Good morning"], "target_lang": "DE", "context": "formal register"})
    );
}

#[test]
fn test_translate_request_requires_target_language_and_user_text() {
    let mut warnings = WarningCollector::new();

    let no_target = ChatRequest::new("deepl/default", vec![Message::text(MessageRole::User, "hi")]);
    let error = encode_translate_request(&no_target, "default", &mut warnings).expect_err("target");
    assert!(error.to_string().contains("target_lang"));

    let no_user = translate_request(vec![Message::text(MessageRole::System, "ctx")]);
    assert!(encode_translate_request(&no_user, "default", &mut warnings).is_err());
}

#[test]
fn test_translate_request_warns_about_chat_only_fields() {
    let mut req = translate_request(vec![
        Message::text(MessageRole::User, "first"),
        Message::text(MessageRole::Assistant, "erste"),
        Message::text(MessageRole::User, "second"),
    ]);
    req.temperature = Some(0.3);
    req.metadata
        .insert("source_lang".to_string(), "en".to_string());
    let mut warnings = WarningCollector::new();

    let body = encode_translate_request(&req, "quality_optimized", &mut warnings).expect("encode");

    assert_eq!(body["text"], json!(["second"]));
    assert_eq!(body["source_lang"], "EN");
    assert_eq!(body["model_type"], "quality_optimized");
    let recorded = warnings
        .as_slice()
        .iter()
        .map(|warning| (warning.kind, warning.feature.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(recorded, vec![
        (WarningKind::Ignored, "messages"),
        (WarningKind::Ignored, "temperature"),
    ]);
}

#[test]
fn test_translate_url_follows_key_tier() {
    let adapter = DeepLAdapter::new(None).expect("adapter");
    assert_eq!(
        adapter.translate_url("abc:fx"),
        "https://api-free.deepl.com/v2/translate"
    );
    assert_eq!(adapter.translate_url("abc"), "https://api.deepl.com/v2/translate");
}

#[test]
fn test_translate_response_without_translations_is_protocol_error() {
    assert!(decode_translate_response(json!({"translations": []}), "default").is_err());
    assert!(decode_translate_response(json!({}), "default").is_err());
}
