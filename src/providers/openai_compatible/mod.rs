use async_trait::async_trait;
use eventsource_stream::Event;
use reqwest::multipart::{Form, Part};
use serde_json::Value;

use crate::core::context::CallContext;
use crate::core::error::{ConfigError, ProviderError};
use crate::core::traits::ProviderAdapter;
use crate::core::types::{
    Capability, CapabilitySet, ChatRequest, ImageRequest, ImageResponse, RealtimeToken,
    RealtimeTokenRequest, SpeechRequest, SpeechResponse, StructuredRequest, StructuredResponse,
    TranscriptionRequest, TranscriptionResponse,
};
use crate::media::MediaKind;
use crate::providers::openai_compatible_translate::{
    self as translate, ChatStreamState, Target,
};
use crate::providers::{CredentialSource, normalize_base_url, sanitize_api_key};
use crate::streaming::sse::{self, EventDecoder};
use crate::streaming::{ProviderChunk, ProviderStream};
use crate::transport::http::{HttpTransport, RetryPolicy, TransportContext};

pub const OPENAI_PROVIDER_KEY: &str = "openai";
const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com";
const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
const OPENAI_API_KEY_METADATA: &str = "openai.api_key";
const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Adapter for OpenAI and any upstream that speaks the same wire format
/// under a different base URL and registry key.
pub struct OpenAiCompatibleAdapter {
    key: String,
    transport: HttpTransport,
    base_url: String,
    api_key: Option<String>,
    credentials: CredentialSource,
}

impl OpenAiCompatibleAdapter {
    pub fn new(api_key: Option<String>) -> Result<Self, ConfigError> {
        Self::with_base_url(api_key, OPENAI_DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: Option<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(DEFAULT_TIMEOUT_MS, RetryPolicy::default())?;
        Ok(Self::with_transport(api_key, base_url, transport))
    }

    pub fn with_transport(
        api_key: Option<String>,
        base_url: impl Into<String>,
        transport: HttpTransport,
    ) -> Self {
        Self {
            key: OPENAI_PROVIDER_KEY.to_string(),
            transport,
            base_url: normalize_base_url(base_url, OPENAI_DEFAULT_BASE_URL),
            api_key: sanitize_api_key(api_key),
            credentials: CredentialSource {
                provider: OPENAI_PROVIDER_KEY,
                metadata_key: OPENAI_API_KEY_METADATA,
                env_var: OPENAI_API_KEY_ENV,
            },
        }
    }

    /// Registers the adapter under another key, e.g. `groq` for a
    /// compatible vendor. Credentials still resolve through the explicit
    /// key, `openai.api_key` metadata or `OPENAI_API_KEY`.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, call: &CallContext) -> Result<TransportContext, ProviderError> {
        let api_key = self
            .credentials
            .resolve(self.api_key.as_deref(), call)
            .map_err(|error| match error {
                ProviderError::Protocol {
                    model,
                    request_id,
                    message,
                    ..
                } => ProviderError::Protocol {
                    provider: self.key.clone(),
                    model,
                    request_id,
                    message,
                },
                other => other,
            })?;
        Ok(TransportContext::from_call(call).with_bearer_token(api_key))
    }

    fn target<'a>(&'a self, call: &'a CallContext) -> Target<'a> {
        Target {
            provider: &self.key,
            model: &call.upstream_model,
        }
    }

    async fn post_stream(
        &self,
        path: &str,
        body: &Value,
        call: &CallContext,
    ) -> Result<reqwest::Response, ProviderError> {
        let ctx = self.authorized(call)?;
        self.transport
            .post_json_stream(
                &self.key,
                Some(&call.upstream_model),
                &self.url(path),
                body,
                &ctx,
            )
            .await
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn key(&self) -> &str {
        &self.key
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[
            Capability::ChatStream,
            Capability::Image,
            Capability::Speech,
            Capability::Transcription,
            Capability::RealtimeToken,
            Capability::StructuredResponse,
            Capability::StructuredResponseStream,
        ])
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        call: &mut CallContext,
    ) -> Result<ProviderStream, ProviderError> {
        let body = translate::encode_chat_request(
            req,
            Target {
                provider: &self.key,
                model: &call.upstream_model,
            },
            &mut call.warnings,
        )?;
        let response = self.post_stream("/v1/chat/completions", &body, call).await?;

        let decoder = ChatStreamDecoder {
            provider: self.key.clone(),
            model: call.upstream_model.clone(),
            state: ChatStreamState::default(),
        };
        Ok(sse::decode_response_with(&self.key, response, decoder))
    }

    async fn image(
        &self,
        req: &ImageRequest,
        call: &mut CallContext,
    ) -> Result<ImageResponse, ProviderError> {
        let body = translate::encode_image_request(
            req,
            Target {
                provider: &self.key,
                model: &call.upstream_model,
            },
            &mut call.warnings,
        )?;
        let ctx = self.authorized(call)?;
        let response: Value = self
            .transport
            .post_json(
                &self.key,
                Some(&call.upstream_model),
                &self.url("/v1/images/generations"),
                &body,
                &ctx,
            )
            .await?;

        translate::decode_image_response(response, self.target(call))
    }

    async fn speech(
        &self,
        req: &SpeechRequest,
        call: &mut CallContext,
    ) -> Result<SpeechResponse, ProviderError> {
        let body = translate::encode_speech_request(req, self.target(call))?;
        let ctx = self.authorized(call)?;
        let audio = self
            .transport
            .post_json_for_bytes(
                &self.key,
                Some(&call.upstream_model),
                &self.url("/v1/audio/speech"),
                &body,
                &ctx,
            )
            .await?;

        if audio.bytes.is_empty() {
            return Err(self
                .target(call)
                .error("speech response contained no audio"));
        }

        Ok(SpeechResponse {
            media_type: translate::speech_media_type(
                translate::speech_format(req),
                audio.content_type.as_deref(),
            ),
            audio: audio.bytes.to_vec(),
            provider: self.key.clone(),
            model: call.upstream_model.clone(),
            warnings: Vec::new(),
        })
    }

    async fn transcription(
        &self,
        req: &TranscriptionRequest,
        call: &mut CallContext,
    ) -> Result<TranscriptionResponse, ProviderError> {
        let audio = call.resolve_media(&req.audio, MediaKind::Audio).await?;
        let ctx = self.authorized(call)?;

        let model = call.upstream_model.clone();
        let file_name = audio_file_name(&audio.media_type);
        let language = req.language.clone();
        let prompt = req.prompt.clone();
        let build_form = || {
            let part = Part::bytes(audio.bytes.clone()).file_name(file_name.clone());
            let part = match part.mime_str(&audio.media_type) {
                Ok(part) => part,
                Err(_) => Part::bytes(audio.bytes.clone()).file_name(file_name.clone()),
            };
            let mut form = Form::new()
                .text("model", model.clone())
                .text("response_format", "verbose_json")
                .part("file", part);
            if let Some(language) = &language {
                form = form.text("language", language.clone());
            }
            if let Some(prompt) = &prompt {
                form = form.text("prompt", prompt.clone());
            }
            form
        };

        let response: Value = self
            .transport
            .post_multipart(
                &self.key,
                Some(&call.upstream_model),
                &self.url("/v1/audio/transcriptions"),
                build_form,
                &ctx,
            )
            .await?;

        translate::decode_transcription_response(
            response,
            Target {
                provider: &self.key,
                model: &call.upstream_model,
            },
            &mut call.warnings,
        )
    }

    async fn realtime_token(
        &self,
        req: &RealtimeTokenRequest,
        call: &mut CallContext,
    ) -> Result<RealtimeToken, ProviderError> {
        let body = translate::encode_realtime_session(
            req,
            Target {
                provider: &self.key,
                model: &call.upstream_model,
            },
            &mut call.warnings,
        );
        let ctx = self.authorized(call)?;
        let response: Value = self
            .transport
            .post_json(
                &self.key,
                Some(&call.upstream_model),
                &self.url("/v1/realtime/sessions"),
                &body,
                &ctx,
            )
            .await?;

        translate::decode_realtime_session(response, self.target(call))
    }

    async fn structured_response(
        &self,
        req: &StructuredRequest,
        call: &mut CallContext,
    ) -> Result<StructuredResponse, ProviderError> {
        let body = translate::encode_structured_request(req, self.target(call), false)?;
        let ctx = self.authorized(call)?;
        let response: Value = self
            .transport
            .post_json(
                &self.key,
                Some(&call.upstream_model),
                &self.url("/v1/responses"),
                &body,
                &ctx,
            )
            .await?;

        translate::decode_structured_response(
            response,
            &req.response_format,
            Target {
                provider: &self.key,
                model: &call.upstream_model,
            },
            &mut call.warnings,
        )
    }

    async fn structured_response_stream(
        &self,
        req: &StructuredRequest,
        call: &mut CallContext,
    ) -> Result<ProviderStream, ProviderError> {
        let body = translate::encode_structured_request(req, self.target(call), true)?;
        let response = self.post_stream("/v1/responses", &body, call).await?;

        let provider = self.key.clone();
        let model = call.upstream_model.clone();
        Ok(sse::decode_response(&self.key, response, move |event| {
            translate::decode_structured_stream_event(
                &event.data,
                Target {
                    provider: &provider,
                    model: &model,
                },
            )
        }))
    }
}

struct ChatStreamDecoder {
    provider: String,
    model: String,
    state: ChatStreamState,
}

impl EventDecoder for ChatStreamDecoder {
    fn decode(&mut self, event: &Event) -> Result<Vec<ProviderChunk>, ProviderError> {
        translate::decode_chat_stream_event(
            &event.data,
            &mut self.state,
            Target {
                provider: &self.provider,
                model: &self.model,
            },
        )
    }

    fn finish(&mut self) -> Vec<ProviderChunk> {
        translate::finish_chat_stream(&mut self.state)
    }
}

fn audio_file_name(media_type: &str) -> String {
    let extension = mime_guess::get_mime_extensions_str(media_type)
        .and_then(|extensions| extensions.first())
        .copied()
        .unwrap_or("bin");
    format!("audio.{extension}")
}

#[cfg(test)]
mod tests;
