use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::core::context::CallContext;
use crate::core::error::{ConfigError, ProviderError};
use crate::core::traits::ProviderAdapter;
use crate::core::types::{
    Capability, CapabilitySet, ChatRequest, ContentPart, FinishReason, MessageRole,
};
use crate::providers::{CredentialSource, normalize_base_url, sanitize_api_key};
use crate::streaming::{CompletedText, ProviderStream, synthesize};
use crate::transport::http::{HttpTransport, RetryPolicy, TransportContext};
use crate::warnings::WarningCollector;

pub const DEEPL_PROVIDER_KEY: &str = "deepl";
const DEEPL_PRO_BASE_URL: &str = "https://api.deepl.com";
const DEEPL_FREE_BASE_URL: &str = "https://api-free.deepl.com";
const DEEPL_FREE_KEY_SUFFIX: &str = ":fx";
const DEEPL_API_KEY_ENV: &str = "DEEPL_API_KEY";
const DEEPL_API_KEY_METADATA: &str = "deepl.api_key";
const TARGET_LANG_METADATA: &str = "target_lang";
const SOURCE_LANG_METADATA: &str = "source_lang";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const CREDENTIALS: CredentialSource = CredentialSource {
    provider: DEEPL_PROVIDER_KEY,
    metadata_key: DEEPL_API_KEY_METADATA,
    env_var: DEEPL_API_KEY_ENV,
};

/// Translation exposed as chat: the last user message is translated in one
/// batch call and replayed as a synthesized stream.
///
/// The target language comes from the chat request's `target_lang`
/// metadata; `source_lang` is optional and auto-detected when absent. The
/// upstream model names a DeepL `model_type`, and `default` leaves the
/// choice to DeepL.
pub struct DeepLAdapter {
    transport: HttpTransport,
    base_url: Option<String>,
    api_key: Option<String>,
}

impl DeepLAdapter {
    pub fn new(api_key: Option<String>) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(DEFAULT_TIMEOUT_MS, RetryPolicy::default())?;
        Ok(Self {
            transport,
            base_url: None,
            api_key: sanitize_api_key(api_key),
        })
    }

    /// An empty `base_url` keeps host selection by key tier.
    pub fn with_transport(
        api_key: Option<String>,
        base_url: impl Into<String>,
        transport: HttpTransport,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            transport,
            base_url: (!base_url.trim().is_empty())
                .then(|| normalize_base_url(base_url, DEEPL_PRO_BASE_URL)),
            api_key: sanitize_api_key(api_key),
        }
    }

    /// Free-tier keys end in `:fx` and live on a separate host.
    fn translate_url(&self, api_key: &str) -> String {
        let base_url = match &self.base_url {
            Some(base_url) => base_url.as_str(),
            None if api_key.ends_with(DEEPL_FREE_KEY_SUFFIX) => DEEPL_FREE_BASE_URL,
            None => DEEPL_PRO_BASE_URL,
        };
        format!("{base_url}/v2/translate")
    }
}

fn protocol_error(model: &str, message: impl Into<String>) -> ProviderError {
    ProviderError::protocol(DEEPL_PROVIDER_KEY, Some(model), message)
}

pub(crate) fn encode_translate_request(
    req: &ChatRequest,
    upstream_model: &str,
    warnings: &mut WarningCollector,
) -> Result<Value, ProviderError> {
    let target_lang = req
        .metadata
        .get(TARGET_LANG_METADATA)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            protocol_error(
                upstream_model,
                format!("translation requires {TARGET_LANG_METADATA} metadata on the request"),
            )
        })?;

    let last_user = req
        .messages
        .iter()
        .rposition(|message| message.role == MessageRole::User)
        .ok_or_else(|| protocol_error(upstream_model, "translation requires a user message"))?;
    let text = req.messages[last_user].text_content();
    if text.trim().is_empty() {
        return Err(protocol_error(
            upstream_model,
            "the last user message has no text to translate",
        ));
    }

    let context = req
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(|message| message.text_content())
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let mut body = Map::new();
    body.insert("text".to_string(), json!([text]));
    body.insert("target_lang".to_string(), json!(target_lang.to_ascii_uppercase()));
    if let Some(source_lang) = req.metadata.get(SOURCE_LANG_METADATA) {
        body.insert(
            "source_lang".to_string(),
            json!(source_lang.trim().to_ascii_uppercase()),
        );
    }
    if !context.is_empty() {
        body.insert("context".to_string(), Value::String(context));
    }
    if upstream_model != "default" && !upstream_model.is_empty() {
        body.insert(
            "model_type".to_string(),
            Value::String(upstream_model.to_string()),
        );
    }

    record_dropped_fields(req, last_user, warnings);
    Ok(Value::Object(body))
}

fn record_dropped_fields(req: &ChatRequest, last_user: usize, warnings: &mut WarningCollector) {
    let earlier_turns = req.messages[..last_user]
        .iter()
        .filter(|message| message.role != MessageRole::System)
        .count()
        + req.messages[last_user + 1..].len();
    if earlier_turns > 0 {
        warnings.ignored(
            "messages",
            format!("only the last user message is translated; {earlier_turns} other turns dropped"),
        );
    }
    if req.messages[last_user]
        .content
        .iter()
        .any(|part| !matches!(part, ContentPart::Text { .. }))
    {
        warnings.unsupported("content", "non-text parts are not translated");
    }
    if !req.tools.is_empty() {
        warnings.unsupported("tools", "translation does not call tools");
    }
    if req.temperature.is_some() {
        warnings.ignored("temperature", "translation output is deterministic");
    }
    if req.max_output_tokens.is_some() {
        warnings.ignored("max_output_tokens", "translation length follows the input");
    }
    if !req.stop.is_empty() {
        warnings.ignored("stop", "translation output is not truncated");
    }
}

pub(crate) fn decode_translate_response(
    body: Value,
    upstream_model: &str,
) -> Result<CompletedText, ProviderError> {
    let segments = body
        .get("translations")
        .and_then(Value::as_array)
        .ok_or_else(|| protocol_error(upstream_model, "translate response missing translations"))?
        .iter()
        .map(|translation| {
            translation
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| protocol_error(upstream_model, "translation missing text"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if segments.is_empty() {
        return Err(protocol_error(upstream_model, "translate response was empty"));
    }

    Ok(CompletedText {
        segments,
        finish_reason: FinishReason::Stop,
        usage: None,
    })
}

#[async_trait]
impl ProviderAdapter for DeepLAdapter {
    fn key(&self) -> &str {
        DEEPL_PROVIDER_KEY
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[Capability::ChatStream])
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        call: &mut CallContext,
    ) -> Result<ProviderStream, ProviderError> {
        let body = encode_translate_request(req, &call.upstream_model, &mut call.warnings)?;
        let api_key = CREDENTIALS.resolve(self.api_key.as_deref(), call)?;
        let url = self.translate_url(&api_key);
        let ctx = TransportContext::from_call(call)
            .with_header("authorization", format!("DeepL-Auth-Key {api_key}"));

        let response: Value = self
            .transport
            .post_json(
                DEEPL_PROVIDER_KEY,
                Some(&call.upstream_model),
                &url,
                &body,
                &ctx,
            )
            .await?;

        Ok(synthesize(decode_translate_response(
            response,
            &call.upstream_model,
        )?))
    }
}

#[cfg(test)]
mod tests;
