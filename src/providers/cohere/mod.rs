use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::core::context::CallContext;
use crate::core::error::{ConfigError, ProviderError};
use crate::core::traits::ProviderAdapter;
use crate::core::types::{
    Capability, CapabilitySet, RerankRequest, RerankResponse, RerankResult, Usage,
};
use crate::providers::{CredentialSource, normalize_base_url, sanitize_api_key};
use crate::transport::http::{HttpTransport, RetryPolicy, TransportContext};
use crate::warnings::WarningCollector;

pub const COHERE_PROVIDER_KEY: &str = "cohere";
const COHERE_DEFAULT_BASE_URL: &str = "https://api.cohere.com";
const COHERE_API_KEY_ENV: &str = "COHERE_API_KEY";
const COHERE_API_KEY_METADATA: &str = "cohere.api_key";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const CREDENTIALS: CredentialSource = CredentialSource {
    provider: COHERE_PROVIDER_KEY,
    metadata_key: COHERE_API_KEY_METADATA,
    env_var: COHERE_API_KEY_ENV,
};

pub struct CohereAdapter {
    transport: HttpTransport,
    base_url: String,
    api_key: Option<String>,
}

impl CohereAdapter {
    pub fn new(api_key: Option<String>) -> Result<Self, ConfigError> {
        Self::with_base_url(api_key, COHERE_DEFAULT_BASE_URL)
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
            transport,
            base_url: normalize_base_url(base_url, COHERE_DEFAULT_BASE_URL),
            api_key: sanitize_api_key(api_key),
        }
    }

    fn rerank_url(&self) -> String {
        format!("{}/v2/rerank", self.base_url)
    }
}

fn protocol_error(model: &str, message: impl Into<String>) -> ProviderError {
    ProviderError::protocol(COHERE_PROVIDER_KEY, Some(model), message)
}

pub(crate) fn encode_rerank_request(
    req: &RerankRequest,
    upstream_model: &str,
) -> Result<Value, ProviderError> {
    if req.query.trim().is_empty() {
        return Err(protocol_error(upstream_model, "rerank query must not be empty"));
    }
    if req.documents.is_empty() {
        return Err(protocol_error(
            upstream_model,
            "rerank request requires at least one document",
        ));
    }
    if req.top_n == Some(0) {
        return Err(protocol_error(upstream_model, "top_n must be at least 1"));
    }

    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(upstream_model.to_string()));
    body.insert("query".to_string(), Value::String(req.query.clone()));
    body.insert("documents".to_string(), json!(req.documents));
    if let Some(top_n) = req.top_n {
        body.insert("top_n".to_string(), json!(top_n));
    }
    Ok(Value::Object(body))
}

/// Results come back ordered by descending relevance; indices point into
/// the request's `documents`.
pub(crate) fn decode_rerank_response(
    body: Value,
    upstream_model: &str,
    document_count: usize,
    warnings: &mut WarningCollector,
) -> Result<RerankResponse, ProviderError> {
    let entries = body
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| protocol_error(upstream_model, "rerank response missing results"))?;

    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let index = entry
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
            .ok_or_else(|| protocol_error(upstream_model, "rerank result missing index"))?;
        if index >= document_count {
            return Err(protocol_error(
                upstream_model,
                format!("rerank result index {index} out of range for {document_count} documents"),
            ));
        }
        let relevance_score = entry
            .get("relevance_score")
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                protocol_error(upstream_model, "rerank result missing relevance_score")
            })?;
        results.push(RerankResult {
            index,
            relevance_score,
        });
    }
    results.sort_by(|left, right| right.relevance_score.total_cmp(&left.relevance_score));

    let usage = match body.get("meta").and_then(|meta| meta.get("tokens")) {
        Some(tokens) => {
            let input_tokens = tokens.get("input_tokens").and_then(Value::as_f64);
            let output_tokens = tokens.get("output_tokens").and_then(Value::as_f64);
            Usage {
                input_tokens: input_tokens.map(|value| value as u64),
                output_tokens: output_tokens.map(|value| value as u64),
                total_tokens: None,
            }
        }
        None => {
            warnings.missing_field("usage", "rerank response did not report token counts");
            Usage::default()
        }
    };

    Ok(RerankResponse {
        results,
        usage,
        provider: COHERE_PROVIDER_KEY.to_string(),
        model: upstream_model.to_string(),
        warnings: Vec::new(),
    })
}

#[async_trait]
impl ProviderAdapter for CohereAdapter {
    fn key(&self) -> &str {
        COHERE_PROVIDER_KEY
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[Capability::Rerank])
    }

    async fn rerank(
        &self,
        req: &RerankRequest,
        call: &mut CallContext,
    ) -> Result<RerankResponse, ProviderError> {
        let body = encode_rerank_request(req, &call.upstream_model)?;
        let api_key = CREDENTIALS.resolve(self.api_key.as_deref(), call)?;
        let ctx = TransportContext::from_call(call).with_bearer_token(api_key);

        let response: Value = self
            .transport
            .post_json(
                COHERE_PROVIDER_KEY,
                Some(&call.upstream_model),
                &self.rerank_url(),
                &body,
                &ctx,
            )
            .await?;

        decode_rerank_response(
            response,
            &call.upstream_model,
            req.documents.len(),
            &mut call.warnings,
        )
    }
}
