use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::core::context::CallContext;
use crate::core::error::{ConfigError, ProviderError};
use crate::core::traits::ProviderAdapter;
use crate::core::types::{
    Capability, CapabilitySet, GeneratedImage, ImageRequest, ImageResponse,
};
use crate::jobs::{JobPoller, JobStatus, JobSubmission, PollPolicy, StatusVocabulary};
use crate::media::MediaKind;
use crate::providers::{CredentialSource, normalize_base_url, sanitize_api_key};
use crate::transport::http::{HttpTransport, RetryPolicy, TransportContext};
use crate::warnings::WarningCollector;

pub const REPLICATE_PROVIDER_KEY: &str = "replicate";
const REPLICATE_DEFAULT_BASE_URL: &str = "https://api.replicate.com";
const REPLICATE_API_KEY_ENV: &str = "REPLICATE_API_TOKEN";
const REPLICATE_API_KEY_METADATA: &str = "replicate.api_key";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const CREDENTIALS: CredentialSource = CredentialSource {
    provider: REPLICATE_PROVIDER_KEY,
    metadata_key: REPLICATE_API_KEY_METADATA,
    env_var: REPLICATE_API_KEY_ENV,
};

/// Image generation through Replicate predictions: one create call, then
/// status polls until the prediction settles.
pub struct ReplicateAdapter {
    transport: HttpTransport,
    poller: JobPoller,
    base_url: String,
    api_key: Option<String>,
}

impl ReplicateAdapter {
    pub fn new(api_key: Option<String>, poll_policy: PollPolicy) -> Result<Self, ConfigError> {
        Self::with_base_url(api_key, REPLICATE_DEFAULT_BASE_URL, poll_policy)
    }

    pub fn with_base_url(
        api_key: Option<String>,
        base_url: impl Into<String>,
        poll_policy: PollPolicy,
    ) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(DEFAULT_TIMEOUT_MS, RetryPolicy::default())?;
        Self::with_transport(api_key, base_url, transport, poll_policy)
    }

    /// `transport` is used with retries disabled. A repeated create could
    /// start a second prediction, and polls already repeat on the poller's
    /// cadence.
    pub fn with_transport(
        api_key: Option<String>,
        base_url: impl Into<String>,
        transport: HttpTransport,
        poll_policy: PollPolicy,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            transport: transport.with_retry_policy(RetryPolicy::none())?,
            poller: JobPoller::new(poll_policy)?,
            base_url: normalize_base_url(base_url, REPLICATE_DEFAULT_BASE_URL),
            api_key: sanitize_api_key(api_key),
        })
    }

    fn create_url(&self, upstream_model: &str) -> String {
        match upstream_model.split_once(':') {
            Some(_) => format!("{}/v1/predictions", self.base_url),
            None => format!("{}/v1/models/{upstream_model}/predictions", self.base_url),
        }
    }

    fn prediction_url(&self, id: &str) -> String {
        format!("{}/v1/predictions/{id}", self.base_url)
    }
}

fn vocabulary() -> StatusVocabulary {
    StatusVocabulary::new(
        &["starting", "processing"],
        &["succeeded"],
        &["failed", "canceled", "aborted"],
    )
}

fn classify(vocabulary: &StatusVocabulary, prediction: &Value) -> JobStatus {
    let status = prediction
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let reason = prediction.get("error").and_then(|error| match error {
        Value::String(message) => Some(message.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    });
    vocabulary.classify(status, reason.as_deref())
}

/// Builds the prediction body. `input_image` is the first input image,
/// already resolved to a data URL.
pub(crate) fn encode_prediction(
    req: &ImageRequest,
    upstream_model: &str,
    input_image: Option<String>,
    warnings: &mut WarningCollector,
) -> Value {
    let mut input = Map::new();
    input.insert("prompt".to_string(), Value::String(req.prompt.clone()));
    if let Some(negative_prompt) = &req.negative_prompt {
        input.insert(
            "negative_prompt".to_string(),
            Value::String(negative_prompt.clone()),
        );
    }
    if let Some(aspect_ratio) = &req.aspect_ratio {
        input.insert(
            "aspect_ratio".to_string(),
            Value::String(aspect_ratio.clone()),
        );
    }
    if let Some(seed) = req.seed {
        input.insert("seed".to_string(), json!(seed));
    }
    if let Some(n) = req.n {
        input.insert("num_outputs".to_string(), json!(n));
    }
    if req.size.is_some() {
        warnings.unsupported("size", "predictions take aspect_ratio instead of pixel sizes");
    }
    if let Some(image) = input_image {
        input.insert("image".to_string(), Value::String(image));
    }
    if req.input_images.len() > 1 {
        warnings.ignored(
            "input_images",
            format!(
                "only the first of {} input images is sent",
                req.input_images.len()
            ),
        );
    }

    let mut body = Map::new();
    if let Some((_, version)) = upstream_model.split_once(':') {
        body.insert("version".to_string(), Value::String(version.to_string()));
    }
    body.insert("input".to_string(), Value::Object(input));
    Value::Object(body)
}

pub(crate) fn decode_prediction_output(
    prediction: &Value,
    upstream_model: &str,
) -> Result<Vec<GeneratedImage>, ProviderError> {
    let urls = match prediction.get("output") {
        Some(Value::String(url)) => vec![url.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    if urls.is_empty() {
        return Err(ProviderError::protocol(
            REPLICATE_PROVIDER_KEY,
            Some(upstream_model),
            "succeeded prediction has no image output",
        ));
    }

    Ok(urls.into_iter().map(decode_output_url).collect())
}

fn decode_output_url(url: &str) -> GeneratedImage {
    if let Some((media_type, data)) = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
    {
        return GeneratedImage::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        };
    }
    GeneratedImage::Url {
        url: url.to_string(),
    }
}

#[async_trait]
impl ProviderAdapter for ReplicateAdapter {
    fn key(&self) -> &str {
        REPLICATE_PROVIDER_KEY
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::of(&[Capability::Image])
    }

    async fn image(
        &self,
        req: &ImageRequest,
        call: &mut CallContext,
    ) -> Result<ImageResponse, ProviderError> {
        if req.prompt.trim().is_empty() {
            return Err(ProviderError::protocol(
                REPLICATE_PROVIDER_KEY,
                Some(&call.upstream_model),
                "image prompt must not be empty",
            ));
        }

        let input_image = match req.input_images.first() {
            Some(reference) => {
                let media = call.resolve_media(reference, MediaKind::Image).await?;
                Some(media.to_data_url())
            }
            None => None,
        };

        let api_key = CREDENTIALS.resolve(self.api_key.as_deref(), call)?;
        let ctx = TransportContext::from_call(call).with_bearer_token(api_key);
        let model = call.upstream_model.clone();
        let cancel = call.cancel.clone();
        let body = encode_prediction(req, &model, input_image, &mut call.warnings);
        let vocabulary = vocabulary();

        let submit = {
            let (model, body, ctx) = (&model, &body, &ctx);
            move || async move {
                let prediction: Value = self
                    .transport
                    .post_json(
                        REPLICATE_PROVIDER_KEY,
                        Some(model),
                        &self.create_url(model),
                        body,
                        ctx,
                    )
                    .await?;
                let id = prediction
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProviderError::protocol(
                            REPLICATE_PROVIDER_KEY,
                            Some(model),
                            "prediction response missing id",
                        )
                    })?
                    .to_string();
                Ok(JobSubmission {
                    id,
                    payload: prediction,
                })
            }
        };
        let poll = {
            let (model, ctx) = (&model, &ctx);
            move |id: String| {
                let url = self.prediction_url(&id);
                async move {
                    self.transport
                        .get_json::<Value>(REPLICATE_PROVIDER_KEY, Some(model), &url, ctx)
                        .await
                }
            }
        };

        let outcome = self
            .poller
            .run(
                submit,
                poll,
                |prediction: &Value| classify(&vocabulary, prediction),
                &cancel,
                &mut call.warnings,
            )
            .await?;
        let prediction = outcome.into_succeeded()?;

        Ok(ImageResponse {
            images: decode_prediction_output(&prediction, &model)?,
            provider: REPLICATE_PROVIDER_KEY.to_string(),
            model,
            raw_provider_response: Some(prediction),
            warnings: Vec::new(),
        })
    }
}
