use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue,
};
use reqwest::multipart::Form;
use reqwest::{Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::core::context::CallContext;
use crate::core::error::{ConfigError, ProviderError};

const AUTH_BEARER_TOKEN_KEY: &str = "transport.auth.bearer_token";
const CUSTOM_HEADER_PREFIX: &str = "transport.header.";
const REQUEST_ID_HEADER_KEY: &str = "transport.request_id_header";
const DEFAULT_REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub retryable_status_codes: Vec<u16>,
}

impl RetryPolicy {
    /// Single attempt. Used for job polls, which must never be retried
    /// behind the poller's back.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            retryable_status_codes: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy {
                reason: "max_attempts must be >= 1".to_string(),
            });
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidRetryPolicy {
                reason: "max_backoff_ms must be >= initial_backoff_ms".to_string(),
            });
        }
        if let Some(status) = self
            .retryable_status_codes
            .iter()
            .copied()
            .find(|status| !(100..=599).contains(status))
        {
            return Err(ConfigError::InvalidRetryPolicy {
                reason: format!("retryable status code must be in 100..=599: {status}"),
            });
        }
        Ok(())
    }

    fn should_retry_status(&self, status_code: u16) -> bool {
        self.retryable_status_codes.contains(&status_code)
    }

    fn backoff_duration_for_retry(&self, retry_index: u32) -> Duration {
        let shift = retry_index.min(63);
        let multiplier = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
        let backoff_ms = self
            .initial_backoff_ms
            .saturating_mul(multiplier)
            .min(self.max_backoff_ms);
        Duration::from_millis(backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

/// Per-request header inputs, keyed the same way as request metadata:
/// `transport.auth.bearer_token`, `transport.header.<name>` and
/// `transport.request_id_header`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportContext {
    pub metadata: BTreeMap<String, String>,
    pub request_id: Option<String>,
}

impl TransportContext {
    pub fn from_call(call: &CallContext) -> Self {
        Self {
            metadata: call.metadata.clone(),
            request_id: call.request_id.clone(),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.metadata
            .insert(AUTH_BEARER_TOKEN_KEY.to_string(), token.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.metadata
            .insert(format!("{CUSTOM_HEADER_PREFIX}{name}"), value.into());
        self
    }
}

/// Successful response body that is not JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryBody {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    retry_policy: RetryPolicy,
    timeout_ms: u64,
}

impl HttpTransport {
    pub fn new(timeout_ms: u64, retry_policy: RetryPolicy) -> Result<Self, ConfigError> {
        Self::with_client(reqwest::Client::new(), timeout_ms, retry_policy)
    }

    pub fn with_client(
        client: reqwest::Client,
        timeout_ms: u64,
        retry_policy: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        Self::validate_timeout(timeout_ms)?;
        retry_policy.validate()?;

        Ok(Self {
            client,
            retry_policy,
            timeout_ms,
        })
    }

    /// Same client and timeout, different retry policy.
    pub fn with_retry_policy(&self, retry_policy: RetryPolicy) -> Result<Self, ConfigError> {
        Self::with_client(self.client.clone(), self.timeout_ms, retry_policy)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub async fn get_json<TResp>(
        &self,
        provider: &str,
        model: Option<&str>,
        url: &str,
        ctx: &TransportContext,
    ) -> Result<TResp, ProviderError>
    where
        TResp: DeserializeOwned,
    {
        let (response, request_id) = self
            .send(provider, model, ctx, true, |client| {
                client.request(Method::GET, url)
            })
            .await?;
        parse_json(provider, model, request_id, response).await
    }

    pub async fn post_json<TReq, TResp>(
        &self,
        provider: &str,
        model: Option<&str>,
        url: &str,
        body: &TReq,
        ctx: &TransportContext,
    ) -> Result<TResp, ProviderError>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        let payload = encode_json(provider, model, body)?;
        let (response, request_id) = self
            .send(provider, model, ctx, true, |client| {
                client
                    .request(Method::POST, url)
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                    .body(payload.clone())
            })
            .await?;
        parse_json(provider, model, request_id, response).await
    }

    /// POSTs JSON and returns the raw response body, e.g. synthesized audio.
    pub async fn post_json_for_bytes<TReq>(
        &self,
        provider: &str,
        model: Option<&str>,
        url: &str,
        body: &TReq,
        ctx: &TransportContext,
    ) -> Result<BinaryBody, ProviderError>
    where
        TReq: Serialize + ?Sized,
    {
        let payload = encode_json(provider, model, body)?;
        let (response, request_id) = self
            .send(provider, model, ctx, true, |client| {
                client
                    .request(Method::POST, url)
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                    .body(payload.clone())
            })
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|error| ProviderError::Transport {
                provider: provider.to_string(),
                request_id,
                message: error.to_string(),
            })?;

        Ok(BinaryBody {
            bytes,
            content_type,
        })
    }

    /// POSTs JSON asking for `text/event-stream` and returns the response
    /// once its status is known to be successful. Retries apply only until
    /// the stream has started. The timeout bounds the wait for response
    /// headers only; the body may stream for as long as the upstream sends.
    pub async fn post_json_stream<TReq>(
        &self,
        provider: &str,
        model: Option<&str>,
        url: &str,
        body: &TReq,
        ctx: &TransportContext,
    ) -> Result<Response, ProviderError>
    where
        TReq: Serialize + ?Sized,
    {
        let payload = encode_json(provider, model, body)?;
        let (response, _) = self
            .send(provider, model, ctx, false, |client| {
                client
                    .request(Method::POST, url)
                    .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                    .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
                    .body(payload.clone())
            })
            .await?;
        Ok(response)
    }

    /// POSTs a multipart form. `build_form` runs once per attempt since
    /// forms cannot be replayed.
    pub async fn post_multipart<TResp, F>(
        &self,
        provider: &str,
        model: Option<&str>,
        url: &str,
        build_form: F,
        ctx: &TransportContext,
    ) -> Result<TResp, ProviderError>
    where
        TResp: DeserializeOwned,
        F: Fn() -> Form,
    {
        let (response, request_id) = self
            .send(provider, model, ctx, true, |client| {
                client.request(Method::POST, url).multipart(build_form())
            })
            .await?;
        parse_json(provider, model, request_id, response).await
    }

    async fn send<B>(
        &self,
        provider: &str,
        model: Option<&str>,
        ctx: &TransportContext,
        apply_timeout: bool,
        build: B,
    ) -> Result<(Response, Option<String>), ProviderError>
    where
        B: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let header_config = self.build_header_config(provider, model, ctx)?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let timeout = Duration::from_millis(self.timeout_ms);
            let request_builder = build(&self.client).headers(header_config.headers.clone());

            // Streamed bodies have no overall bound, but the headers still must
            // arrive within the timeout.
            let headers_in_time = if apply_timeout {
                Ok(request_builder.timeout(timeout).send().await)
            } else {
                tokio::time::timeout(timeout, request_builder.send()).await
            };
            let sent = match headers_in_time {
                Ok(sent) => sent,
                Err(_) => {
                    if attempt < self.retry_policy.max_attempts {
                        debug!(provider, attempt, "retrying upstream request after timeout");
                        self.sleep_before_retry(attempt).await;
                        continue;
                    }

                    warn!(provider, attempt, "upstream sent no response headers in time");
                    return Err(ProviderError::Transport {
                        provider: provider.to_string(),
                        request_id: None,
                        message: format!("no response headers within {}ms", self.timeout_ms),
                    });
                }
            };

            match sent {
                Ok(response) => {
                    let status_code = response.status().as_u16();
                    let request_id =
                        extract_request_id(response.headers(), &header_config.request_id_header);

                    if !response.status().is_success() {
                        let status_error = self
                            .build_status_error(provider, model, status_code, request_id, response)
                            .await;

                        if attempt < self.retry_policy.max_attempts
                            && self.retry_policy.should_retry_status(status_code)
                        {
                            debug!(provider, attempt, status_code, "retrying upstream request");
                            self.sleep_before_retry(attempt).await;
                            continue;
                        }

                        warn!(provider, attempt, status_code, "upstream request failed");
                        return Err(status_error);
                    }

                    return Ok((response, request_id));
                }
                Err(error) => {
                    let transport_error = ProviderError::Transport {
                        provider: provider.to_string(),
                        request_id: None,
                        message: error.to_string(),
                    };

                    if attempt < self.retry_policy.max_attempts && is_retryable_transport(&error) {
                        debug!(provider, attempt, %error, "retrying upstream request");
                        self.sleep_before_retry(attempt).await;
                        continue;
                    }

                    warn!(provider, attempt, %error, "upstream request failed");
                    return Err(transport_error);
                }
            }
        }
    }

    async fn build_status_error(
        &self,
        provider: &str,
        model: Option<&str>,
        status_code: u16,
        request_id: Option<String>,
        response: Response,
    ) -> ProviderError {
        let message = match response.text().await {
            Ok(body) if !body.trim().is_empty() => body,
            Ok(_) => format!("http status {status_code}"),
            Err(error) => {
                format!("http status {status_code}; failed to read response body: {error}")
            }
        };

        if matches!(status_code, 401 | 403) {
            return ProviderError::CredentialsRejected {
                provider: provider.to_string(),
                request_id,
                message,
            };
        }

        ProviderError::Status {
            provider: provider.to_string(),
            model: model.map(str::to_string),
            status_code,
            request_id,
            message,
        }
    }

    fn build_header_config(
        &self,
        provider: &str,
        model: Option<&str>,
        ctx: &TransportContext,
    ) -> Result<HeaderConfig, ProviderError> {
        let request_id_header = match ctx.metadata.get(REQUEST_ID_HEADER_KEY) {
            Some(value) => parse_header_name(value, provider, model)?,
            None => HeaderName::from_static(DEFAULT_REQUEST_ID_HEADER),
        };

        let mut headers = HeaderMap::new();
        if let Some(token) = ctx.metadata.get(AUTH_BEARER_TOKEN_KEY) {
            let auth_value = parse_header_value(&format!("Bearer {token}"), provider, model)
                .map_err(|_| {
                    ProviderError::protocol(provider, model, "invalid bearer token header value")
                })?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        if let Some(request_id) = &ctx.request_id {
            headers.insert(
                request_id_header.clone(),
                parse_header_value(request_id, provider, model)?,
            );
        }

        for (key, value) in &ctx.metadata {
            if let Some(raw_name) = key.strip_prefix(CUSTOM_HEADER_PREFIX) {
                let header_name = parse_header_name(raw_name, provider, model)?;
                headers.insert(header_name, parse_header_value(value, provider, model)?);
            }
        }

        Ok(HeaderConfig {
            headers,
            request_id_header,
        })
    }

    fn validate_timeout(timeout_ms: u64) -> Result<(), ConfigError> {
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout { timeout_ms });
        }
        Ok(())
    }

    async fn sleep_before_retry(&self, attempt: u32) {
        let retry_index = attempt.saturating_sub(1);
        let backoff = self.retry_policy.backoff_duration_for_retry(retry_index);
        tokio::time::sleep(backoff).await;
    }
}

struct HeaderConfig {
    headers: HeaderMap,
    request_id_header: HeaderName,
}

fn encode_json<T>(provider: &str, model: Option<&str>, body: &T) -> Result<Vec<u8>, ProviderError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(body).map_err(|error| ProviderError::Serialization {
        provider: provider.to_string(),
        model: model.map(str::to_string),
        request_id: None,
        message: error.to_string(),
    })
}

async fn parse_json<TResp>(
    provider: &str,
    model: Option<&str>,
    request_id: Option<String>,
    response: Response,
) -> Result<TResp, ProviderError>
where
    TResp: DeserializeOwned,
{
    response
        .json::<TResp>()
        .await
        .map_err(|error| ProviderError::Serialization {
            provider: provider.to_string(),
            model: model.map(str::to_string),
            request_id,
            message: error.to_string(),
        })
}

fn parse_header_name(
    value: &str,
    provider: &str,
    model: Option<&str>,
) -> Result<HeaderName, ProviderError> {
    HeaderName::from_bytes(value.as_bytes()).map_err(|error| {
        ProviderError::protocol(
            provider,
            model,
            format!("invalid header name: {value}: {error}"),
        )
    })
}

fn parse_header_value(
    value: &str,
    provider: &str,
    model: Option<&str>,
) -> Result<HeaderValue, ProviderError> {
    HeaderValue::from_str(value).map_err(|error| {
        ProviderError::protocol(provider, model, format!("invalid header value: {error}"))
    })
}

fn extract_request_id(headers: &HeaderMap, request_id_header: &HeaderName) -> Option<String> {
    headers
        .get(request_id_header)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn is_retryable_transport(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}
