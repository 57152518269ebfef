use serde_json::Value;
use thiserror::Error;

use crate::core::types::Capability;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid timeout: {timeout_ms} ms")]
    InvalidTimeout { timeout_ms: u64 },
    #[error("invalid retry policy: {reason}")]
    InvalidRetryPolicy { reason: String },
    #[error("invalid poll policy: {reason}")]
    InvalidPollPolicy { reason: String },
    #[error("invalid media policy: {reason}")]
    InvalidMediaPolicy { reason: String },
    #[error("invalid provider key {key:?}: {reason}")]
    InvalidProviderKey { key: String, reason: String },
    #[error("provider key registered twice: {key}")]
    DuplicateProviderKey { key: String },
    #[error("invalid environment variable {name}: {reason}")]
    InvalidEnvVar { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("malformed model id {model:?}: {reason}")]
    MalformedModelId { model: String, reason: String },
    #[error("unknown provider {provider:?} for model {model}")]
    UnknownProvider { provider: String, model: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("capability not supported [provider={provider}, capability={capability}]")]
    CapabilityNotSupported {
        provider: String,
        capability: Capability,
    },
    #[error(
        "provider credentials rejected{context}: {message}",
        context = format_context(Some(.provider), None, .request_id.as_deref(), None)
    )]
    CredentialsRejected {
        provider: String,
        request_id: Option<String>,
        message: String,
    },
    #[error(
        "provider transport error{context}: {message}",
        context = format_context(Some(.provider), None, .request_id.as_deref(), None)
    )]
    Transport {
        provider: String,
        request_id: Option<String>,
        message: String,
    },
    #[error(
        "provider status error{context}: {message}",
        context = format_context(
            Some(.provider),
            .model.as_deref(),
            .request_id.as_deref(),
            Some(*.status_code)
        )
    )]
    Status {
        provider: String,
        model: Option<String>,
        status_code: u16,
        request_id: Option<String>,
        message: String,
    },
    #[error(
        "provider protocol error{context}: {message}",
        context = format_context(
            Some(.provider),
            .model.as_deref(),
            .request_id.as_deref(),
            None
        )
    )]
    Protocol {
        provider: String,
        model: Option<String>,
        request_id: Option<String>,
        message: String,
    },
    #[error(
        "provider serialization error{context}: {message}",
        context = format_context(
            Some(.provider),
            .model.as_deref(),
            .request_id.as_deref(),
            None
        )
    )]
    Serialization {
        provider: String,
        model: Option<String>,
        request_id: Option<String>,
        message: String,
    },
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("provider call canceled [provider={provider}]")]
    Canceled { provider: String },
}

impl ProviderError {
    pub fn not_supported(provider: impl Into<String>, capability: Capability) -> Self {
        Self::CapabilityNotSupported {
            provider: provider.into(),
            capability,
        }
    }

    pub fn protocol(
        provider: impl Into<String>,
        model: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            provider: provider.into(),
            model: model.map(str::to_string),
            request_id: None,
            message: message.into(),
        }
    }
}

/// Outcome of a job that did not reach a successful terminal state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    #[error(
        "job timed out [job_id={job_id}, attempts={attempts}, elapsed_ms={elapsed_ms}]{payload}",
        payload = format_payload(.last_payload.as_ref())
    )]
    TimedOut {
        job_id: String,
        attempts: u32,
        elapsed_ms: u64,
        last_payload: Option<Value>,
    },
    #[error(
        "job attempts exhausted [job_id={job_id}, attempts={attempts}]{payload}",
        payload = format_payload(.last_payload.as_ref())
    )]
    AttemptsExhausted {
        job_id: String,
        attempts: u32,
        last_payload: Option<Value>,
    },
    #[error("job poll transport error [job_id={job_id}, attempt={attempt}]: {source}")]
    PollTransport {
        job_id: String,
        attempt: u32,
        #[source]
        source: Box<ProviderError>,
    },
    #[error(
        "job failed [job_id={job_id}]: {reason_text}{payload}",
        reason_text = .reason.as_deref().unwrap_or("no reason reported"),
        payload = format_payload(.last_payload.as_ref())
    )]
    Failed {
        job_id: String,
        reason: Option<String>,
        last_payload: Option<Value>,
    },
    #[error(
        "job canceled [job_id={job}, attempts={attempts}]",
        job = .job_id.as_deref().unwrap_or("unsubmitted")
    )]
    Canceled {
        job_id: Option<String>,
        attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("unsafe media target {target}: {reason}")]
    UnsafeTarget { target: String, reason: String },
    #[error(
        "unexpected content type for {target}: expected {expected}, got {actual_type}",
        actual_type = .actual.as_deref().unwrap_or("none")
    )]
    UnexpectedContentType {
        target: String,
        expected: String,
        actual: Option<String>,
    },
    #[error("media payload too large for {target}: limit is {limit_bytes} bytes")]
    PayloadTooLarge { target: String, limit_bytes: u64 },
    #[error(
        "media transport error for {target}{status}: {message}",
        status = format_context(None, None, None, *.status_code)
    )]
    Transport {
        target: String,
        status_code: Option<u16>,
        message: String,
    },
    #[error("invalid media reference: {reason}")]
    InvalidReference { reason: String },
    #[error("media fetch canceled for {target}")]
    Canceled { target: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    ConfigError(#[from] ConfigError),
    #[error(transparent)]
    RoutingError(#[from] RoutingError),
    #[error("capability not supported [provider={provider}, model={model}, capability={capability}]")]
    CapabilityNotSupported {
        provider: String,
        model: String,
        capability: Capability,
    },
    #[error(
        "transport error{context}: {message}",
        context = format_context(
            .provider.as_ref(),
            .model.as_deref(),
            .request_id.as_deref(),
            None
        )
    )]
    TransportError {
        provider: Option<String>,
        model: Option<String>,
        request_id: Option<String>,
        message: String,
    },
    #[error(
        "provider protocol error{context}: {message}",
        context = format_context(
            .provider.as_ref(),
            .model.as_deref(),
            .request_id.as_deref(),
            *.status_code
        )
    )]
    ProviderProtocolError {
        provider: Option<String>,
        model: Option<String>,
        request_id: Option<String>,
        status_code: Option<u16>,
        message: String,
    },
    #[error(
        "serialization error{context}: {message}",
        context = format_context(
            .provider.as_ref(),
            .model.as_deref(),
            .request_id.as_deref(),
            None
        )
    )]
    SerializationError {
        provider: Option<String>,
        model: Option<String>,
        request_id: Option<String>,
        message: String,
    },
    #[error(transparent)]
    JobError(#[from] JobError),
    #[error(transparent)]
    MediaError(#[from] MediaError),
    #[error(
        "request canceled{context}",
        context = format_context(.provider.as_ref(), .model.as_deref(), None, None)
    )]
    Canceled {
        provider: Option<String>,
        model: Option<String>,
    },
}

impl RuntimeError {
    /// Attaches the resolved model name where the provider layer left it out.
    pub(crate) fn with_model(mut self, resolved_model: &str) -> Self {
        match &mut self {
            Self::TransportError { model, .. }
            | Self::ProviderProtocolError { model, .. }
            | Self::SerializationError { model, .. }
            | Self::Canceled { model, .. } => {
                if model.is_none() {
                    *model = Some(resolved_model.to_string());
                }
            }
            Self::CapabilityNotSupported { model, .. } => {
                if model.is_empty() {
                    *model = resolved_model.to_string();
                }
            }
            _ => {}
        }
        self
    }

    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Canceled { .. }
                | Self::JobError(JobError::Canceled { .. })
                | Self::MediaError(MediaError::Canceled { .. })
        )
    }
}

impl From<ProviderError> for RuntimeError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::CapabilityNotSupported {
                provider,
                capability,
            } => Self::CapabilityNotSupported {
                provider,
                model: String::new(),
                capability,
            },
            ProviderError::Transport {
                provider,
                request_id,
                message,
            } => Self::TransportError {
                provider: Some(provider),
                model: None,
                request_id,
                message,
            },
            ProviderError::Serialization {
                provider,
                model,
                request_id,
                message,
            } => Self::SerializationError {
                provider: Some(provider),
                model,
                request_id,
                message,
            },
            ProviderError::CredentialsRejected {
                provider,
                request_id,
                message,
            } => Self::ProviderProtocolError {
                provider: Some(provider),
                model: None,
                request_id,
                status_code: None,
                message,
            },
            ProviderError::Status {
                provider,
                model,
                status_code,
                request_id,
                message,
            } => Self::ProviderProtocolError {
                provider: Some(provider),
                model,
                request_id,
                status_code: Some(status_code),
                message,
            },
            ProviderError::Protocol {
                provider,
                model,
                request_id,
                message,
            } => Self::ProviderProtocolError {
                provider: Some(provider),
                model,
                request_id,
                status_code: None,
                message,
            },
            ProviderError::Job(error) => Self::JobError(error),
            ProviderError::Media(error) => Self::MediaError(error),
            ProviderError::Canceled { provider } => Self::Canceled {
                provider: Some(provider),
                model: None,
            },
        }
    }
}

fn format_payload(payload: Option<&Value>) -> String {
    match payload {
        Some(value) => format!(" last_payload={value}"),
        None => String::new(),
    }
}

fn format_context(
    provider: Option<&String>,
    model: Option<&str>,
    request_id: Option<&str>,
    status_code: Option<u16>,
) -> String {
    let mut context = Vec::new();

    if let Some(provider) = provider {
        context.push(format!("provider={provider}"));
    }
    if let Some(model) = model {
        context.push(format!("model={model}"));
    }
    if let Some(request_id) = request_id {
        context.push(format!("request_id={request_id}"));
    }
    if let Some(status_code) = status_code {
        context.push(format!("status_code={status_code}"));
    }

    if context.is_empty() {
        String::new()
    } else {
        format!(" [{}]", context.join(", "))
    }
}
