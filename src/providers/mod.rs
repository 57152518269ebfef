pub mod cohere;
pub mod deepl;
pub mod openai_compatible;
pub(crate) mod openai_compatible_translate;
pub mod replicate;

use crate::core::context::CallContext;
use crate::core::error::ProviderError;

/// Where an adapter looks for its API key, in order: constructor argument,
/// request metadata, environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CredentialSource {
    pub provider: &'static str,
    pub metadata_key: &'static str,
    pub env_var: &'static str,
}

impl CredentialSource {
    pub fn resolve(
        &self,
        explicit: Option<&str>,
        call: &CallContext,
    ) -> Result<String, ProviderError> {
        if let Some(key) = explicit {
            return Ok(key.to_string());
        }

        if let Some(key) = call
            .metadata
            .get(self.metadata_key)
            .and_then(|value| sanitize_api_key(Some(value.clone())))
        {
            return Ok(key);
        }

        std::env::var(self.env_var)
            .ok()
            .and_then(|value| sanitize_api_key(Some(value)))
            .ok_or_else(|| {
                ProviderError::protocol(
                    self.provider,
                    Some(&call.upstream_model),
                    format!(
                        "missing {} API key; set {} metadata or {} env var",
                        self.provider, self.metadata_key, self.env_var
                    ),
                )
            })
    }
}

pub(crate) fn normalize_base_url(base_url: impl Into<String>, default: &str) -> String {
    let value = base_url.into();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return default.to_string();
    }

    trimmed.trim_end_matches('/').to_string()
}

pub(crate) fn sanitize_api_key(api_key: Option<String>) -> Option<String> {
    api_key.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
