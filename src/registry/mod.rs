use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::info;

use crate::core::error::{ConfigError, RoutingError};
use crate::core::traits::ProviderAdapter;

const SEPARATORS: [char; 2] = ['/', ':'];

/// Composite model id split at its first separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelId<'a> {
    pub provider_key: &'a str,
    pub upstream_model: &'a str,
}

/// Splits `"<provider>/<model>"` (or `"<provider>:<model>"`) at the first
/// separator. The upstream part is returned verbatim and may contain further
/// separators.
pub fn parse_model_id(model: &str) -> Result<ModelId<'_>, RoutingError> {
    let Some(split_at) = model.find(SEPARATORS) else {
        return Err(malformed(model, "missing provider separator ('/' or ':')"));
    };

    let provider_key = &model[..split_at];
    let upstream_model = &model[split_at + 1..];
    if provider_key.trim().is_empty() {
        return Err(malformed(model, "empty provider key"));
    }
    if upstream_model.trim().is_empty() {
        return Err(malformed(model, "empty upstream model name"));
    }

    Ok(ModelId {
        provider_key,
        upstream_model,
    })
}

/// Adapter selected for a model id, with the provider key stripped.
#[derive(Clone)]
pub struct ResolvedModel {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub provider_key: String,
    pub upstream_model: String,
}

impl fmt::Debug for ResolvedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedModel")
            .field("provider_key", &self.provider_key)
            .field("upstream_model", &self.upstream_model)
            .finish_non_exhaustive()
    }
}

/// Read-only-after-startup table of adapters keyed by provider key.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: IndexMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an adapter under its own key. Keys may themselves contain a
    /// separator (`"azure/openai"`), in which case they win over shorter keys
    /// for model ids they prefix.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> Result<(), ConfigError> {
        let key = adapter.key().to_string();
        validate_key(&key)?;

        if self.adapters.contains_key(&key) {
            return Err(ConfigError::DuplicateProviderKey { key });
        }

        info!(
            provider = %key,
            capabilities = ?adapter.capabilities().iter().collect::<Vec<_>>(),
            "provider adapter registered"
        );
        self.adapters.insert(key, adapter);
        Ok(())
    }

    /// Picks the adapter whose key is the longest prefix of `model` followed
    /// by a separator. Depends only on `model` and the registered keys.
    pub fn resolve(&self, model: &str) -> Result<ResolvedModel, RoutingError> {
        let parsed = parse_model_id(model)?;

        let best = self
            .adapters
            .iter()
            .filter_map(|(key, adapter)| {
                let rest = model.strip_prefix(key.as_str())?;
                let upstream = rest.strip_prefix(SEPARATORS)?;
                Some((key, adapter, upstream))
            })
            .max_by_key(|(key, _, _)| key.len());

        let Some((key, adapter, upstream_model)) = best else {
            return Err(RoutingError::UnknownProvider {
                provider: parsed.provider_key.to_string(),
                model: model.to_string(),
            });
        };

        if upstream_model.trim().is_empty() {
            return Err(malformed(model, "empty upstream model name"));
        }

        Ok(ResolvedModel {
            adapter: Arc::clone(adapter),
            provider_key: key.clone(),
            upstream_model: upstream_model.to_string(),
        })
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(key).map(Arc::clone)
    }

    /// Registered keys in registration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn validate_key(key: &str) -> Result<(), ConfigError> {
    let reason = if key.is_empty() {
        Some("key must not be empty")
    } else if key.starts_with(SEPARATORS) || key.ends_with(SEPARATORS) {
        Some("key must not start or end with a separator")
    } else if key.chars().any(char::is_whitespace) {
        Some("key must not contain whitespace")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ConfigError::InvalidProviderKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

fn malformed(model: &str, reason: &str) -> RoutingError {
    RoutingError::MalformedModelId {
        model: model.to_string(),
        reason: reason.to_string(),
    }
}
