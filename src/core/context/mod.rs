use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::error::{ConfigError, MediaError};
use crate::media::{MediaKind, MediaPolicy, MediaReference, MediaResolver, ResolvedMedia};
use crate::warnings::WarningCollector;

/// Caller-owned context for one inbound capability call.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub cancel: CancellationToken,
    pub request_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Per-invocation state handed to an adapter. Owned by exactly one call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Model name with the provider key stripped, passed upstream verbatim.
    pub upstream_model: String,
    pub request_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub cancel: CancellationToken,
    pub warnings: WarningCollector,
    media: Arc<MediaResolver>,
}

impl CallContext {
    pub fn new(
        upstream_model: impl Into<String>,
        request: &RequestContext,
        media: Arc<MediaResolver>,
    ) -> Self {
        Self {
            upstream_model: upstream_model.into(),
            request_id: request.request_id.clone(),
            metadata: request.metadata.clone(),
            cancel: request.cancel.clone(),
            warnings: WarningCollector::new(),
            media,
        }
    }

    /// Context with a default media policy, for adapters driven outside a runtime.
    pub fn standalone(upstream_model: impl Into<String>) -> Result<Self, ConfigError> {
        let media = MediaResolver::new(MediaPolicy::default())?;
        Ok(Self::new(
            upstream_model,
            &RequestContext::default(),
            Arc::new(media),
        ))
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn resolve_media(
        &self,
        reference: &MediaReference,
        kind: MediaKind,
    ) -> Result<ResolvedMedia, MediaError> {
        self.media.resolve(reference, kind, &self.cancel).await
    }
}
