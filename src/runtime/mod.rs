use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::core::context::{CallContext, RequestContext};
use crate::core::error::{ConfigError, ProviderError, RuntimeError};
use crate::core::traits::ProviderAdapter;
use crate::core::types::{
    Capability, ChatRequest, ImageRequest, ImageResponse, RealtimeToken, RealtimeTokenRequest,
    RerankRequest, RerankResponse, SpeechRequest, SpeechResponse, StructuredRequest,
    StructuredResponse, TranscriptionRequest, TranscriptionResponse, Warning,
};
use crate::media::{HostResolver, MediaResolver};
use crate::registry::{ProviderRegistry, ResolvedModel};
use crate::streaming::{CanonicalStream, normalize};

/// Entry point for capability calls: resolves the model id, checks the
/// adapter declares the capability, invokes it under the caller's
/// cancellation token and attaches collected warnings to the result.
#[derive(Debug)]
pub struct GatewayRuntime {
    registry: ProviderRegistry,
    media: Arc<MediaResolver>,
    config: GatewayConfig,
}

pub struct GatewayRuntimeBuilder {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    config: GatewayConfig,
    host_resolver: Option<Arc<dyn HostResolver>>,
}

impl GatewayRuntime {
    pub fn builder() -> GatewayRuntimeBuilder {
        GatewayRuntimeBuilder {
            adapters: Vec::new(),
            config: GatewayConfig::default(),
            host_resolver: None,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn resolve(&self, model: &str) -> Result<ResolvedModel, RuntimeError> {
        Ok(self.registry.resolve(model)?)
    }

    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
        ctx: &RequestContext,
    ) -> Result<CanonicalStream, RuntimeError> {
        let (resolved, mut call) = self.prepare(&request.model, Capability::ChatStream, ctx)?;
        let inner = self
            .guarded(
                &resolved,
                ctx,
                resolved.adapter.chat_stream(request, &mut call),
            )
            .await?;
        Ok(normalize(inner, ctx.cancel.clone(), call.warnings))
    }

    pub async fn image(
        &self,
        request: &ImageRequest,
        ctx: &RequestContext,
    ) -> Result<ImageResponse, RuntimeError> {
        let (resolved, mut call) = self.prepare(&request.model, Capability::Image, ctx)?;
        let mut response = self
            .guarded(&resolved, ctx, resolved.adapter.image(request, &mut call))
            .await?;
        attach_warnings(&mut call, &mut response.warnings);
        Ok(response)
    }

    pub async fn speech(
        &self,
        request: &SpeechRequest,
        ctx: &RequestContext,
    ) -> Result<SpeechResponse, RuntimeError> {
        let (resolved, mut call) = self.prepare(&request.model, Capability::Speech, ctx)?;
        let mut response = self
            .guarded(&resolved, ctx, resolved.adapter.speech(request, &mut call))
            .await?;
        attach_warnings(&mut call, &mut response.warnings);
        Ok(response)
    }

    pub async fn transcription(
        &self,
        request: &TranscriptionRequest,
        ctx: &RequestContext,
    ) -> Result<TranscriptionResponse, RuntimeError> {
        let (resolved, mut call) =
            self.prepare(&request.model, Capability::Transcription, ctx)?;
        let mut response = self
            .guarded(
                &resolved,
                ctx,
                resolved.adapter.transcription(request, &mut call),
            )
            .await?;
        attach_warnings(&mut call, &mut response.warnings);
        Ok(response)
    }

    pub async fn rerank(
        &self,
        request: &RerankRequest,
        ctx: &RequestContext,
    ) -> Result<RerankResponse, RuntimeError> {
        let (resolved, mut call) = self.prepare(&request.model, Capability::Rerank, ctx)?;
        let mut response = self
            .guarded(&resolved, ctx, resolved.adapter.rerank(request, &mut call))
            .await?;
        attach_warnings(&mut call, &mut response.warnings);
        Ok(response)
    }

    pub async fn realtime_token(
        &self,
        request: &RealtimeTokenRequest,
        ctx: &RequestContext,
    ) -> Result<RealtimeToken, RuntimeError> {
        let (resolved, mut call) =
            self.prepare(&request.model, Capability::RealtimeToken, ctx)?;
        let mut response = self
            .guarded(
                &resolved,
                ctx,
                resolved.adapter.realtime_token(request, &mut call),
            )
            .await?;
        attach_warnings(&mut call, &mut response.warnings);
        Ok(response)
    }

    pub async fn structured_response(
        &self,
        request: &StructuredRequest,
        ctx: &RequestContext,
    ) -> Result<StructuredResponse, RuntimeError> {
        let (resolved, mut call) =
            self.prepare(&request.model, Capability::StructuredResponse, ctx)?;
        let mut response = self
            .guarded(
                &resolved,
                ctx,
                resolved.adapter.structured_response(request, &mut call),
            )
            .await?;
        attach_warnings(&mut call, &mut response.warnings);
        Ok(response)
    }

    pub async fn structured_response_stream(
        &self,
        request: &StructuredRequest,
        ctx: &RequestContext,
    ) -> Result<CanonicalStream, RuntimeError> {
        let (resolved, mut call) =
            self.prepare(&request.model, Capability::StructuredResponseStream, ctx)?;
        let inner = self
            .guarded(
                &resolved,
                ctx,
                resolved.adapter.structured_response_stream(request, &mut call),
            )
            .await?;
        Ok(normalize(inner, ctx.cancel.clone(), call.warnings))
    }

    fn prepare(
        &self,
        model: &str,
        capability: Capability,
        ctx: &RequestContext,
    ) -> Result<(ResolvedModel, CallContext), RuntimeError> {
        let resolved = self.registry.resolve(model)?;

        if !resolved.adapter.capabilities().contains(capability) {
            warn!(
                provider = %resolved.provider_key,
                model,
                %capability,
                "capability not supported by provider"
            );
            return Err(RuntimeError::CapabilityNotSupported {
                provider: resolved.provider_key,
                model: model.to_string(),
                capability,
            });
        }

        debug!(
            provider = %resolved.provider_key,
            upstream_model = %resolved.upstream_model,
            %capability,
            "dispatching capability call"
        );

        let call = CallContext::new(
            resolved.upstream_model.clone(),
            ctx,
            Arc::clone(&self.media),
        );
        Ok((resolved, call))
    }

    /// Runs one adapter call, racing it against the request's cancellation.
    async fn guarded<T, F>(
        &self,
        resolved: &ResolvedModel,
        ctx: &RequestContext,
        call: F,
    ) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!(provider = %resolved.provider_key, "capability call canceled");
                return Err(RuntimeError::Canceled {
                    provider: Some(resolved.provider_key.clone()),
                    model: Some(resolved.upstream_model.clone()),
                });
            }
            result = call => result,
        };

        result.map_err(|error| {
            warn!(provider = %resolved.provider_key, %error, "capability call failed");
            RuntimeError::from(error).with_model(&resolved.upstream_model)
        })
    }
}

/// Collector warnings come first, followed by any the adapter attached
/// to the result itself.
fn attach_warnings(call: &mut CallContext, response_warnings: &mut Vec<Warning>) {
    let mut warnings = call.warnings.drain();
    warnings.append(response_warnings);
    *response_warnings = warnings;
}

impl GatewayRuntimeBuilder {
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the system DNS resolver used by the media guard.
    pub fn with_host_resolver(mut self, host_resolver: Arc<dyn HostResolver>) -> Self {
        self.host_resolver = Some(host_resolver);
        self
    }

    pub fn build(self) -> Result<GatewayRuntime, ConfigError> {
        self.config.validate()?;

        let mut registry = ProviderRegistry::new();
        for adapter in self.adapters {
            registry.register(adapter)?;
        }

        let mut media = MediaResolver::new(self.config.media.clone())?;
        if let Some(host_resolver) = self.host_resolver {
            media = media.with_host_resolver(host_resolver);
        }

        Ok(GatewayRuntime {
            registry,
            media: Arc::new(media),
            config: self.config,
        })
    }
}
