use async_trait::async_trait;

use crate::core::context::CallContext;
use crate::core::error::ProviderError;
use crate::core::types::{
    Capability, CapabilitySet, ChatRequest, ImageRequest, ImageResponse, RealtimeToken,
    RealtimeTokenRequest, RerankRequest, RerankResponse, SpeechRequest, SpeechResponse,
    StructuredRequest, StructuredResponse, TranscriptionRequest, TranscriptionResponse,
};
use crate::streaming::ProviderStream;

/// Provider adapter contract: one method per capability.
///
/// Adapters override the methods for the capabilities they declare in
/// [`ProviderAdapter::capabilities`]; every other method keeps its default,
/// which fails with [`ProviderError::CapabilityNotSupported`]. Adapters are
/// process-lifetime singletons and must not keep per-request state; anything
/// request-scoped lives in the [`CallContext`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry key, the part of a model id before the separator.
    fn key(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    /// Opens an upstream stream. Warnings recorded on `call` before this
    /// returns end up on the canonical `Finish` event.
    async fn chat_stream(
        &self,
        _req: &ChatRequest,
        _call: &mut CallContext,
    ) -> Result<ProviderStream, ProviderError> {
        Err(ProviderError::not_supported(self.key(), Capability::ChatStream))
    }

    async fn image(
        &self,
        _req: &ImageRequest,
        _call: &mut CallContext,
    ) -> Result<ImageResponse, ProviderError> {
        Err(ProviderError::not_supported(self.key(), Capability::Image))
    }

    async fn speech(
        &self,
        _req: &SpeechRequest,
        _call: &mut CallContext,
    ) -> Result<SpeechResponse, ProviderError> {
        Err(ProviderError::not_supported(self.key(), Capability::Speech))
    }

    async fn transcription(
        &self,
        _req: &TranscriptionRequest,
        _call: &mut CallContext,
    ) -> Result<TranscriptionResponse, ProviderError> {
        Err(ProviderError::not_supported(
            self.key(),
            Capability::Transcription,
        ))
    }

    async fn rerank(
        &self,
        _req: &RerankRequest,
        _call: &mut CallContext,
    ) -> Result<RerankResponse, ProviderError> {
        Err(ProviderError::not_supported(self.key(), Capability::Rerank))
    }

    async fn realtime_token(
        &self,
        _req: &RealtimeTokenRequest,
        _call: &mut CallContext,
    ) -> Result<RealtimeToken, ProviderError> {
        Err(ProviderError::not_supported(
            self.key(),
            Capability::RealtimeToken,
        ))
    }

    async fn structured_response(
        &self,
        _req: &StructuredRequest,
        _call: &mut CallContext,
    ) -> Result<StructuredResponse, ProviderError> {
        Err(ProviderError::not_supported(
            self.key(),
            Capability::StructuredResponse,
        ))
    }

    async fn structured_response_stream(
        &self,
        _req: &StructuredRequest,
        _call: &mut CallContext,
    ) -> Result<ProviderStream, ProviderError> {
        Err(ProviderError::not_supported(
            self.key(),
            Capability::StructuredResponseStream,
        ))
    }
}
