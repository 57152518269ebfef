use std::sync::Arc;
use std::time::Duration;

use provider_gateway::config::HttpConfig;
use provider_gateway::jobs::{JobPoller, PollPolicy, StatusVocabulary};
use provider_gateway::media::{MediaPolicy, MediaResolver};
use provider_gateway::providers::cohere::CohereAdapter;
use provider_gateway::providers::openai_compatible::OpenAiCompatibleAdapter;
use provider_gateway::registry::parse_model_id;
use provider_gateway::warnings::WarningCollector;
use provider_gateway::{GatewayConfig, GatewayRuntime, GatewayRuntimeBuilder, RequestContext};

#[test]
fn test_public_api_compiles() {
    let _builder: GatewayRuntimeBuilder = GatewayRuntime::builder();

    let config = GatewayConfig {
        http: HttpConfig::default(),
        poll: PollPolicy::fixed(Duration::from_millis(500)).with_max_attempts(20),
        media: MediaPolicy::default(),
    };
    config.validate().expect("valid config");

    let runtime = GatewayRuntime::builder()
        .with_config(config.clone())
        .with_adapter(Arc::new(
            OpenAiCompatibleAdapter::new(None).expect("openai adapter"),
        ))
        .with_adapter(Arc::new(CohereAdapter::new(None).expect("cohere adapter")))
        .build()
        .expect("runtime");

    assert_eq!(runtime.registry().keys().collect::<Vec<_>>(), vec!["openai", "cohere"]);
    assert_eq!(runtime.config(), &config);

    let resolved = runtime.resolve("openai/gpt-4.1-mini").expect("resolve");
    assert_eq!(resolved.upstream_model, "gpt-4.1-mini");

    let parsed = parse_model_id("cohere:rerank-v3.5").expect("parse");
    assert_eq!(parsed.provider_key, "cohere");

    let _poller = JobPoller::new(config.poll.clone()).expect("poller");
    let _vocabulary = StatusVocabulary::new(&["queued"], &["done"], &["error"]);
    let _resolver = MediaResolver::new(MediaPolicy::default()).expect("resolver");
    let _warnings = WarningCollector::new();
    let _ctx = RequestContext::new().with_request_id("req-1");
}
