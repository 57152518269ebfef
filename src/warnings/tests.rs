use super::WarningCollector;
use crate::core::types::{Warning, WarningKind};

#[test]
fn test_drain_returns_warnings_in_append_order_and_empties_collector() {
    let mut collector = WarningCollector::new();
    collector.unsupported("seed", "provider has no seed control");
    collector.ignored("size", "aspect_ratio takes precedence");
    collector.append(WarningKind::ProviderResponseMissingField, "usage", None);

    assert_eq!(collector.len(), 3);

    let drained = collector.drain();
    assert_eq!(
        drained,
        vec![
            Warning {
                kind: WarningKind::Unsupported,
                feature: "seed".to_string(),
                detail: Some("provider has no seed control".to_string()),
            },
            Warning {
                kind: WarningKind::Ignored,
                feature: "size".to_string(),
                detail: Some("aspect_ratio takes precedence".to_string()),
            },
            Warning {
                kind: WarningKind::ProviderResponseMissingField,
                feature: "usage".to_string(),
                detail: None,
            },
        ]
    );
    assert!(collector.is_empty());
    assert!(collector.drain().is_empty());
}

#[test]
fn test_collector_keeps_duplicates_verbatim() {
    let mut collector = WarningCollector::new();
    collector.missing_field("job.status", "unrecognized status \"queued\"");
    collector.missing_field("job.status", "unrecognized status \"queued\"");

    assert_eq!(collector.as_slice().len(), 2);
    assert_eq!(collector.as_slice()[0], collector.as_slice()[1]);
}

#[test]
fn test_extend_appends_after_existing_warnings() {
    let mut collector = WarningCollector::new();
    collector.ignored("temperature", "fixed by provider");
    collector.extend(vec![Warning {
        kind: WarningKind::Unsupported,
        feature: "tools".to_string(),
        detail: None,
    }]);

    let features = collector
        .drain()
        .into_iter()
        .map(|warning| warning.feature)
        .collect::<Vec<_>>();
    assert_eq!(features, vec!["temperature", "tools"]);
}
