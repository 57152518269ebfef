use tracing::debug;

use crate::core::types::{Warning, WarningKind};

/// Request-scoped, append-only accumulator of [`Warning`]s.
///
/// Each inbound call owns exactly one collector; it is never shared across
/// requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarningCollector {
    warnings: Vec<Warning>,
}

impl WarningCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(
        &mut self,
        kind: WarningKind,
        feature: impl Into<String>,
        detail: Option<String>,
    ) {
        let warning = Warning {
            kind,
            feature: feature.into(),
            detail,
        };
        debug!(kind = ?warning.kind, feature = %warning.feature, "warning recorded");
        self.warnings.push(warning);
    }

    pub fn unsupported(&mut self, feature: impl Into<String>, detail: impl Into<String>) {
        self.append(WarningKind::Unsupported, feature, Some(detail.into()));
    }

    pub fn ignored(&mut self, feature: impl Into<String>, detail: impl Into<String>) {
        self.append(WarningKind::Ignored, feature, Some(detail.into()));
    }

    pub fn missing_field(&mut self, feature: impl Into<String>, detail: impl Into<String>) {
        self.append(
            WarningKind::ProviderResponseMissingField,
            feature,
            Some(detail.into()),
        );
    }

    pub fn push(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    pub fn extend(&mut self, warnings: impl IntoIterator<Item = Warning>) {
        self.warnings.extend(warnings);
    }

    /// Returns the accumulated warnings in append order and leaves the
    /// collector empty.
    pub fn drain(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    pub fn as_slice(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests;
