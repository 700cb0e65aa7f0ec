//! Context configuration: build profile and feature negotiation

use crate::error::{ModuleError, ModuleResult};
use serde::{Deserialize, Serialize};

/// Features this build of the subsystem can enable
const SUPPORTED_FEATURES: &[&str] = &["binary-discovery", "debug-info"];

/// Default state of a feature that was not explicitly requested
pub(crate) fn feature_default(name: &str) -> bool {
    SUPPORTED_FEATURES.contains(&name)
}

/// Build profile the subsystem runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Optimized production profile
    #[default]
    Release,
    /// Development profile with extra diagnostics
    Dev,
}

/// Tri-state request for a named feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureFlag {
    /// Must be enabled; context construction fails otherwise
    Required,
    /// Enable when supported
    On,
    /// Keep disabled
    Off,
}

/// A feature request handed to context construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRequest {
    /// Feature name
    pub name: String,
    /// Requested state
    pub flag: FeatureFlag,
}

impl FeatureRequest {
    /// Convenience constructor
    pub fn new(name: impl Into<String>, flag: FeatureFlag) -> Self {
        Self {
            name: name.into(),
            flag,
        }
    }
}

/// Resolved status of one feature after context construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStatus {
    /// Feature name
    pub name: String,
    /// Whether the subsystem enabled it
    pub enabled: bool,
}

/// Configuration for constructing a module subsystem context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Build profile
    pub profile: Profile,
    /// Feature requests with tri-state flags
    pub features: Vec<FeatureRequest>,
}

impl ContextConfig {
    /// Configuration with the default profile and no feature requests
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the profile
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Add a feature request
    pub fn with_feature(mut self, name: impl Into<String>, flag: FeatureFlag) -> Self {
        self.features.push(FeatureRequest::new(name, flag));
        self
    }

    /// Resolve the requests against the features this build supports
    ///
    /// `Required` features that the build cannot enable fail construction.
    pub(crate) fn resolve_features(&self) -> ModuleResult<Vec<FeatureStatus>> {
        let mut statuses = Vec::with_capacity(self.features.len());
        for request in &self.features {
            let supported = SUPPORTED_FEATURES.contains(&request.name.as_str());
            let enabled = match request.flag {
                FeatureFlag::Required => {
                    if !supported {
                        return Err(ModuleError::UnsupportedFeature(request.name.clone()));
                    }
                    true
                }
                FeatureFlag::On => supported,
                FeatureFlag::Off => false,
            };
            statuses.push(FeatureStatus {
                name: request.name.clone(),
                enabled,
            });
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_supported_feature_is_enabled() {
        let config = ContextConfig::new().with_feature("binary-discovery", FeatureFlag::Required);
        let statuses = config.resolve_features().unwrap();
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].enabled);
    }

    #[test]
    fn required_unknown_feature_fails_construction() {
        let config = ContextConfig::new().with_feature("time-travel", FeatureFlag::Required);
        assert_eq!(
            config.resolve_features(),
            Err(ModuleError::UnsupportedFeature("time-travel".to_string()))
        );
    }

    #[test]
    fn optional_unknown_feature_resolves_disabled() {
        let config = ContextConfig::new()
            .with_feature("time-travel", FeatureFlag::On)
            .with_feature("debug-info", FeatureFlag::Off);
        let statuses = config.resolve_features().unwrap();
        assert!(!statuses[0].enabled);
        assert!(!statuses[1].enabled);
    }
}
