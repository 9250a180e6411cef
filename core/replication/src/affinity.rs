//! Region hint to preferred provider routing.
//!
//! A flat prefix table: the first rule whose prefix starts the (lowercased)
//! region hint decides the preferred provider, otherwise the default
//! provider is used. Swapping in latency-based routing only needs a
//! different [`RegionAffinity::preferred`].

use serde::{Deserialize, Serialize};

use tokenvault_common::ProviderId;

/// One prefix rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityRule {
    pub prefix: String,
    pub provider: ProviderId,
}

impl AffinityRule {
    pub fn new(prefix: impl Into<String>, provider: ProviderId) -> Self {
        Self {
            prefix: prefix.into(),
            provider,
        }
    }
}

/// Ordered prefix table plus fallback provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAffinity {
    pub rules: Vec<AffinityRule>,
    pub default_provider: ProviderId,
}

impl RegionAffinity {
    /// Preferred provider for `region_hint`.
    pub fn preferred(&self, region_hint: &str) -> &ProviderId {
        let hint = region_hint.trim().to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| hint.starts_with(&rule.prefix.to_ascii_lowercase()))
            .map(|rule| &rule.provider)
            .unwrap_or(&self.default_provider)
    }

    /// Every provider referenced by the table.
    pub fn referenced_providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.rules
            .iter()
            .map(|rule| &rule.provider)
            .chain(std::iter::once(&self.default_provider))
    }
}

impl Default for RegionAffinity {
    fn default() -> Self {
        Self {
            rules: vec![
                AffinityRule::new("us-", ProviderId::AWS),
                AffinityRule::new("ca-", ProviderId::AWS),
                AffinityRule::new("europe-", ProviderId::AZURE),
                AffinityRule::new("uk-", ProviderId::AZURE),
                AffinityRule::new("asia-", ProviderId::GCP),
                AffinityRule::new("australia-", ProviderId::GCP),
            ],
            default_provider: ProviderId::AWS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let affinity = RegionAffinity::default();
        assert_eq!(affinity.preferred("us-east-1"), &ProviderId::AWS);
        assert_eq!(affinity.preferred("ca-central-1"), &ProviderId::AWS);
        assert_eq!(affinity.preferred("europe-west4"), &ProviderId::AZURE);
        assert_eq!(affinity.preferred("uk-south"), &ProviderId::AZURE);
        assert_eq!(affinity.preferred("asia-northeast1"), &ProviderId::GCP);
        assert_eq!(affinity.preferred("australia-southeast1"), &ProviderId::GCP);
    }

    #[test]
    fn test_unknown_and_empty_hints_use_default() {
        let affinity = RegionAffinity::default();
        assert_eq!(affinity.preferred("sa-east-1"), &ProviderId::AWS);
        assert_eq!(affinity.preferred(""), &ProviderId::AWS);
    }

    #[test]
    fn test_hint_case_and_whitespace() {
        let affinity = RegionAffinity::default();
        assert_eq!(affinity.preferred("  Europe-North1 "), &ProviderId::AZURE);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let affinity = RegionAffinity {
            rules: vec![
                AffinityRule::new("eu-central", ProviderId::GCP),
                AffinityRule::new("eu-", ProviderId::AZURE),
            ],
            default_provider: ProviderId::AWS,
        };
        assert_eq!(affinity.preferred("eu-central-1"), &ProviderId::GCP);
        assert_eq!(affinity.preferred("eu-west-1"), &ProviderId::AZURE);
        assert_eq!(affinity.referenced_providers().count(), 3);
    }
}
