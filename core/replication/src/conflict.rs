//! Conflict detection and resolution between provider copies of a record.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use tokenvault_common::{Metadata, ProviderId, SealedRecord};

/// Metadata key set on a record whose metadata was merged from divergent copies.
pub const CONFLICT_RESOLVED_KEY: &str = "conflict_resolved";
/// Metadata key holding the RFC 3339 time of the merge.
pub const CONFLICT_RESOLVED_AT_KEY: &str = "conflict_resolved_at";
/// Metadata key holding the number of versions that were merged.
pub const CONFLICT_VERSION_COUNT_KEY: &str = "conflict_version_count";

/// One provider's copy of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordVersion {
    pub provider: ProviderId,
    pub record: SealedRecord,
}

impl RecordVersion {
    pub fn new(provider: ProviderId, record: SealedRecord) -> Self {
        Self { provider, record }
    }
}

/// Last-writer-wins resolver.
///
/// When two versions share the newest timestamp, the version held by the
/// provider that comes first in `provider_priority` wins. Providers missing
/// from the priority list rank after all listed ones, in input order.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    provider_priority: Vec<ProviderId>,
}

impl ConflictResolver {
    /// Create a resolver breaking timestamp ties by `provider_priority`.
    pub fn new(provider_priority: Vec<ProviderId>) -> Self {
        Self { provider_priority }
    }

    fn rank(&self, provider: &ProviderId) -> usize {
        self.provider_priority
            .iter()
            .position(|p| p == provider)
            .unwrap_or(usize::MAX)
    }

    /// Pick the winning version.
    ///
    /// Returns `None` for no versions and the single version unchanged when
    /// there is only one.
    pub fn resolve(&self, versions: &[RecordVersion]) -> Option<RecordVersion> {
        let mut winner: Option<&RecordVersion> = None;
        for candidate in versions {
            winner = match winner {
                None => Some(candidate),
                Some(current) => {
                    let newer = candidate.record.timestamp > current.record.timestamp;
                    let tie_wins = candidate.record.timestamp == current.record.timestamp
                        && self.rank(&candidate.provider) < self.rank(&current.provider);
                    if newer || tie_wins {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        winner.cloned()
    }

    /// Pick the winner and, if the versions disagree, merge their metadata
    /// into it.
    pub fn resolve_and_merge(&self, versions: &[RecordVersion]) -> Option<RecordVersion> {
        let mut winner = self.resolve(versions)?;

        let diverged = versions
            .iter()
            .any(|v| Self::has_conflict(&winner.record, &v.record));
        if diverged {
            let sources: Vec<SealedRecord> = versions.iter().map(|v| v.record.clone()).collect();
            winner.record = Self::merge_metadata(&winner.record, &sources);
        }
        Some(winner)
    }

    /// Two records conflict when they describe the same token at different times.
    pub fn has_conflict(a: &SealedRecord, b: &SealedRecord) -> bool {
        a.token_id == b.token_id && a.timestamp != b.timestamp
    }

    /// Union the metadata of `target` and `sources` into a copy of `target`.
    ///
    /// On a key collision the value from the record with the later timestamp
    /// wins; on equal timestamps `target` wins, then earlier sources. The
    /// result also carries the conflict provenance keys, with the version
    /// count taken as `sources.len()` (callers pass every version, the
    /// target's own included).
    pub fn merge_metadata(target: &SealedRecord, sources: &[SealedRecord]) -> SealedRecord {
        let mut chosen: BTreeMap<String, (DateTime<Utc>, String)> = BTreeMap::new();

        for record in std::iter::once(target).chain(sources.iter()) {
            for (key, value) in &record.metadata {
                match chosen.get(key) {
                    Some((seen_at, _)) if *seen_at >= record.timestamp => {}
                    _ => {
                        chosen.insert(key.clone(), (record.timestamp, value.clone()));
                    }
                }
            }
        }

        let mut metadata: Metadata = chosen
            .into_iter()
            .map(|(key, (_, value))| (key, value))
            .collect();
        metadata.insert(CONFLICT_RESOLVED_KEY.to_string(), "true".to_string());
        metadata.insert(CONFLICT_RESOLVED_AT_KEY.to_string(), Utc::now().to_rfc3339());
        metadata.insert(
            CONFLICT_VERSION_COUNT_KEY.to_string(),
            sources.len().to_string(),
        );

        SealedRecord {
            metadata,
            ..target.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use tokenvault_common::TokenId;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn version(provider: ProviderId, secs: i64) -> RecordVersion {
        let record = SealedRecord::new(
            TokenId::new("tok_1").unwrap(),
            vec![secs as u8],
            vec![0; 12],
            "AES-256-GCM",
        )
        .with_timestamp(at(secs));
        RecordVersion::new(provider, record)
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(vec![ProviderId::AWS, ProviderId::AZURE, ProviderId::GCP])
    }

    #[test]
    fn test_resolve_empty() {
        assert!(resolver().resolve(&[]).is_none());
    }

    #[test]
    fn test_resolve_single_is_unchanged() {
        let v = version(ProviderId::GCP, 7);
        assert_eq!(resolver().resolve(std::slice::from_ref(&v)), Some(v));
    }

    #[test]
    fn test_last_writer_wins() {
        let v1 = version(ProviderId::AWS, 1);
        let v2 = version(ProviderId::AZURE, 5);
        let winner = resolver().resolve(&[v1, v2.clone()]).unwrap();
        assert_eq!(winner, v2);
    }

    #[test]
    fn test_tie_broken_by_provider_priority() {
        let from_gcp = version(ProviderId::GCP, 5);
        let from_azure = version(ProviderId::AZURE, 5);

        let winner = resolver()
            .resolve(&[from_gcp.clone(), from_azure.clone()])
            .unwrap();
        assert_eq!(winner.provider, ProviderId::AZURE);

        let winner = resolver().resolve(&[from_azure, from_gcp]).unwrap();
        assert_eq!(winner.provider, ProviderId::AZURE);
    }

    #[test]
    fn test_has_conflict() {
        let a = version(ProviderId::AWS, 1).record;
        let b = version(ProviderId::AWS, 2).record;
        let mut other_token = b.clone();
        other_token.token_id = TokenId::new("tok_2").unwrap();

        assert!(ConflictResolver::has_conflict(&a, &b));
        assert!(!ConflictResolver::has_conflict(&a, &a.clone()));
        assert!(!ConflictResolver::has_conflict(&a, &other_token));
    }

    #[test]
    fn test_merge_metadata_later_value_wins() {
        let old = version(ProviderId::AWS, 1)
            .record
            .with_metadata("status", "active")
            .with_metadata("merchant", "m-1");
        let new = version(ProviderId::AZURE, 9)
            .record
            .with_metadata("status", "suspended")
            .with_metadata("region", "eu");

        let merged = ConflictResolver::merge_metadata(&new, &[old.clone(), new.clone()]);

        assert_eq!(merged.metadata["status"], "suspended");
        assert_eq!(merged.metadata["merchant"], "m-1");
        assert_eq!(merged.metadata["region"], "eu");
        assert_eq!(merged.metadata[CONFLICT_RESOLVED_KEY], "true");
        assert_eq!(merged.metadata[CONFLICT_VERSION_COUNT_KEY], "2");
        assert!(merged.metadata.contains_key(CONFLICT_RESOLVED_AT_KEY));
        assert_eq!(merged.ciphertext, new.ciphertext);
        assert_eq!(merged.timestamp, new.timestamp);
    }

    #[test]
    fn test_resolve_and_merge_only_marks_divergent_versions() {
        let v = version(ProviderId::AWS, 3);
        let same = RecordVersion::new(ProviderId::GCP, v.record.clone());

        let winner = resolver().resolve_and_merge(&[v.clone(), same]).unwrap();
        assert_eq!(winner, v);

        let newer = version(ProviderId::GCP, 4);
        let winner = resolver().resolve_and_merge(&[v, newer]).unwrap();
        assert_eq!(winner.provider, ProviderId::GCP);
        assert_eq!(winner.record.metadata[CONFLICT_RESOLVED_KEY], "true");
    }

    proptest! {
        #[test]
        fn prop_winner_has_max_timestamp(stamps in proptest::collection::vec(0i64..1_000, 1..12)) {
            let providers = [ProviderId::AWS, ProviderId::AZURE, ProviderId::GCP];
            let versions: Vec<RecordVersion> = stamps
                .iter()
                .enumerate()
                .map(|(i, secs)| version(providers[i % 3].clone(), *secs))
                .collect();

            let winner = resolver().resolve(&versions).unwrap();
            let max = stamps.iter().max().copied().unwrap();
            prop_assert_eq!(winner.record.timestamp, at(max));
        }
    }
}
