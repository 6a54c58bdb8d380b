//! Conflict resolution.

use datasync_protocol::StoredRecord;

/// Chooses one of two divergent versions of the same record.
///
/// Called only when a local pending change and an inbound change for the
/// same key both carry a value. The engine stores whatever comes back as
/// the new authoritative version with `version = max(local, remote) + 1`;
/// the returned record's own version is ignored.
///
/// Implementations must be deterministic: every device resolving the same
/// pair must pick the same value, or the account never converges.
///
/// Closures of the right shape implement this trait.
pub trait ConflictResolver: Send + Sync {
    /// Returns the winning record.
    fn resolve(&self, local: &StoredRecord, remote: &StoredRecord) -> StoredRecord;
}

impl<F> ConflictResolver for F
where
    F: Fn(&StoredRecord, &StoredRecord) -> StoredRecord + Send + Sync,
{
    fn resolve(&self, local: &StoredRecord, remote: &StoredRecord) -> StoredRecord {
        self(local, remote)
    }
}

/// Default policy: the higher version wins; on equal versions the larger
/// checksum wins, so every device picks the same side.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionResolver;

impl ConflictResolver for VersionResolver {
    fn resolve(&self, local: &StoredRecord, remote: &StoredRecord) -> StoredRecord {
        let local_wins = (local.version, local.checksum) >= (remote.version, remote.checksum);
        if local_wins {
            local.clone()
        } else {
            remote.clone()
        }
    }
}

/// Runs `resolver` and stamps the winner as a new version above both inputs.
pub fn resolve_conflict(
    resolver: &dyn ConflictResolver,
    local: &StoredRecord,
    remote: &StoredRecord,
) -> StoredRecord {
    let winner = resolver.resolve(local, remote);
    let version = local.version.max(remote.version).saturating_add(1);
    StoredRecord::new(local.key.clone(), winner.value, version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasync_protocol::ObjectKey;
    use proptest::prelude::*;

    fn record(value: &[u8], version: u64) -> StoredRecord {
        StoredRecord::new(ObjectKey::new("Todo", "1"), value.to_vec(), version)
    }

    #[test]
    fn tie_is_symmetric() {
        let a = record(b"milk", 3);
        let b = record(b"bread", 3);
        let from_a = resolve_conflict(&VersionResolver, &a, &b);
        let from_b = resolve_conflict(&VersionResolver, &b, &a);
        assert_eq!(from_a.value, from_b.value);
        assert_eq!(from_a.version, 4);
        assert_eq!(from_b.version, 4);
    }

    #[test]
    fn closure_resolver() {
        let longest = |l: &StoredRecord, r: &StoredRecord| {
            if l.value.len() >= r.value.len() {
                l.clone()
            } else {
                r.clone()
            }
        };
        let resolved = resolve_conflict(&longest, &record(b"a", 9), &record(b"abc", 1));
        assert_eq!(resolved.value, b"abc".to_vec());
        assert_eq!(resolved.version, 10);
        assert_eq!(resolved.checksum, datasync_protocol::checksum(b"abc"));
    }

    #[test]
    fn identical_records_do_not_panic() {
        let a = record(b"same", u64::MAX);
        let resolved = resolve_conflict(&VersionResolver, &a, &a.clone());
        assert_eq!(resolved.value, b"same".to_vec());
    }

    proptest! {
        #[test]
        fn higher_version_wins_and_result_is_newer(
            local_value in prop::collection::vec(any::<u8>(), 0..16),
            remote_value in prop::collection::vec(any::<u8>(), 0..16),
            local_version in 0u64..1_000_000,
            remote_version in 0u64..1_000_000,
        ) {
            prop_assume!(local_version != remote_version);
            let local = record(&local_value, local_version);
            let remote = record(&remote_value, remote_version);

            let resolved = resolve_conflict(&VersionResolver, &local, &remote);
            let expected = if local_version > remote_version { &local_value } else { &remote_value };
            prop_assert_eq!(&resolved.value, expected);
            prop_assert!(resolved.version > local_version);
            prop_assert!(resolved.version > remote_version);
        }
    }
}
