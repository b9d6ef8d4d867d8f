//! Property-based tests for app-updater.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Property 1: Version ordering is a total order that ignores build
//!   metadata and ranks prereleases below their release
//! - Property 2: Channel isolation for stable clients
//! - Property 3: Selection picks the highest eligible version
//! - Property 4: Staged rollout admission is sticky and monotonic
//! - Property 5: Digest mismatches never verify

#![cfg(test)]

use proptest::prelude::*;
use uuid::Uuid;

use crate::channel::ReleaseChannel;
use crate::eligibility::tests::entry;
use crate::eligibility::UpdateEligibilityPolicy;
use crate::rollout::RolloutBucket;
use crate::verify::{DigestAccumulator, DigestAlgorithm, ExpectedDigest, IntegrityVerifier};
use crate::version::AppVersion;

// =============================================================================
// Generators
// =============================================================================

fn arb_triple() -> impl Strategy<Value = (u64, u64, u64)> {
    (0u64..20, 0u64..20, 0u64..20)
}

/// Version string, optionally with a channel prerelease tag.
fn arb_version_string() -> impl Strategy<Value = String> {
    (
        arb_triple(),
        prop_oneof![
            Just(None),
            (1u32..5).prop_map(|n| Some(format!("beta.{n}"))),
            (1u32..5).prop_map(|n| Some(format!("alpha.{n}"))),
        ],
    )
        .prop_map(|((major, minor, patch), pre)| match pre {
            Some(pre) => format!("{major}.{minor}.{patch}-{pre}"),
            None => format!("{major}.{minor}.{patch}"),
        })
}

fn arb_feed() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_version_string(), 0..12)
}

fn digest_of(data: &[u8]) -> crate::verify::ComputedDigest {
    let mut acc = DigestAccumulator::new(DigestAlgorithm::Sha256);
    acc.update(data);
    acc.finalize()
}

// =============================================================================
// Property 1: Version ordering
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_build_metadata_ignored((major, minor, patch) in arb_triple(), build in "[a-z0-9]{1,8}") {
        let plain = AppVersion::new(major, minor, patch);
        let tagged = AppVersion::parse(&format!("{major}.{minor}.{patch}+{build}")).unwrap();
        prop_assert_eq!(&plain, &tagged);
        prop_assert!(!tagged.is_newer_than(&plain));
    }

    #[test]
    fn prop_prerelease_below_release((major, minor, patch) in arb_triple(), n in 0u32..10) {
        let release = AppVersion::new(major, minor, patch);
        let pre = AppVersion::parse(&format!("{major}.{minor}.{patch}-beta.{n}")).unwrap();
        prop_assert!(pre < release);
        prop_assert!(release.is_newer_than(&pre));
    }

    #[test]
    fn prop_ordering_is_antisymmetric(a in arb_version_string(), b in arb_version_string()) {
        let a = AppVersion::parse(&a).unwrap();
        let b = AppVersion::parse(&b).unwrap();
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a == b, a.cmp(&b) == std::cmp::Ordering::Equal);
    }

    #[test]
    fn prop_ordering_is_transitive(
        a in arb_version_string(),
        b in arb_version_string(),
        c in arb_version_string(),
    ) {
        let mut versions = [a, b, c].map(|v| AppVersion::parse(&v).unwrap());
        versions.sort();
        let [low, mid, high] = &versions;
        prop_assert!(low <= mid && mid <= high);
        prop_assert!(low <= high);
        if low < mid || mid < high {
            prop_assert!(low < high);
        }
    }

    /// Sorting agrees with every pairwise comparison.
    #[test]
    fn prop_sort_matches_pairwise(raw in prop::collection::vec(arb_version_string(), 0..16)) {
        let mut versions: Vec<AppVersion> =
            raw.iter().map(|v| AppVersion::parse(v).unwrap()).collect();
        versions.sort();
        for (i, lower) in versions.iter().enumerate() {
            for higher in &versions[i..] {
                prop_assert!(!lower.is_newer_than(higher));
            }
        }
    }
}

// =============================================================================
// Property 2: Channel isolation
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A stable client without prerelease opt-in never selects a beta or
    /// alpha release, whatever the feed contains.
    #[test]
    fn prop_stable_never_selects_prerelease(feed in arb_feed()) {
        let entries: Vec<_> = feed.iter().map(|v| entry(v, None)).collect();
        let policy = UpdateEligibilityPolicy::new(ReleaseChannel::Stable);

        let result = policy.select(&AppVersion::new(0, 0, 0), &entries);
        if let Some(selected) = result.selected_entry {
            prop_assert_eq!(selected.channel, ReleaseChannel::Stable);
            prop_assert!(!selected.version.is_prerelease());
        }
    }
}

// =============================================================================
// Property 3: Highest eligible version wins
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_selects_highest_newer_version(feed in arb_feed(), current in arb_version_string()) {
        let current = AppVersion::parse(&current).unwrap();
        let entries: Vec<_> = feed.iter().map(|v| entry(v, None)).collect();
        let policy = UpdateEligibilityPolicy::new(ReleaseChannel::Alpha);

        let best = entries
            .iter()
            .map(|e| &e.version)
            .filter(|v| v.is_newer_than(&current))
            .max();

        let result = policy.select(&current, &entries);
        prop_assert_eq!(result.is_update_available, best.is_some());
        prop_assert_eq!(result.selected_entry.as_ref().map(|e| &e.version), best);
    }
}

// =============================================================================
// Property 4: Staged rollout
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_bucket_in_range(bytes in prop::array::uniform16(any::<u8>())) {
        let bucket = RolloutBucket::from_install_id(&Uuid::from_bytes(bytes));
        prop_assert!(bucket.value() < 100);
    }

    /// Same install, same feed, same answer; and raising the percentage
    /// never removes an install that was already admitted.
    #[test]
    fn prop_staging_sticky_and_monotonic(
        bytes in prop::array::uniform16(any::<u8>()),
        p in 0u8..=100,
        q in 0u8..=100,
    ) {
        let bucket = RolloutBucket::from_install_id(&Uuid::from_bytes(bytes));
        let policy = UpdateEligibilityPolicy::new(ReleaseChannel::Stable).with_rollout_bucket(bucket);
        let current = AppVersion::new(1, 0, 0);
        let (low, high) = if p <= q { (p, q) } else { (q, p) };

        let first = policy.select(&current, &[entry("1.1.0", Some(low))]);
        let second = policy.select(&current, &[entry("1.1.0", Some(low))]);
        prop_assert_eq!(&first, &second);

        if first.is_update_available {
            let raised = policy.select(&current, &[entry("1.1.0", Some(high))]);
            prop_assert!(raised.is_update_available);
        }
        if low == 0 {
            prop_assert!(!first.is_update_available);
        }
    }
}

// =============================================================================
// Property 5: Digest verification
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_digest_mismatch_never_verifies(
        published in prop::collection::vec(any::<u8>(), 1..4096),
        flip in any::<prop::sample::Index>(),
    ) {
        let expected = {
            let computed = digest_of(&published);
            ExpectedDigest { algorithm: computed.algorithm, value: computed.value }
        };

        let mut tampered = published.clone();
        let i = flip.index(tampered.len());
        tampered[i] ^= 0x01;

        let verifier = IntegrityVerifier::new();
        let size = Some(published.len() as u64);
        prop_assert!(verifier
            .verify(&expected, size, None, &digest_of(&published), published.len() as u64)
            .is_ok());
        prop_assert!(verifier
            .verify(&expected, size, None, &digest_of(&tampered), tampered.len() as u64)
            .is_err());
    }
}
