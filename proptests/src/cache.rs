//! Property-based tests for hash cache invariants.
//!
//! - Digest canonicalisation: `<digest>` and `<digest>.<ext>` share a slot;
//!   paths shorter than 64 characters address nothing
//! - Size bound: entry count never exceeds `max_size` under any
//!   interleaving of `add`/`add_server`
//! - Peer lists are duplicate-free; removing the last peer removes the entry

use crate::strategies::*;
use blossom_gateway::cache::HashCache;
use proptest::prelude::*;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Any path of length >= 64 addresses the same slot as its 64-char prefix.
    #[test]
    fn prop_digest_canonicalisation(
        path in blob_path_strategy(),
        servers in server_set_strategy(4),
    ) {
        let cache = HashCache::new(Duration::from_secs(60), 100);
        cache.add(&path, servers.clone());

        let digest = &path[..64];
        prop_assert_eq!(cache.get(digest), Some(servers.clone()));
        prop_assert_eq!(cache.get(&format!("{digest}.zzz")), Some(servers));
    }

    /// Paths shorter than 64 characters are no-ops on every operation.
    #[test]
    fn prop_short_paths_are_noops(
        path in "[a-f0-9]{0,63}",
        servers in server_set_strategy(3),
    ) {
        let cache = HashCache::new(Duration::from_secs(60), 100);
        cache.add(&path, servers);
        cache.add_server(&path, "https://x.example");
        prop_assert_eq!(cache.get(&path), None);
        prop_assert!(cache.is_empty());
        cache.remove_server(&path, "https://x.example");
        cache.remove(&path);
        prop_assert!(cache.is_empty());
    }

    /// The entry count never exceeds max_size.
    #[test]
    fn prop_size_bound(
        ops in prop::collection::vec(
            (digest_strategy(), server_url_strategy(), any::<bool>()),
            1..200,
        ),
        max_size in 1usize..8,
    ) {
        let cache = HashCache::new(Duration::from_secs(60), max_size);
        for (digest, server, use_add) in ops {
            if use_add {
                cache.add(&digest, vec![server]);
            } else {
                cache.add_server(&digest, &server);
            }
            prop_assert!(cache.len() <= max_size);
        }
    }

    /// Peer lists hold no duplicates; removing the last peer removes the entry.
    #[test]
    fn prop_peer_list_dedup_and_removal(
        digest in digest_strategy(),
        servers in server_set_strategy(5),
    ) {
        let cache = HashCache::new(Duration::from_secs(60), 100);
        for server in &servers {
            cache.add_server(&digest, server);
            cache.add_server(&digest, server);
        }
        let listed = cache.get(&digest).unwrap();
        prop_assert_eq!(listed.len(), servers.len());

        for server in &servers {
            cache.remove_server(&digest, server);
        }
        prop_assert_eq!(cache.get(&digest), None);
        prop_assert!(cache.is_empty());
    }
}
