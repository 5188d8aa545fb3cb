// tests/property_test.rs

//! Property-based checks of the routing algorithms: whatever bounds a
//! mapping ends up with, routing must send every key to the shard whose
//! range contains it.

use fabricd::core::sharding::lookup::{
    RouteEntry, ShardingKey, owned_range, route_hash, route_range, validate_bounds,
};
use proptest::prelude::*;

fn int_entries(bounds: Vec<i64>) -> Vec<RouteEntry> {
    let mut bounds = bounds;
    bounds.sort_unstable();
    bounds.dedup();
    bounds
        .into_iter()
        .enumerate()
        .map(|(i, b)| RouteEntry {
            shard_id: i as u64 + 1,
            bound: ShardingKey::Int(b),
        })
        .collect()
}

proptest! {
    #[test]
    fn routed_shard_owns_the_key(
        bounds in prop::collection::vec(-1000i64..1000, 1..12),
        key in -2000i64..2000,
    ) {
        let entries = int_entries(bounds);
        validate_bounds(&entries).unwrap();

        let key = ShardingKey::Int(key);
        match route_range(&entries, &key) {
            Ok(shard_id) => {
                let idx = entries.iter().position(|e| e.shard_id == shard_id).unwrap();
                let range = owned_range(&entries, idx);
                prop_assert!(range.contains(&key));
            }
            Err(_) => {
                // Only keys below every bound are unroutable.
                prop_assert!(key < entries[0].bound);
            }
        }
    }

    #[test]
    fn ranges_are_disjoint_and_cover_upward(
        bounds in prop::collection::vec(-1000i64..1000, 2..12),
        probe in -1000i64..1000,
    ) {
        let entries = int_entries(bounds);
        let key = ShardingKey::Int(probe);
        let owners: Vec<u64> = (0..entries.len())
            .filter(|idx| owned_range(&entries, *idx).contains(&key))
            .map(|idx| entries[idx].shard_id)
            .collect();
        if key >= entries[0].bound {
            prop_assert_eq!(owners.len(), 1);
        } else {
            prop_assert!(owners.is_empty());
        }
    }

    #[test]
    fn hash_routing_is_total_and_stable(
        bounds in prop::collection::vec("[0-9a-f]{32}", 1..8),
        key in any::<i64>(),
    ) {
        let mut bounds = bounds;
        bounds.sort();
        bounds.dedup();
        let entries: Vec<RouteEntry> = bounds
            .into_iter()
            .enumerate()
            .map(|(i, b)| RouteEntry {
                shard_id: i as u64 + 1,
                bound: ShardingKey::Str(b),
            })
            .collect();

        let key = ShardingKey::Int(key);
        let first = route_hash(&entries, &key).unwrap();
        let second = route_hash(&entries, &key).unwrap();
        prop_assert_eq!(first, second);
        prop_assert!(entries.iter().any(|e| e.shard_id == first));
    }
}
