//! Name → partition → server resolution.
//!
//! Clients and servers call the same functions here; a disagreement between
//! the two is exactly the stale-mapping signal.

use super::partition_map::{depth_of, parent_of, PartitionMap};
use super::types::{PartitionIndex, ServerId};
use super::NAME_HASH_SEED;
use xxhash_rust::xxh64::xxh64;

/// Stable hash of an entry name, identical on every process.
#[inline]
pub fn name_hash(name: &str) -> u64 {
    xxh64(name.as_bytes(), NAME_HASH_SEED)
}

/// Resolve a hash to the deepest existing partition whose index matches the
/// low-order bits of the hash.
pub fn index_for_hash(map: &PartitionMap, hash: u64) -> PartitionIndex {
    let mask = (1u64 << map.radix()) - 1;
    let mut candidate = (hash & mask) as PartitionIndex;

    // Partition 0 always exists, and every step strictly lowers the depth.
    while !map.exists(candidate) {
        candidate = parent_of(candidate);
    }
    candidate
}

/// Partition that currently owns `name` under `map`.
#[inline]
pub fn index_for_name(map: &PartitionMap, name: &str) -> PartitionIndex {
    index_for_hash(map, name_hash(name))
}

/// `(partition, server)` that currently owns `name` under `map`.
#[inline]
pub fn server_for_name(map: &PartitionMap, name: &str) -> (PartitionIndex, ServerId) {
    let index = index_for_name(map, name);
    (index, map.server_for_index(index))
}

/// Whether a name moves into `child` when its parent splits.
#[inline]
pub fn belongs_to_child(name: &str, child: PartitionIndex) -> bool {
    hash_belongs_to_child(name_hash(name), child)
}

#[inline]
pub fn hash_belongs_to_child(hash: u64, child: PartitionIndex) -> bool {
    let mask = (1u64 << depth_of(child)) - 1;
    hash & mask == child as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MAX_RADIX;
    use proptest::prelude::*;

    #[test]
    fn test_single_partition() {
        let map = PartitionMap::new(0, 4).unwrap();
        for i in 0..100 {
            assert_eq!(index_for_name(&map, &format!("file{}", i)), 0);
        }
    }

    #[test]
    fn test_hash_is_stable() {
        // 固定値: クライアントとサーバーで一致しなければならない
        assert_eq!(name_hash("a"), name_hash("a"));
        assert_ne!(name_hash("a"), name_hash("b"));
        assert_eq!(name_hash(""), 0xef46db3751d8e999);
    }

    #[test]
    fn test_resolution_after_split() {
        let mut map = PartitionMap::new(0, 2).unwrap();
        map.mark_split(1).unwrap();

        for hash in 0u64..16 {
            let expected = (hash & 1) as PartitionIndex;
            assert_eq!(index_for_hash(&map, hash), expected);
        }

        // 0 -> 2 の分割: 下位2ビットが 10 のハッシュだけが移動する
        map.mark_split(2).unwrap();
        assert_eq!(index_for_hash(&map, 0b00), 0);
        assert_eq!(index_for_hash(&map, 0b10), 2);
        assert_eq!(index_for_hash(&map, 0b01), 1);
        // パーティション3は存在しないので1に落ちる
        assert_eq!(index_for_hash(&map, 0b11), 1);
    }

    #[test]
    fn test_belongs_to_child() {
        assert!(hash_belongs_to_child(0b1, 1));
        assert!(!hash_belongs_to_child(0b10, 1));
        assert!(hash_belongs_to_child(0b110, 2));
        assert!(hash_belongs_to_child(0b011, 3));
        assert!(!hash_belongs_to_child(0b001, 3));
    }

    #[test]
    fn test_server_for_name_matches_index() {
        let mut map = PartitionMap::new(1, 3).unwrap();
        map.mark_split(1).unwrap();
        map.mark_split(2).unwrap();

        for i in 0..50 {
            let name = format!("entry-{}", i);
            let (index, server) = server_for_name(&map, &name);
            assert_eq!(index, index_for_name(&map, &name));
            assert_eq!(server, map.server_for_index(index));
        }
    }

    /// ランダムな分割列からマップを構築する
    fn build_map(splits: &[u32]) -> PartitionMap {
        let mut map = PartitionMap::new(0, 4).unwrap();
        for pick in splits {
            let existing: Vec<_> = map.partitions().filter(|p| map.can_split(*p)).collect();
            if existing.is_empty() {
                break;
            }
            let parent = existing[*pick as usize % existing.len()];
            let child = map.compute_child_index(parent).unwrap();
            map.mark_split(child).unwrap();
        }
        map
    }

    proptest! {
        #[test]
        fn prop_resolution_is_total(splits in prop::collection::vec(any::<u32>(), 0..40), hash in any::<u64>()) {
            let map = build_map(&splits);
            let index = index_for_hash(&map, hash);

            // 結果は存在するパーティションで、ハッシュの下位ビットと一致する
            prop_assert!(map.exists(index));
            let mask = (1u64 << depth_of(index)) - 1;
            prop_assert_eq!(hash & mask, index as u64);

            // より深い候補はすべて存在しない
            for d in (depth_of(index) + 1)..=map.radix() {
                let deeper = (hash & ((1u64 << d) - 1)) as PartitionIndex;
                prop_assert!(deeper == index || !map.exists(deeper));
            }
            prop_assert!(map.radix() <= MAX_RADIX);
            prop_assert_eq!(map.highest_set_depth(), map.radix());
        }

        #[test]
        fn prop_split_is_monotonic(splits in prop::collection::vec(any::<u32>(), 0..30), pick in any::<u32>(), hash in any::<u64>()) {
            let before = build_map(&splits);
            let candidates: Vec<_> = before.partitions().filter(|p| before.can_split(*p)).collect();
            prop_assume!(!candidates.is_empty());

            let parent = candidates[pick as usize % candidates.len()];
            let child = before.compute_child_index(parent).unwrap();
            let mut after = before;
            after.mark_split(child).unwrap();

            prop_assert!(after.radix() >= before.radix());
            prop_assert!(after.covers(&before));

            let old = index_for_hash(&before, hash);
            let new = index_for_hash(&after, hash);
            if old == parent {
                prop_assert!(new == parent || new == child);
                prop_assert_eq!(new == child, hash_belongs_to_child(hash, child));
            } else {
                prop_assert_eq!(old, new);
            }
        }
    }
}
