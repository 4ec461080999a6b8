//! Ordered, gap-free map of a collection's partition key ranges.
//!
//! A published map always covers `[Min, Max)` exactly once. Maps are
//! persistent (`im::OrdMap`), so splicing a split or merge into a new map
//! shares structure with the old one and readers holding the old snapshot are
//! unaffected.

use crate::core::{
    EffectiveKey, EffectiveKeyRange, PartitionKeyRange, Result, RoutingError,
};
use im::{HashSet as ImHashSet, OrdMap};

/// Partition key ranges of one collection keyed by their lower boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingMap {
    collection_rid: String,
    ranges: OrdMap<EffectiveKey, PartitionKeyRange>,
    /// Range ids known to have been split or merged away.
    gone: ImHashSet<String>,
    version: u64,
}

// Routing map behavior is split by concern, like the rest of the routing code.
include!("routing_map/construct_and_validate.rs");
include!("routing_map/lookups.rs");
include!("routing_map/splice.rs");

#[cfg(test)]
mod tests {
    use super::*;

    fn key(value: &str) -> EffectiveKey {
        EffectiveKey::from(value)
    }

    fn range(id: &str, min: EffectiveKey, max: EffectiveKey) -> PartitionKeyRange {
        PartitionKeyRange::new(id, min, max).unwrap()
    }

    fn two_range_map() -> RoutingMap {
        RoutingMap::try_new(
            "rid-catalog",
            vec![
                range("1", key("m"), EffectiveKey::Max),
                range("0", EffectiveKey::Min, key("m")),
            ],
        )
        .unwrap()
    }

    fn ids(ranges: &[PartitionKeyRange]) -> Vec<&str> {
        ranges.iter().map(|range| range.id.as_str()).collect()
    }

    #[test]
    fn lookup_finds_containing_range() {
        let map = two_range_map();
        assert_eq!(map.range_for_key(&EffectiveKey::Min).unwrap().id, "0");
        assert_eq!(map.range_for_key(&key("l")).unwrap().id, "0");
        assert_eq!(map.range_for_key(&key("m")).unwrap().id, "1");
        assert_eq!(map.range_for_key(&key("zzz")).unwrap().id, "1");
        assert!(map.range_for_key(&EffectiveKey::Max).is_none());
    }

    #[test]
    fn overlapping_returns_ordered_cover() {
        let map = two_range_map();
        let all = map.overlapping(&EffectiveKeyRange::full());
        assert_eq!(ids(&all), vec!["0", "1"]);

        let upper = map.overlapping(&EffectiveKeyRange::new(key("n"), key("p")).unwrap());
        assert_eq!(ids(&upper), vec!["1"]);

        let straddling = map.overlapping(&EffectiveKeyRange::new(key("a"), key("n")).unwrap());
        assert_eq!(ids(&straddling), vec!["0", "1"]);
    }

    #[test]
    fn incomplete_listing_is_rejected() {
        let gap = RoutingMap::try_new(
            "rid",
            vec![
                range("0", EffectiveKey::Min, key("f")),
                range("1", key("m"), EffectiveKey::Max),
            ],
        );
        assert!(gap.is_err());

        let short = RoutingMap::try_new("rid", vec![range("0", EffectiveKey::Min, key("m"))]);
        assert!(short.is_err());

        let overlap = RoutingMap::try_new(
            "rid",
            vec![
                range("0", EffectiveKey::Min, key("m")),
                range("1", key("m"), EffectiveKey::Max),
                range("2", key("m"), key("q")),
            ],
        );
        assert!(overlap.is_err());
    }

    #[test]
    fn parents_listed_next_to_children_are_dropped() {
        let map = RoutingMap::try_new(
            "rid",
            vec![
                range("0", EffectiveKey::Min, EffectiveKey::Max),
                range("1", EffectiveKey::Min, key("m")).with_parents(vec!["0".to_string()]),
                range("2", key("m"), EffectiveKey::Max).with_parents(vec!["0".to_string()]),
            ],
        )
        .unwrap();

        assert_eq!(map.len(), 2);
        assert!(map.is_gone("0"));
        assert!(!map.contains_id("0"));
    }

    #[test]
    fn split_replaces_parent_with_children() {
        let map = two_range_map();
        let next = map
            .splice(
                "1",
                vec![
                    range("3", key("q"), EffectiveKey::Max).with_parents(vec!["1".to_string()]),
                    range("2", key("m"), key("q")).with_parents(vec!["1".to_string()]),
                ],
            )
            .unwrap();

        assert_eq!(ids(&next.overlapping(&EffectiveKeyRange::full())), vec!["0", "2", "3"]);
        assert_eq!(next.range_for_key(&key("p")).unwrap().id, "2");
        assert!(next.is_gone("1"));
        assert_eq!(next.version(), map.version() + 1);
        // The previous snapshot is untouched.
        assert!(map.contains_id("1"));
    }

    #[test]
    fn merge_replaces_every_overlapped_range() {
        let map = two_range_map();
        let next = map
            .splice(
                "0",
                vec![range("5", EffectiveKey::Min, EffectiveKey::Max)
                    .with_parents(vec!["0".to_string(), "1".to_string()])],
            )
            .unwrap();

        assert_eq!(next.len(), 1);
        assert!(next.is_gone("0") && next.is_gone("1"));
        next.validate().unwrap();
    }

    #[test]
    fn splice_rejects_partial_or_stale_listings() {
        let map = two_range_map();

        let still_parent = map.splice("1", vec![range("1", key("m"), EffectiveKey::Max)]);
        assert!(still_parent.is_err());

        let partial = map.splice("1", vec![range("2", key("m"), key("q"))]);
        assert!(partial.is_err());

        let straddling = map.splice("1", vec![range("9", key("f"), EffectiveKey::Max)]);
        assert!(straddling.is_err());

        let empty = map.splice("1", Vec::new());
        assert!(empty.is_err());
    }

    #[test]
    fn splicing_an_unknown_range_is_a_no_op() {
        let map = two_range_map();
        let same = map.splice("42", Vec::new()).unwrap();
        assert_eq!(same, map);
    }

    #[test]
    fn rebuild_filters_ranges_known_to_be_gone() {
        let map = two_range_map()
            .splice(
                "1",
                vec![
                    range("2", key("m"), key("q")),
                    range("3", key("q"), EffectiveKey::Max),
                ],
            )
            .unwrap();

        let stale_listing = map.rebuild(vec![
            range("0", EffectiveKey::Min, key("m")),
            range("1", key("m"), EffectiveKey::Max),
            range("2", key("m"), key("q")),
            range("3", key("q"), EffectiveKey::Max),
        ]);
        let rebuilt = stale_listing.unwrap();
        assert_eq!(rebuilt.len(), 3);
        assert!(!rebuilt.contains_id("1"));
    }
}
