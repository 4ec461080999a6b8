impl RoutingMap {
    /// Returns the range containing `key`.
    pub fn range_for_key(&self, key: &EffectiveKey) -> Option<&PartitionKeyRange> {
        if *key == EffectiveKey::Max {
            return None;
        }
        self.ranges
            .range(..=key.clone())
            .next_back()
            .map(|(_, range)| range)
            .filter(|range| range.range.contains(key))
    }

    /// Returns, in key order, every range overlapping `query`.
    pub fn overlapping(&self, query: &EffectiveKeyRange) -> Vec<PartitionKeyRange> {
        let start = self
            .range_for_key(&query.min)
            .map(|range| range.min().clone())
            .unwrap_or(EffectiveKey::Min);

        self.ranges
            .range(start..)
            .map(|(_, range)| range)
            .take_while(|range| *range.min() < query.max)
            .filter(|range| range.range.overlaps(query))
            .cloned()
            .collect()
    }

    pub fn range_by_id(&self, id: &str) -> Option<&PartitionKeyRange> {
        self.ranges.values().find(|range| range.id == id)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.range_by_id(id).is_some()
    }

    /// Returns true if `id` was split or merged away.
    pub fn is_gone(&self, id: &str) -> bool {
        self.gone.contains(id)
    }

    /// All ranges in key order.
    pub fn ranges(&self) -> impl Iterator<Item = &PartitionKeyRange> {
        self.ranges.values()
    }
}
