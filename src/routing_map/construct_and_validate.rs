impl RoutingMap {
    /// Builds a complete map from a full listing of the collection's ranges.
    ///
    /// Ranges named as a parent by another range of the listing, or already
    /// known to be gone, are dropped first; the service may briefly report a
    /// parent next to its children while a split completes.
    pub fn try_new(
        collection_rid: impl Into<String>,
        ranges: Vec<PartitionKeyRange>,
    ) -> Result<Self> {
        Self::build(collection_rid.into(), ranges, ImHashSet::new(), 1)
    }

    pub(crate) fn build(
        collection_rid: String,
        ranges: Vec<PartitionKeyRange>,
        known_gone: ImHashSet<String>,
        version: u64,
    ) -> Result<Self> {
        let mut gone = known_gone;
        for range in &ranges {
            for parent in &range.parents {
                gone.insert(parent.clone());
            }
        }

        let mut by_min = OrdMap::new();
        for range in ranges.into_iter().filter(|range| !gone.contains(&range.id)) {
            if let Some(previous) = by_min.insert(range.min().clone(), range) {
                return Err(RoutingError::TransientFetchFailure(format!(
                    "Partition key ranges of collection '{}' overlap at {} (range '{}')",
                    collection_rid,
                    previous.min(),
                    previous.id
                )));
            }
        }

        let map = Self {
            collection_rid,
            ranges: by_min,
            gone,
            version,
        };
        map.validate()?;
        Ok(map)
    }

    /// Checks that the ranges cover `[Min, Max)` without gaps, overlaps or
    /// duplicate ids.
    pub fn validate(&self) -> Result<()> {
        let incomplete = |detail: String| {
            RoutingError::TransientFetchFailure(format!(
                "Partition key ranges of collection '{}' are incomplete: {}",
                self.collection_rid, detail
            ))
        };

        let mut expected_min = EffectiveKey::Min;
        let mut ids = std::collections::HashSet::new();
        for (min, range) in &self.ranges {
            if *min != expected_min {
                return Err(incomplete(format!(
                    "range '{}' starts at {} but the previous range ends at {}",
                    range.id, min, expected_min
                )));
            }
            if !ids.insert(range.id.as_str()) {
                return Err(incomplete(format!("range id '{}' appears twice", range.id)));
            }
            expected_min = range.max().clone();
        }

        if expected_min != EffectiveKey::Max {
            return Err(incomplete(format!(
                "key space ends at {} instead of {}",
                expected_min,
                EffectiveKey::Max
            )));
        }
        Ok(())
    }

    pub fn collection_rid(&self) -> &str {
        &self.collection_rid
    }

    /// Incremented on every splice or full rebuild.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
