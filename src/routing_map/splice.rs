impl RoutingMap {
    /// Replaces the gone range `gone_id` with `replacements`, the ranges the
    /// service now reports over its interval.
    ///
    /// A split yields children covering exactly the parent's interval. A merge
    /// yields a wider range; every existing range it overlaps is replaced too.
    /// The result is validated complete, so a partial or inconsistent listing
    /// is rejected and this map stays in use.
    pub fn splice(&self, gone_id: &str, replacements: Vec<PartitionKeyRange>) -> Result<Self> {
        let Some(gone_range) = self.range_by_id(gone_id).cloned() else {
            return Ok(self.clone());
        };

        if replacements.iter().any(|range| range.id == gone_id) {
            return Err(RoutingError::TransientFetchFailure(format!(
                "Metadata still reports gone partition key range '{}' of collection '{}'",
                gone_id, self.collection_rid
            )));
        }

        let mut replacements = replacements;
        replacements.retain(|range| !self.gone.contains(&range.id));
        replacements.sort_by(|a, b| a.min().cmp(b.min()));

        let (Some(first), Some(last)) = (replacements.first(), replacements.last()) else {
            return Err(RoutingError::TransientFetchFailure(format!(
                "Metadata returned no ranges for gone partition key range '{}' of collection '{}'",
                gone_id, self.collection_rid
            )));
        };
        let span = EffectiveKeyRange::new(first.min().clone(), last.max().clone())?;
        if !span.covers(&gone_range.range) {
            return Err(RoutingError::TransientFetchFailure(format!(
                "Ranges returned for gone partition key range '{}' cover {} instead of {}",
                gone_id, span, gone_range.range
            )));
        }

        let displaced = self.overlapping(&span);
        if let Some(outside) = displaced.iter().find(|range| !span.covers(&range.range)) {
            return Err(RoutingError::TransientFetchFailure(format!(
                "Range '{}' {} straddles the replacement interval {}",
                outside.id, outside.range, span
            )));
        }

        let mut next = self.clone();
        for range in &displaced {
            next.ranges.remove(range.min());
            next.gone.insert(range.id.clone());
        }
        for range in replacements {
            for parent in &range.parents {
                next.gone.insert(parent.clone());
            }
            next.ranges.insert(range.min().clone(), range);
        }
        next.version = self.version + 1;
        next.validate()?;
        Ok(next)
    }

    /// Rebuilds the map from a full listing, remembering every range this map
    /// already knows to be gone.
    pub fn rebuild(&self, ranges: Vec<PartitionKeyRange>) -> Result<Self> {
        Self::build(
            self.collection_rid.clone(),
            ranges,
            self.gone.clone(),
            self.version + 1,
        )
    }
}
