use crate::store::{AgencyId, FeedId};
use gtfs_structures::{EntityType, Feed};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Counts = BTreeMap<EntityType, usize>;

/// Entity counts of one source feed, with the names shown next to them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedCounts {
    pub feed_id: FeedId,
    pub feed_name: String,
    pub agency_id: AgencyId,
    pub agency_name: String,
    pub counts: Counts,
}

/// Count of every entity type, zeros included
pub fn entity_counts(feed: &Feed) -> Counts {
    EntityType::ALL
        .into_iter()
        .map(|t| (t, feed.count(t)))
        .collect()
}

/// Sum of the per feed counts, before any deduplication
pub fn totals(feed_counts: &[FeedCounts]) -> Counts {
    let mut totals: Counts = EntityType::ALL.into_iter().map(|t| (t, 0)).collect();
    for counts in feed_counts {
        for (entity_type, count) in &counts.counts {
            *totals.entry(*entity_type).or_default() += count;
        }
    }
    totals
}

/// Entity types whose actual count differs from the expected one, as `(type, expected, actual)`
pub fn mismatches(expected: &Counts, actual: &Counts) -> Vec<(EntityType, usize, usize)> {
    EntityType::ALL
        .into_iter()
        .filter_map(|t| {
            let expected = expected.get(&t).copied().unwrap_or(0);
            let actual = actual.get(&t).copied().unwrap_or(0);
            (expected != actual).then_some((t, expected, actual))
        })
        .collect()
}
