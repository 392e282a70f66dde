//! Identifier collisions between the feeds of a merge.
//!
//! GTFS gives no identity across feeds: the same id in two feeds is a collision even when both
//! rows are identical.

use crate::error::{EngineError, Result};
use crate::graph;
use crate::store::{AgencyId, FeedId};
use gtfs_structures::{EntityType, Feed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An identifier used by several source feeds for the same entity type
///
/// Fare zones collide as stops: `zone` is set and the strategy of [EntityType::Stop] applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub entity_type: EntityType,
    pub conflicting_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub zone: bool,
    pub source_agency_ids: BTreeSet<AgencyId>,
    pub source_feed_ids: BTreeSet<FeedId>,
    /// Number of source feeds using the id
    pub count: usize,
}

/// A feed taking part in a merge
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    pub feed_id: FeedId,
    pub agency_id: AgencyId,
    pub feed: &'a Feed,
}

/// Checks that a merge has something to merge: at least two distinct, non-empty sources
pub fn check_sources(sources: &[Source]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for source in sources {
        if !seen.insert(source.feed_id) {
            return Err(EngineError::Precondition(format!(
                "feed {} is given twice",
                source.feed_id
            )));
        }
    }
    let non_empty = sources.iter().filter(|s| !s.feed.is_empty()).count();
    if non_empty < 2 {
        return Err(EngineError::Precondition(format!(
            "a merge needs at least 2 non empty source feeds, got {non_empty}"
        )));
    }
    Ok(())
}

/// Every conflict between `sources`, ordered by entity type in copy order, then by id
///
/// Only keyed types are scanned: stop times, calendar dates and fare rules can only collide
/// through the keys of the rows they reference. Zone collisions follow the stop ids.
pub fn detect(sources: &[Source]) -> Result<Vec<Conflict>> {
    check_sources(sources)?;

    let mut conflicts = Vec::new();
    for entity_type in graph::copy_order().into_iter().flatten() {
        if !entity_type.is_keyed() {
            continue;
        }
        conflicts.extend(collisions(sources, entity_type, false, |feed| {
            graph::ids(feed, entity_type)
        }));
        if entity_type == EntityType::Stop {
            conflicts.extend(collisions(sources, entity_type, true, graph::zone_ids));
        }
    }
    Ok(conflicts)
}

fn collisions<'a>(
    sources: &'a [Source],
    entity_type: EntityType,
    zone: bool,
    ids: impl Fn(&'a Feed) -> BTreeSet<&'a str>,
) -> Vec<Conflict> {
    let mut users: BTreeMap<&str, Vec<&Source>> = BTreeMap::new();
    for source in sources {
        for id in ids(source.feed) {
            users.entry(id).or_default().push(source);
        }
    }
    users
        .into_iter()
        .filter(|(_, users)| users.len() > 1)
        .map(|(id, users)| Conflict {
            entity_type,
            conflicting_id: id.to_owned(),
            zone,
            source_agency_ids: users.iter().map(|s| s.agency_id).collect(),
            source_feed_ids: users.iter().map(|s| s.feed_id).collect(),
            count: users.len(),
        })
        .collect()
}

/// Conflicts grouped by entity type, so that a strategy can be picked per type
pub fn by_type(conflicts: &[Conflict]) -> BTreeMap<EntityType, Vec<&Conflict>> {
    let mut grouped: BTreeMap<EntityType, Vec<&Conflict>> = BTreeMap::new();
    for conflict in conflicts {
        grouped.entry(conflict.entity_type).or_default().push(conflict);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use gtfs_structures::{FareRule, Stop};

    fn source(feed_id: FeedId, agency_id: AgencyId, feed: &Feed) -> Source {
        Source {
            feed_id,
            agency_id,
            feed,
        }
    }

    #[test]
    fn same_route_id_in_two_feeds() {
        let mut a = Feed::default();
        a.routes.push(route("1"));
        let mut b = Feed::default();
        b.routes.push(route("1"));
        b.routes.push(route("2"));

        let conflicts = detect(&[source(1, 10, &a), source(2, 20, &b)]).unwrap();
        assert_eq!(
            vec![Conflict {
                entity_type: EntityType::Route,
                conflicting_id: "1".to_owned(),
                zone: false,
                source_agency_ids: BTreeSet::from([10, 20]),
                source_feed_ids: BTreeSet::from([1, 2]),
                count: 2,
            }],
            conflicts
        );
    }

    #[test]
    fn identical_rows_still_conflict() {
        let a = sample_feed();
        let b = sample_feed();
        let conflicts = detect(&[source(1, 10, &a), source(2, 10, &b)]).unwrap();
        let grouped = by_type(&conflicts);
        assert_eq!(2, grouped[&EntityType::Route].len());
        // four stop ids and the zone z1
        assert_eq!(5, grouped[&EntityType::Stop].len());
        assert_eq!(1, grouped[&EntityType::Shape].len());
        // weekdays from calendar.txt, holidays from calendar_dates.txt
        assert_eq!(2, grouped[&EntityType::Calendar].len());
        assert!(!grouped.contains_key(&EntityType::StopTime));
        assert!(conflicts
            .iter()
            .all(|c| c.source_agency_ids == BTreeSet::from([10]) && c.count == 2));
    }

    #[test]
    fn ordered_by_copy_order() {
        let a = sample_feed();
        let b = sample_feed();
        let conflicts = detect(&[source(1, 10, &a), source(2, 20, &b)]).unwrap();
        let types: Vec<EntityType> = conflicts.iter().map(|c| c.entity_type).collect();
        let mut sorted = types.clone();
        let order: Vec<EntityType> = graph::copy_order().into_iter().flatten().collect();
        sorted.sort_by_key(|t| order.iter().position(|o| o == t));
        assert_eq!(sorted, types);
        assert_eq!(EntityType::Trip, *types.last().unwrap());
    }

    #[test]
    fn three_feeds() {
        let mut feeds = vec![Feed::default(), Feed::default(), Feed::default()];
        for feed in &mut feeds {
            feed.stops.push(stop("common", None));
        }
        feeds[2].stops.push(stop("own", None));
        let sources: Vec<Source> = feeds
            .iter()
            .enumerate()
            .map(|(i, f)| source(i as FeedId + 1, 1, f))
            .collect();
        let conflicts = detect(&sources).unwrap();
        assert_eq!(1, conflicts.len());
        assert_eq!(3, conflicts[0].count);
    }

    #[test]
    fn not_enough_sources() {
        let a = sample_feed();
        let empty = Feed::default();
        assert!(matches!(
            detect(&[source(1, 1, &a)]),
            Err(EngineError::Precondition(_))
        ));
        assert!(matches!(
            detect(&[source(1, 1, &a), source(2, 1, &empty)]),
            Err(EngineError::Precondition(_))
        ));
        assert!(matches!(
            detect(&[source(1, 1, &a), source(1, 1, &a)]),
            Err(EngineError::Precondition(_))
        ));
    }

    #[test]
    fn shared_zone_is_a_stop_conflict() {
        let mut a = Feed::default();
        a.stops.push(Stop {
            zone_id: Some("1".to_owned()),
            ..stop("a", None)
        });
        let mut b = Feed::default();
        b.stops.push(stop("b", None));
        b.fare_rules.push(FareRule {
            origin_id: Some("1".to_owned()),
            ..fare_rule("fare", None)
        });

        let conflicts = detect(&[source(1, 10, &a), source(2, 20, &b)]).unwrap();
        assert_eq!(1, conflicts.len());
        assert_eq!(EntityType::Stop, conflicts[0].entity_type);
        assert_eq!("1", conflicts[0].conflicting_id);
        assert!(conflicts[0].zone);

        let json = serde_json::to_value(&conflicts[0]).unwrap();
        assert_eq!(Some(&serde_json::Value::Bool(true)), json.get("zone"));
    }
}
