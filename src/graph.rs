//! The GTFS entity graph: which column of which table references which other table.
//!
//! [ForeignKey::ALL] is the only place where relations between entity types are listed. Copy
//! order, reference rewriting, dependency closures and removal checks are all derived from it.

use gtfs_structures::{
    Calendar, CalendarDate, EntityType, FareAttribute, FareRule, Feed, Route, ShapePoint, Stop,
    StopTime, Trip,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Keys per entity type. Keyed types are stored by identifier, composite types by
/// [Row::identity]
pub type KeySet = BTreeMap<EntityType, BTreeSet<String>>;

/// A reference from a column of one entity type to the key of another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ForeignKey {
    TripRoute,
    TripService,
    TripShape,
    StopTimeTrip,
    StopTimeStop,
    StopParentStation,
    CalendarDateService,
    FareRuleFare,
    FareRuleRoute,
}

impl ForeignKey {
    pub const ALL: [ForeignKey; 9] = [
        ForeignKey::TripRoute,
        ForeignKey::TripService,
        ForeignKey::TripShape,
        ForeignKey::StopTimeTrip,
        ForeignKey::StopTimeStop,
        ForeignKey::StopParentStation,
        ForeignKey::CalendarDateService,
        ForeignKey::FareRuleFare,
        ForeignKey::FareRuleRoute,
    ];

    /// Type holding the column
    pub fn referencing(self) -> EntityType {
        match self {
            ForeignKey::TripRoute | ForeignKey::TripService | ForeignKey::TripShape => {
                EntityType::Trip
            }
            ForeignKey::StopTimeTrip | ForeignKey::StopTimeStop => EntityType::StopTime,
            ForeignKey::StopParentStation => EntityType::Stop,
            ForeignKey::CalendarDateService => EntityType::CalendarDate,
            ForeignKey::FareRuleFare | ForeignKey::FareRuleRoute => EntityType::FareRule,
        }
    }

    /// Type whose key is referenced
    pub fn referenced(self) -> EntityType {
        match self {
            ForeignKey::TripRoute | ForeignKey::FareRuleRoute => EntityType::Route,
            ForeignKey::TripService | ForeignKey::CalendarDateService => EntityType::Calendar,
            ForeignKey::TripShape => EntityType::Shape,
            ForeignKey::StopTimeTrip => EntityType::Trip,
            ForeignKey::StopTimeStop | ForeignKey::StopParentStation => EntityType::Stop,
            ForeignKey::FareRuleFare => EntityType::FareAttribute,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            ForeignKey::TripRoute | ForeignKey::FareRuleRoute => "route_id",
            ForeignKey::TripService | ForeignKey::CalendarDateService => "service_id",
            ForeignKey::TripShape => "shape_id",
            ForeignKey::StopTimeTrip => "trip_id",
            ForeignKey::StopTimeStop => "stop_id",
            ForeignKey::StopParentStation => "parent_station",
            ForeignKey::FareRuleFare => "fare_id",
        }
    }

    /// An empty column is allowed
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            ForeignKey::TripShape | ForeignKey::StopParentStation | ForeignKey::FareRuleRoute
        )
    }

    /// The referencing row belongs to the referenced one: it moves with it in a split.
    ///
    /// Other edges are plain dependencies, the referenced row is pulled along with the
    /// referencing one.
    pub fn is_ownership(self) -> bool {
        matches!(
            self,
            ForeignKey::TripRoute
                | ForeignKey::StopTimeTrip
                | ForeignKey::CalendarDateService
                | ForeignKey::FareRuleRoute
        )
    }

    pub fn is_self_edge(self) -> bool {
        self.referencing() == self.referenced()
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}",
            self.referencing(),
            self.column(),
            self.referenced()
        )
    }
}

/// Uniform access to the keys and references of a GTFS row
pub trait Row: Clone + Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;

    /// Own identifier of keyed types
    fn key(&self) -> Option<&str> {
        None
    }

    fn key_mut(&mut self) -> Option<&mut String> {
        None
    }

    /// Value of the column of `fk`, None when the column is empty or not part of this type
    fn reference(&self, _fk: ForeignKey) -> Option<&str> {
        None
    }

    fn reference_mut(&mut self, _fk: ForeignKey) -> Option<&mut String> {
        None
    }

    /// Identifies the row among the rows of its table
    fn identity(&self) -> String;
}

fn optional(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn optional_mut(value: &mut Option<String>) -> Option<&mut String> {
    value.as_mut().filter(|v| !v.is_empty())
}

impl Row for Route {
    const ENTITY_TYPE: EntityType = EntityType::Route;
    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn key_mut(&mut self) -> Option<&mut String> {
        Some(&mut self.id)
    }
    fn identity(&self) -> String {
        self.id.clone()
    }
}

impl Row for Trip {
    const ENTITY_TYPE: EntityType = EntityType::Trip;
    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn key_mut(&mut self) -> Option<&mut String> {
        Some(&mut self.id)
    }
    fn reference(&self, fk: ForeignKey) -> Option<&str> {
        match fk {
            ForeignKey::TripRoute => Some(&self.route_id),
            ForeignKey::TripService => Some(&self.service_id),
            ForeignKey::TripShape => optional(&self.shape_id),
            _ => None,
        }
    }
    fn reference_mut(&mut self, fk: ForeignKey) -> Option<&mut String> {
        match fk {
            ForeignKey::TripRoute => Some(&mut self.route_id),
            ForeignKey::TripService => Some(&mut self.service_id),
            ForeignKey::TripShape => optional_mut(&mut self.shape_id),
            _ => None,
        }
    }
    fn identity(&self) -> String {
        self.id.clone()
    }
}

impl Row for Stop {
    const ENTITY_TYPE: EntityType = EntityType::Stop;
    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn key_mut(&mut self) -> Option<&mut String> {
        Some(&mut self.id)
    }
    fn reference(&self, fk: ForeignKey) -> Option<&str> {
        match fk {
            ForeignKey::StopParentStation => optional(&self.parent_station),
            _ => None,
        }
    }
    fn reference_mut(&mut self, fk: ForeignKey) -> Option<&mut String> {
        match fk {
            ForeignKey::StopParentStation => optional_mut(&mut self.parent_station),
            _ => None,
        }
    }
    fn identity(&self) -> String {
        self.id.clone()
    }
}

impl Row for StopTime {
    const ENTITY_TYPE: EntityType = EntityType::StopTime;
    fn reference(&self, fk: ForeignKey) -> Option<&str> {
        match fk {
            ForeignKey::StopTimeTrip => Some(&self.trip_id),
            ForeignKey::StopTimeStop => Some(&self.stop_id),
            _ => None,
        }
    }
    fn reference_mut(&mut self, fk: ForeignKey) -> Option<&mut String> {
        match fk {
            ForeignKey::StopTimeTrip => Some(&mut self.trip_id),
            ForeignKey::StopTimeStop => Some(&mut self.stop_id),
            _ => None,
        }
    }
    fn identity(&self) -> String {
        format!("{:?}", (&self.trip_id, self.stop_sequence))
    }
}

impl Row for ShapePoint {
    const ENTITY_TYPE: EntityType = EntityType::Shape;
    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn key_mut(&mut self) -> Option<&mut String> {
        Some(&mut self.id)
    }
    fn identity(&self) -> String {
        format!("{:?}", (&self.id, self.sequence))
    }
}

impl Row for Calendar {
    const ENTITY_TYPE: EntityType = EntityType::Calendar;
    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn key_mut(&mut self) -> Option<&mut String> {
        Some(&mut self.id)
    }
    fn identity(&self) -> String {
        self.id.clone()
    }
}

impl Row for CalendarDate {
    const ENTITY_TYPE: EntityType = EntityType::CalendarDate;
    fn reference(&self, fk: ForeignKey) -> Option<&str> {
        match fk {
            ForeignKey::CalendarDateService => Some(&self.service_id),
            _ => None,
        }
    }
    fn reference_mut(&mut self, fk: ForeignKey) -> Option<&mut String> {
        match fk {
            ForeignKey::CalendarDateService => Some(&mut self.service_id),
            _ => None,
        }
    }
    fn identity(&self) -> String {
        format!("{:?}", (&self.service_id, self.date))
    }
}

impl Row for FareAttribute {
    const ENTITY_TYPE: EntityType = EntityType::FareAttribute;
    fn key(&self) -> Option<&str> {
        Some(&self.id)
    }
    fn key_mut(&mut self) -> Option<&mut String> {
        Some(&mut self.id)
    }
    fn identity(&self) -> String {
        self.id.clone()
    }
}

impl Row for FareRule {
    const ENTITY_TYPE: EntityType = EntityType::FareRule;
    fn reference(&self, fk: ForeignKey) -> Option<&str> {
        match fk {
            ForeignKey::FareRuleFare => Some(&self.fare_id),
            ForeignKey::FareRuleRoute => optional(&self.route_id),
            _ => None,
        }
    }
    fn reference_mut(&mut self, fk: ForeignKey) -> Option<&mut String> {
        match fk {
            ForeignKey::FareRuleFare => Some(&mut self.fare_id),
            ForeignKey::FareRuleRoute => optional_mut(&mut self.route_id),
            _ => None,
        }
    }
    fn identity(&self) -> String {
        format!(
            "{:?}",
            (
                &self.fare_id,
                &self.route_id,
                &self.origin_id,
                &self.destination_id,
                &self.contains_id
            )
        )
    }
}

/// Runs `$body` with `$rows` bound to the table of `$entity_type`, as a slice of [Row]s
macro_rules! with_table {
    ($feed:expr, $entity_type:expr, $rows:ident => $body:expr) => {
        match $entity_type {
            EntityType::Route => {
                let $rows = &$feed.routes[..];
                $body
            }
            EntityType::Trip => {
                let $rows = &$feed.trips[..];
                $body
            }
            EntityType::Stop => {
                let $rows = &$feed.stops[..];
                $body
            }
            EntityType::StopTime => {
                let $rows = &$feed.stop_times[..];
                $body
            }
            EntityType::Shape => {
                let $rows = &$feed.shapes[..];
                $body
            }
            EntityType::Calendar => {
                let $rows = &$feed.calendar[..];
                $body
            }
            EntityType::CalendarDate => {
                let $rows = &$feed.calendar_dates[..];
                $body
            }
            EntityType::FareAttribute => {
                let $rows = &$feed.fare_attributes[..];
                $body
            }
            EntityType::FareRule => {
                let $rows = &$feed.fare_rules[..];
                $body
            }
        }
    };
}

/// Same as `with_table!`, with `$rows` bound to the mutable `Vec`
macro_rules! with_table_mut {
    ($feed:expr, $entity_type:expr, $rows:ident => $body:expr) => {
        match $entity_type {
            EntityType::Route => {
                let $rows = &mut $feed.routes;
                $body
            }
            EntityType::Trip => {
                let $rows = &mut $feed.trips;
                $body
            }
            EntityType::Stop => {
                let $rows = &mut $feed.stops;
                $body
            }
            EntityType::StopTime => {
                let $rows = &mut $feed.stop_times;
                $body
            }
            EntityType::Shape => {
                let $rows = &mut $feed.shapes;
                $body
            }
            EntityType::Calendar => {
                let $rows = &mut $feed.calendar;
                $body
            }
            EntityType::CalendarDate => {
                let $rows = &mut $feed.calendar_dates;
                $body
            }
            EntityType::FareAttribute => {
                let $rows = &mut $feed.fare_attributes;
                $body
            }
            EntityType::FareRule => {
                let $rows = &mut $feed.fare_rules;
                $body
            }
        }
    };
}

pub(crate) use with_table;
pub(crate) use with_table_mut;

/// Edges leaving `entity_type`
pub fn edges_from(entity_type: EntityType) -> impl Iterator<Item = ForeignKey> {
    ForeignKey::ALL
        .into_iter()
        .filter(move |fk| fk.referencing() == entity_type)
}

/// Identifiers of a keyed type, empty for composite types
///
/// The [EntityType::Calendar] namespace also holds the services only defined in
/// `calendar_dates.txt`.
pub fn ids(feed: &Feed, entity_type: EntityType) -> BTreeSet<&str> {
    match entity_type {
        EntityType::Calendar => feed.service_ids(),
        t if !t.is_keyed() => BTreeSet::new(),
        t => with_table!(feed, t, rows => rows.iter().filter_map(|r| r.key()).collect()),
    }
}

/// Fare zones: set on stops, used by the origin, destination and contains columns of fare rules
///
/// Zones have no table of their own. They share the fate of the stops when merging.
pub fn zone_ids(feed: &Feed) -> BTreeSet<&str> {
    let stops = feed.stops.iter().filter_map(|s| s.zone_id.as_deref());
    let rules = feed.fare_rules.iter().flat_map(|r| {
        [&r.origin_id, &r.destination_id, &r.contains_id]
            .into_iter()
            .filter_map(|zone| zone.as_deref())
    });
    stops.chain(rules).collect()
}

/// Every zone value of the feed, for rewriting
pub fn zones_mut(feed: &mut Feed) -> impl Iterator<Item = &mut String> {
    let stops = feed.stops.iter_mut().filter_map(|s| s.zone_id.as_mut());
    let rules = feed.fare_rules.iter_mut().flat_map(|r| {
        [&mut r.origin_id, &mut r.destination_id, &mut r.contains_id]
            .into_iter()
            .filter_map(Option::as_mut)
    });
    stops.chain(rules)
}

/// Every non-empty value of the column of `fk`, one per row
pub fn references(feed: &Feed, fk: ForeignKey) -> Vec<&str> {
    with_table!(feed, fk.referencing(), rows => rows.iter().filter_map(|r| r.reference(fk)).collect())
}

/// Does `value` designate an existing row of the type referenced by `fk`
pub fn resolves(feed: &Feed, fk: ForeignKey, value: &str) -> bool {
    ids(feed, fk.referenced()).contains(value)
}

/// A reference to a key absent from the feed
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DanglingReference {
    pub foreign_key: ForeignKey,
    pub value: String,
}

impl fmt::Display for DanglingReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} references unknown {} '{}'",
            self.foreign_key,
            self.foreign_key.referenced(),
            self.value
        )
    }
}

/// Distinct dangling references of a feed, sorted
pub fn dangling_references(feed: &Feed) -> Vec<DanglingReference> {
    let mut dangling = BTreeSet::new();
    for fk in ForeignKey::ALL {
        let known = ids(feed, fk.referenced());
        for value in references(feed, fk) {
            if !known.contains(value) {
                dangling.insert(DanglingReference {
                    foreign_key: fk,
                    value: value.to_owned(),
                });
            }
        }
    }
    dangling.into_iter().collect()
}

/// Row identities appearing more than once in their table, sorted
pub fn duplicates(feed: &Feed) -> Vec<(EntityType, String)> {
    let mut duplicates = Vec::new();
    for entity_type in EntityType::ALL {
        let identities: Vec<String> =
            with_table!(feed, entity_type, rows => rows.iter().map(|r| r.identity()).collect());
        let mut seen = BTreeSet::new();
        let mut reported = BTreeSet::new();
        for identity in identities {
            if !seen.insert(identity.clone()) && reported.insert(identity.clone()) {
                duplicates.push((entity_type, identity));
            }
        }
    }
    duplicates
}

/// Entity types grouped in layers, every type coming after the types it references
///
/// Self edges are ignored: a table is written at once.
pub fn copy_order() -> Vec<Vec<EntityType>> {
    let mut layer: BTreeMap<EntityType, usize> =
        EntityType::ALL.into_iter().map(|t| (t, 0)).collect();
    loop {
        let mut changed = false;
        for fk in ForeignKey::ALL.into_iter().filter(|fk| !fk.is_self_edge()) {
            let needed = layer[&fk.referenced()] + 1;
            if layer[&fk.referencing()] < needed {
                layer.insert(fk.referencing(), needed);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let depth = layer.values().copied().max().unwrap_or(0);
    (0..=depth)
        .map(|l| {
            EntityType::ALL
                .into_iter()
                .filter(|t| layer[t] == l)
                .collect()
        })
        .collect()
}

/// Is the row part of `keys`: by key for keyed types, by identity for composite types
pub fn contains_row<R: Row>(row: &R, keys: &KeySet) -> bool {
    let Some(set) = keys.get(&R::ENTITY_TYPE) else {
        return false;
    };
    match row.key() {
        Some(key) => set.contains(key),
        None => set.contains(&row.identity()),
    }
}

pub(crate) fn key_or_identity<R: Row>(row: &R) -> String {
    row.key()
        .map(str::to_owned)
        .unwrap_or_else(|| row.identity())
}

/// Rows that transitively reference any of `seeds`, walking the edges backwards
///
/// The seeds themselves are not part of the result unless a cycle leads back to them.
pub fn dependents(feed: &Feed, seeds: &KeySet) -> KeySet {
    let mut found = KeySet::new();
    let mut frontier = seeds.clone();
    while !frontier.is_empty() {
        let mut next = KeySet::new();
        for fk in ForeignKey::ALL {
            let Some(targets) = frontier.get(&fk.referenced()) else {
                continue;
            };
            let referencing: Vec<String> = with_table!(feed, fk.referencing(), rows => rows
                .iter()
                .filter(|r| r.reference(fk).is_some_and(|v| targets.contains(v)))
                .map(key_or_identity)
                .collect());
            for key in referencing {
                if found
                    .entry(fk.referencing())
                    .or_default()
                    .insert(key.clone())
                {
                    next.entry(fk.referencing()).or_default().insert(key);
                }
            }
        }
        frontier = next;
    }
    found
}

/// Everything a selection of keys brings along
///
/// Ownership edges are walked backwards (a route brings its trips, a trip its stop times), the
/// other edges forwards (a trip brings its calendar and shape, a stop time its stop).
pub fn closure(feed: &Feed, seeds: &KeySet) -> KeySet {
    let mut included = seeds.clone();
    loop {
        let mut added = Vec::new();
        for fk in ForeignKey::ALL {
            let found: Vec<(EntityType, String)> = with_table!(feed, fk.referencing(), rows => {
                if fk.is_ownership() {
                    let Some(owners) = included.get(&fk.referenced()) else {
                        continue;
                    };
                    rows.iter()
                        .filter(|r| r.reference(fk).is_some_and(|v| owners.contains(v)))
                        .filter(|r| !contains_row(*r, &included))
                        .map(|r| (fk.referencing(), key_or_identity(r)))
                        .collect()
                } else {
                    rows.iter()
                        .filter(|r| contains_row(*r, &included))
                        .filter_map(|r| r.reference(fk))
                        .filter(|v| {
                            !included
                                .get(&fk.referenced())
                                .is_some_and(|set| set.contains(*v))
                        })
                        .map(|v| (fk.referenced(), v.to_owned()))
                        .collect()
                }
            });
            added.extend(found);
        }
        if added.is_empty() {
            break;
        }
        for (entity_type, key) in added {
            included.entry(entity_type).or_default().insert(key);
        }
    }
    included
}

/// Keys referenced by the rows that `removed` leaves in place, per referenced type
pub fn retained_references(feed: &Feed, removed: &KeySet) -> KeySet {
    let mut referenced = KeySet::new();
    for fk in ForeignKey::ALL {
        let values: Vec<&str> = with_table!(feed, fk.referencing(), rows => rows
            .iter()
            .filter(|r| !contains_row(*r, removed))
            .filter_map(|r| r.reference(fk))
            .collect());
        referenced
            .entry(fk.referenced())
            .or_default()
            .extend(values.into_iter().map(str::to_owned));
    }
    referenced
}

/// Copy of the rows of `feed` that are part of `keys`
pub fn subset(feed: &Feed, keys: &KeySet) -> Feed {
    fn pick<R: Row>(rows: &[R], keys: &KeySet) -> Vec<R> {
        rows.iter()
            .filter(|r| contains_row(*r, keys))
            .cloned()
            .collect()
    }

    Feed {
        routes: pick(&feed.routes, keys),
        trips: pick(&feed.trips, keys),
        stops: pick(&feed.stops, keys),
        stop_times: pick(&feed.stop_times, keys),
        shapes: pick(&feed.shapes, keys),
        calendar: pick(&feed.calendar, keys),
        calendar_dates: pick(&feed.calendar_dates, keys),
        fare_attributes: pick(&feed.fare_attributes, keys),
        fare_rules: pick(&feed.fare_rules, keys),
    }
}

/// Drops the rows of `feed` that are part of `keys`
pub fn remove(feed: &mut Feed, keys: &KeySet) {
    for entity_type in EntityType::ALL {
        with_table_mut!(feed, entity_type, rows => rows.retain(|r| !contains_row(r, keys)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn layers() {
        assert_eq!(
            vec![
                vec![
                    EntityType::Route,
                    EntityType::Stop,
                    EntityType::Shape,
                    EntityType::Calendar,
                    EntityType::FareAttribute
                ],
                vec![
                    EntityType::Trip,
                    EntityType::CalendarDate,
                    EntityType::FareRule
                ],
                vec![EntityType::StopTime],
            ],
            copy_order()
        );
    }

    #[test]
    fn every_edge_is_accessible() {
        let feed = sample_feed();
        for fk in ForeignKey::ALL {
            assert!(
                !references(&feed, fk).is_empty(),
                "no value for {fk} in the sample feed"
            );
        }
    }

    #[test]
    fn sample_has_no_dangling_reference() {
        assert_eq!(Vec::<DanglingReference>::new(), dangling_references(&sample_feed()));
    }

    #[test]
    fn dangling_reference() {
        let mut feed = sample_feed();
        feed.trips[0].shape_id = Some("nowhere".to_owned());
        let dangling = dangling_references(&feed);
        assert_eq!(1, dangling.len());
        assert_eq!(ForeignKey::TripShape, dangling[0].foreign_key);
        assert_eq!(
            "trip.shape_id -> shape references unknown shape 'nowhere'",
            dangling[0].to_string()
        );
        assert!(!resolves(&feed, ForeignKey::TripShape, "nowhere"));
        assert!(resolves(&feed, ForeignKey::TripShape, "sh1"));
    }

    #[test]
    fn services_defined_by_exceptions() {
        let feed = sample_feed();
        let services = ids(&feed, EntityType::Calendar);
        assert!(services.contains("weekdays"));
        assert!(services.contains("holidays"));
        assert!(ids(&feed, EntityType::StopTime).is_empty());
    }

    #[test]
    fn shape_points_are_not_duplicates() {
        let mut feed = sample_feed();
        assert!(duplicates(&feed).is_empty());
        let point = feed.shapes[0].clone();
        feed.shapes.push(point);
        let trip = feed.trips[0].clone();
        feed.trips.push(trip);
        assert_eq!(
            vec![
                (EntityType::Trip, "t1".to_owned()),
                (EntityType::Shape, "(\"sh1\", 1)".to_owned())
            ],
            duplicates(&feed)
        );
    }

    #[test]
    fn dependents_of_a_stop() {
        let feed = sample_feed();
        let deps = dependents(&feed, &keys(&[(EntityType::Stop, "station")]));
        // the stops of the station and every stop time calling at them
        assert_eq!(
            Some(&set(&["s1", "s2"])),
            deps.get(&EntityType::Stop)
        );
        assert_eq!(3, deps[&EntityType::StopTime].len());
        assert!(!deps.contains_key(&EntityType::Trip));
    }

    #[test]
    fn dependents_of_a_route() {
        let feed = sample_feed();
        let deps = dependents(&feed, &keys(&[(EntityType::Route, "r1")]));
        assert_eq!(Some(&set(&["t1"])), deps.get(&EntityType::Trip));
        assert_eq!(2, deps[&EntityType::StopTime].len());
        assert_eq!(1, deps[&EntityType::FareRule].len());
    }

    #[test]
    fn closure_of_a_route() {
        let feed = sample_feed();
        let closure = closure(&feed, &keys(&[(EntityType::Route, "r1")]));
        assert_eq!(Some(&set(&["t1"])), closure.get(&EntityType::Trip));
        assert_eq!(Some(&set(&["s1", "s2", "station"])), closure.get(&EntityType::Stop));
        assert_eq!(Some(&set(&["sh1"])), closure.get(&EntityType::Shape));
        assert_eq!(Some(&set(&["weekdays"])), closure.get(&EntityType::Calendar));
        assert_eq!(Some(&set(&["fare"])), closure.get(&EntityType::FareAttribute));
        assert_eq!(2, closure[&EntityType::StopTime].len());
        assert_eq!(1, closure[&EntityType::CalendarDate].len());
        assert_eq!(1, closure[&EntityType::FareRule].len());
    }

    #[test]
    fn subset_and_remove_partition_a_feed() {
        let feed = sample_feed();
        let selection = closure(&feed, &keys(&[(EntityType::Route, "r1")]));
        let kept = subset(&feed, &selection);
        let mut rest = feed.clone();
        remove(&mut rest, &selection);
        for entity_type in EntityType::ALL {
            with_table!(feed, entity_type, rows => assert_eq!(
                rows.len(),
                with_table!(kept, entity_type, k => k.len())
                    + with_table!(rest, entity_type, r => r.len())
            ));
        }
        assert!(dangling_references(&kept).is_empty());
    }

    #[test]
    fn retained_rows_still_reference_shared_stops() {
        let feed = sample_feed();
        let selection = closure(&feed, &keys(&[(EntityType::Route, "r1")]));
        let referenced = retained_references(&feed, &selection);
        // t2 of r2 also calls at s2
        assert!(referenced[&EntityType::Stop].contains("s2"));
        assert!(!referenced[&EntityType::Stop].contains("s1"));
        assert!(!referenced
            .get(&EntityType::Route)
            .is_some_and(|r| r.contains("r1")));
    }

    #[test]
    fn zones_of_stops_and_fare_rules() {
        let mut feed = sample_feed();
        feed.stops[1].zone_id = Some("z2".to_owned());
        assert_eq!(BTreeSet::from(["z1", "z2"]), zone_ids(&feed));

        for zone in zones_mut(&mut feed) {
            zone.insert_str(0, "x_");
        }
        assert_eq!(BTreeSet::from(["x_z1", "x_z2"]), zone_ids(&feed));
        assert_eq!(None, feed.stops[2].zone_id);
    }
}
