use crate::objects::*;
use std::collections::BTreeSet;

/// All the rows of one feed, one table per [EntityType]
///
/// The rows are kept as close as possible to their CSV representation: relations are plain
/// identifiers and are not checked when a feed is built. Checking them is the job of whoever
/// consumes the feed.
///
/// ```
/// use gtfs_structures::{EntityType, Feed, Route};
///
/// let mut feed = Feed::default();
/// feed.routes.push(Route { id: "1".to_owned(), ..Route::default() });
/// assert_eq!(feed.count(EntityType::Route), 1);
/// assert_eq!(feed.count(EntityType::Trip), 0);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    /// All routes
    pub routes: Vec<Route>,
    /// All trips
    pub trips: Vec<Trip>,
    /// All stops
    pub stops: Vec<Stop>,
    /// All stop times
    pub stop_times: Vec<StopTime>,
    /// All shape points, a shape being every point sharing a `shape_id`
    pub shapes: Vec<ShapePoint>,
    /// All calendars
    pub calendar: Vec<Calendar>,
    /// All calendar exceptions
    pub calendar_dates: Vec<CalendarDate>,
    /// All fare attributes
    pub fare_attributes: Vec<FareAttribute>,
    /// All fare rules
    pub fare_rules: Vec<FareRule>,
}

impl Feed {
    /// Number of entities of a type
    ///
    /// A shape counts once, whatever its number of points. Every other type counts rows.
    pub fn count(&self, entity_type: EntityType) -> usize {
        match entity_type {
            EntityType::Route => self.routes.len(),
            EntityType::Trip => self.trips.len(),
            EntityType::Stop => self.stops.len(),
            EntityType::StopTime => self.stop_times.len(),
            EntityType::Shape => self.shape_ids().len(),
            EntityType::Calendar => self.calendar.len(),
            EntityType::CalendarDate => self.calendar_dates.len(),
            EntityType::FareAttribute => self.fare_attributes.len(),
            EntityType::FareRule => self.fare_rules.len(),
        }
    }

    /// True when the feed holds no row at all
    pub fn is_empty(&self) -> bool {
        EntityType::ALL.iter().all(|t| self.count(*t) == 0)
    }

    /// Distinct `shape_id`s, sorted
    pub fn shape_ids(&self) -> BTreeSet<&str> {
        self.shapes.iter().map(|s| s.id.as_str()).collect()
    }

    /// Every `service_id` defined by the feed, either in [Calendar] or in [CalendarDate], sorted
    pub fn service_ids(&self) -> BTreeSet<&str> {
        self.calendar
            .iter()
            .map(|c| c.id.as_str())
            .chain(self.calendar_dates.iter().map(|c| c.service_id.as_str()))
            .collect()
    }

    /// Appends all the rows of `other`
    pub fn extend(&mut self, other: Feed) {
        self.routes.extend(other.routes);
        self.trips.extend(other.trips);
        self.stops.extend(other.stops);
        self.stop_times.extend(other.stop_times);
        self.shapes.extend(other.shapes);
        self.calendar.extend(other.calendar);
        self.calendar_dates.extend(other.calendar_dates);
        self.fare_attributes.extend(other.fare_attributes);
        self.fare_rules.extend(other.fare_rules);
    }
}
