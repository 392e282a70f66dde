#![allow(dead_code)]

use chrono::NaiveDate;
use feedmerge::graph::KeySet;
use feedmerge::resolution::Strategies;
use feedmerge::store::{
    import_feed, Agency, AgencyDirectory, AgencyId, FeedId, FeedRecord, FeedStatus, FeedStore,
    NewFeed, Rows,
};
use feedmerge::{
    Configuration, FeedService, InlineScheduler, MemoryStore, MergeRequest, MergeTarget,
    Strategy, TaskScheduler,
};
use gtfs_structures::*;
use std::sync::Arc;

// Row builders, same shape as the ones of the unit tests

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn route(id: &str) -> Route {
    Route {
        id: id.to_owned(),
        short_name: id.to_owned(),
        ..Route::default()
    }
}

pub fn trip(id: &str, route_id: &str, service_id: &str, shape_id: Option<&str>) -> Trip {
    Trip {
        id: id.to_owned(),
        route_id: route_id.to_owned(),
        service_id: service_id.to_owned(),
        shape_id: shape_id.map(str::to_owned),
        ..Trip::default()
    }
}

pub fn stop(id: &str, parent_station: Option<&str>) -> Stop {
    Stop {
        id: id.to_owned(),
        name: id.to_owned(),
        parent_station: parent_station.map(str::to_owned),
        ..Stop::default()
    }
}

pub fn stop_time(trip_id: &str, stop_id: &str, stop_sequence: u32) -> StopTime {
    StopTime {
        trip_id: trip_id.to_owned(),
        stop_id: stop_id.to_owned(),
        stop_sequence,
        arrival_time: Some(8 * 3600 + stop_sequence * 60),
        departure_time: Some(8 * 3600 + stop_sequence * 60),
        ..StopTime::default()
    }
}

/// Two routes sharing the stop `b`, ids starting with `prefix`
///
/// Every keyed type is present, so two networks with the same prefix collide on all of them.
pub fn network(prefix: &str) -> Feed {
    let id = |s: &str| format!("{prefix}{s}");
    Feed {
        routes: vec![route(&id("r1")), route(&id("r2"))],
        trips: vec![
            trip(&id("t1"), &id("r1"), &id("week"), Some(&id("sh"))),
            trip(&id("t2"), &id("r2"), &id("week"), None),
        ],
        stops: vec![
            stop(&id("a"), None),
            stop(&id("b"), None),
            stop(&id("c"), None),
        ],
        stop_times: vec![
            stop_time(&id("t1"), &id("a"), 1),
            stop_time(&id("t1"), &id("b"), 2),
            stop_time(&id("t2"), &id("b"), 1),
            stop_time(&id("t2"), &id("c"), 2),
        ],
        shapes: (1..=3)
            .map(|sequence| ShapePoint {
                id: id("sh"),
                latitude: 45.5,
                longitude: -73.6 + f64::from(sequence) / 1000.,
                sequence,
                ..ShapePoint::default()
            })
            .collect(),
        calendar: vec![Calendar::every_day(
            &id("week"),
            date(2024, 1, 1),
            date(2024, 12, 31),
        )],
        calendar_dates: vec![CalendarDate {
            service_id: id("week"),
            date: date(2024, 5, 1),
            exception_type: Exception::Deleted,
        }],
        fare_attributes: vec![FareAttribute {
            id: id("fare"),
            price: "3.50".to_owned(),
            currency: "CAD".to_owned(),
            payment_method: PaymentMethod::Aboard,
            transfers: None,
            agency_id: None,
            transfer_duration: None,
        }],
        fare_rules: vec![FareRule {
            fare_id: id("fare"),
            route_id: Some(id("r1")),
            ..FareRule::default()
        }],
    }
}

/// Stores `feed` as the only feed of a new agency
pub fn add_feed(store: &MemoryStore, agency_name: &str, feed: Feed) -> (AgencyId, FeedId) {
    let agency = store.create_agency(agency_name, None).unwrap();
    let record = import_feed(
        store,
        NewFeed {
            agency_id: agency.id,
            name: format!("{agency_name} feed"),
            ..NewFeed::default()
        },
        feed,
    )
    .unwrap();
    (agency.id, record.id)
}

pub fn merge_request(sources: Vec<FeedId>, strategies: &[(EntityType, Strategy)]) -> MergeRequest {
    MergeRequest {
        sources,
        target: MergeTarget::NewAgency {
            name: "Regional".to_owned(),
            description: Some("merged network".to_owned()),
        },
        feed_name: "regional".to_owned(),
        feed_description: None,
        activate_on_success: Some(true),
        strategies: strategies.iter().copied().collect::<Strategies>(),
    }
}

pub fn inline_service(store: Arc<MemoryStore>) -> FeedService<MemoryStore> {
    FeedService::new(
        store,
        Arc::new(InlineScheduler::new()),
        Configuration::default(),
    )
}

/// Ids of the feeds and agencies of a store, to compare before and after an operation
pub fn snapshot<S: FeedStore + AgencyDirectory + ?Sized>(
    store: &S,
    agencies: &[AgencyId],
) -> (Vec<FeedRecord>, Vec<Option<Agency>>) {
    (
        store.feeds().unwrap(),
        agencies.iter().map(|id| store.agency(*id).unwrap()).collect(),
    )
}

pub type Hook = Box<dyn Fn(&Rows) -> feedmerge::Result<()> + Send + Sync>;
pub type LoadHook = Box<dyn Fn(FeedId) + Send + Sync>;

/// A [MemoryStore] calling a hook before every insert, and optionally after every load
///
/// The load hook runs once the snapshot is taken, so whatever it changes makes that snapshot stale.
pub struct HookStore {
    pub inner: Arc<MemoryStore>,
    hook: Hook,
    on_load: Option<LoadHook>,
}

impl HookStore {
    pub fn new(hook: Hook) -> Self {
        HookStore {
            inner: Arc::new(MemoryStore::new()),
            hook,
            on_load: None,
        }
    }

    pub fn on_load(self, on_load: LoadHook) -> Self {
        HookStore {
            on_load: Some(on_load),
            ..self
        }
    }
}

pub fn no_hook() -> Hook {
    Box::new(|_: &Rows| -> feedmerge::Result<()> { Ok(()) })
}

impl AgencyDirectory for HookStore {
    fn create_agency(&self, name: &str, description: Option<&str>) -> feedmerge::Result<Agency> {
        self.inner.create_agency(name, description)
    }

    fn agency(&self, id: AgencyId) -> feedmerge::Result<Option<Agency>> {
        self.inner.agency(id)
    }

    fn delete_agency(&self, id: AgencyId) -> feedmerge::Result<()> {
        self.inner.delete_agency(id)
    }

    fn copy_members(&self, from: AgencyId, to: AgencyId) -> feedmerge::Result<()> {
        self.inner.copy_members(from, to)
    }
}

impl FeedStore for HookStore {
    fn feeds(&self) -> feedmerge::Result<Vec<FeedRecord>> {
        self.inner.feeds()
    }

    fn feed(&self, id: FeedId) -> feedmerge::Result<Option<FeedRecord>> {
        self.inner.feed(id)
    }

    fn create_feed(&self, new_feed: NewFeed) -> feedmerge::Result<FeedRecord> {
        self.inner.create_feed(new_feed)
    }

    fn set_status(&self, id: FeedId, status: FeedStatus) -> feedmerge::Result<()> {
        self.inner.set_status(id, status)
    }

    fn set_active(&self, id: FeedId) -> feedmerge::Result<()> {
        self.inner.set_active(id)
    }

    fn delete_feed(&self, id: FeedId) -> feedmerge::Result<()> {
        self.inner.delete_feed(id)
    }

    fn load(&self, id: FeedId) -> feedmerge::Result<Feed> {
        let feed = self.inner.load(id)?;
        if let Some(on_load) = &self.on_load {
            on_load(id);
        }
        Ok(feed)
    }

    fn insert(&self, id: FeedId, rows: Rows) -> feedmerge::Result<usize> {
        (self.hook)(&rows)?;
        self.inner.insert(id, rows)
    }

    fn remove(&self, id: FeedId, keys: &KeySet) -> feedmerge::Result<()> {
        self.inner.remove(id, keys)
    }
}

pub fn hook_service(
    store: Arc<HookStore>,
    scheduler: Arc<dyn TaskScheduler>,
) -> FeedService<HookStore> {
    FeedService::new(store, scheduler, Configuration::default())
}
