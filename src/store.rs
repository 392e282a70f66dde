//! Collaborators owning the data: the agency directory and the feed store.
//!
//! The engine only talks to the traits. [MemoryStore] implements both and backs the tests and
//! the command line.

use crate::error::{EngineError, Result};
use crate::graph::{self, KeySet};
use crate::tasks::TaskContext;
use gtfs_structures::*;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

pub type AgencyId = u64;
pub type FeedId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agency {
    pub id: AgencyId,
    pub name: String,
    pub description: Option<String>,
}

/// Lifecycle of a feed. Only `Ready` feeds are complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Building,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub id: FeedId,
    pub agency_id: AgencyId,
    pub name: String,
    pub description: Option<String>,
    pub status: FeedStatus,
    pub active: bool,
    /// Fingerprint of the request that built this feed, if any
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewFeed {
    pub agency_id: AgencyId,
    pub name: String,
    pub description: Option<String>,
    pub origin: Option<String>,
}

/// The rows of one table, as handed to [FeedStore::insert]
#[derive(Debug, Clone, PartialEq)]
pub enum Rows {
    Routes(Vec<Route>),
    Trips(Vec<Trip>),
    Stops(Vec<Stop>),
    StopTimes(Vec<StopTime>),
    Shapes(Vec<ShapePoint>),
    Calendar(Vec<Calendar>),
    CalendarDates(Vec<CalendarDate>),
    FareAttributes(Vec<FareAttribute>),
    FareRules(Vec<FareRule>),
}

impl Rows {
    /// Moves the table of `entity_type` out of `feed`
    pub fn take(feed: &mut Feed, entity_type: EntityType) -> Self {
        use std::mem::take;
        match entity_type {
            EntityType::Route => Rows::Routes(take(&mut feed.routes)),
            EntityType::Trip => Rows::Trips(take(&mut feed.trips)),
            EntityType::Stop => Rows::Stops(take(&mut feed.stops)),
            EntityType::StopTime => Rows::StopTimes(take(&mut feed.stop_times)),
            EntityType::Shape => Rows::Shapes(take(&mut feed.shapes)),
            EntityType::Calendar => Rows::Calendar(take(&mut feed.calendar)),
            EntityType::CalendarDate => Rows::CalendarDates(take(&mut feed.calendar_dates)),
            EntityType::FareAttribute => Rows::FareAttributes(take(&mut feed.fare_attributes)),
            EntityType::FareRule => Rows::FareRules(take(&mut feed.fare_rules)),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Rows::Routes(_) => EntityType::Route,
            Rows::Trips(_) => EntityType::Trip,
            Rows::Stops(_) => EntityType::Stop,
            Rows::StopTimes(_) => EntityType::StopTime,
            Rows::Shapes(_) => EntityType::Shape,
            Rows::Calendar(_) => EntityType::Calendar,
            Rows::CalendarDates(_) => EntityType::CalendarDate,
            Rows::FareAttributes(_) => EntityType::FareAttribute,
            Rows::FareRules(_) => EntityType::FareRule,
        }
    }

    /// Number of rows, not of entities: every shape point counts
    pub fn len(&self) -> usize {
        match self {
            Rows::Routes(r) => r.len(),
            Rows::Trips(r) => r.len(),
            Rows::Stops(r) => r.len(),
            Rows::StopTimes(r) => r.len(),
            Rows::Shapes(r) => r.len(),
            Rows::Calendar(r) => r.len(),
            Rows::CalendarDates(r) => r.len(),
            Rows::FareAttributes(r) => r.len(),
            Rows::FareRules(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends the rows to the matching table of `feed`
    pub fn append_to(self, feed: &mut Feed) {
        match self {
            Rows::Routes(r) => feed.routes.extend(r),
            Rows::Trips(r) => feed.trips.extend(r),
            Rows::Stops(r) => feed.stops.extend(r),
            Rows::StopTimes(r) => feed.stop_times.extend(r),
            Rows::Shapes(r) => feed.shapes.extend(r),
            Rows::Calendar(r) => feed.calendar.extend(r),
            Rows::CalendarDates(r) => feed.calendar_dates.extend(r),
            Rows::FareAttributes(r) => feed.fare_attributes.extend(r),
            Rows::FareRules(r) => feed.fare_rules.extend(r),
        }
    }
}

/// Lookup and creation of agencies
pub trait AgencyDirectory: Send + Sync {
    fn create_agency(&self, name: &str, description: Option<&str>) -> Result<Agency>;
    fn agency(&self, id: AgencyId) -> Result<Option<Agency>>;
    fn delete_agency(&self, id: AgencyId) -> Result<()>;
    /// Gives the members of `from` access to `to`
    fn copy_members(&self, from: AgencyId, to: AgencyId) -> Result<()>;
}

/// Transactional storage of feeds. Every mutating call is all-or-nothing
pub trait FeedStore: Send + Sync {
    fn feeds(&self) -> Result<Vec<FeedRecord>>;
    fn feed(&self, id: FeedId) -> Result<Option<FeedRecord>>;
    /// Creates an empty feed in the `Building` state
    fn create_feed(&self, new_feed: NewFeed) -> Result<FeedRecord>;
    fn set_status(&self, id: FeedId, status: FeedStatus) -> Result<()>;
    /// Activates a feed, deactivating the other feeds of its agency
    fn set_active(&self, id: FeedId) -> Result<()>;
    fn delete_feed(&self, id: FeedId) -> Result<()>;
    /// Snapshot of the rows of a feed
    fn load(&self, id: FeedId) -> Result<Feed>;
    /// Bulk insert of the rows of one table, returns the number of rows inserted
    fn insert(&self, id: FeedId, rows: Rows) -> Result<usize>;
    /// Removes the rows selected by `keys` (see [graph::contains_row])
    fn remove(&self, id: FeedId, keys: &KeySet) -> Result<()>;
}

/// Stores a complete feed: record, then every table, then `Ready`
pub fn import_feed<S: FeedStore + ?Sized>(
    store: &S,
    new_feed: NewFeed,
    mut feed: Feed,
) -> Result<FeedRecord> {
    let record = store.create_feed(new_feed)?;
    for entity_type in EntityType::ALL {
        let rows = Rows::take(&mut feed, entity_type);
        if !rows.is_empty() {
            store.insert(record.id, rows)?;
        }
    }
    store.set_status(record.id, FeedStatus::Ready)?;
    Ok(FeedRecord {
        status: FeedStatus::Ready,
        ..record
    })
}

/// Both collaborators, as needed by merges and splits
pub trait Store: FeedStore + AgencyDirectory {}

impl<T: FeedStore + AgencyDirectory + ?Sized> Store for T {}

/// Undoes what a job created unless [Rollback::commit] is reached
pub(crate) struct Rollback<'a, S: Store + ?Sized> {
    store: &'a S,
    pub feed_id: Option<FeedId>,
    pub agency_id: Option<AgencyId>,
    committed: bool,
}

impl<'a, S: Store + ?Sized> Rollback<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Rollback {
            store,
            feed_id: None,
            agency_id: None,
            committed: false,
        }
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl<S: Store + ?Sized> Drop for Rollback<'_, S> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(feed_id) = self.feed_id {
            warn!("rolling back feed {feed_id}");
            if let Err(e) = self.store.delete_feed(feed_id) {
                error!("could not delete feed {feed_id}: {e}");
            }
        }
        if let Some(agency_id) = self.agency_id {
            warn!("rolling back agency {agency_id}");
            if let Err(e) = self.store.delete_agency(agency_id) {
                error!("could not delete agency {agency_id}: {e}");
            }
        }
    }
}

/// Inserts `feed` into the feed `feed_id`, one layer of [graph::copy_order] at a time
///
/// The tables of a layer do not reference each other and are inserted from scoped threads when
/// `parallel` is set. Cancellation is checked before every layer. Returns the inserted rows per
/// type.
pub fn copy_in_layers<S: FeedStore + ?Sized>(
    store: &S,
    ctx: &TaskContext,
    feed_id: FeedId,
    mut feed: Feed,
    parallel: bool,
) -> Result<BTreeMap<EntityType, usize>> {
    let mut inserted = BTreeMap::new();
    for layer in graph::copy_order() {
        ctx.checkpoint()?;
        let batches: Vec<Rows> = layer
            .into_iter()
            .map(|t| Rows::take(&mut feed, t))
            .filter(|rows| !rows.is_empty())
            .collect();

        let results: Vec<Result<(EntityType, usize)>> = if parallel && batches.len() > 1 {
            std::thread::scope(|scope| {
                let handles: Vec<_> = batches
                    .into_iter()
                    .map(|rows| {
                        let entity_type = rows.entity_type();
                        scope.spawn(move || store.insert(feed_id, rows).map(|n| (entity_type, n)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join()
                            .unwrap_or_else(|_| Err(EngineError::Task("copy thread panicked".to_owned())))
                    })
                    .collect()
            })
        } else {
            batches
                .into_iter()
                .map(|rows| {
                    let entity_type = rows.entity_type();
                    store.insert(feed_id, rows).map(|n| (entity_type, n))
                })
                .collect()
        };

        for result in results {
            let (entity_type, count) = result?;
            info!(
                "task {}: copied {count} {entity_type} row(s) into feed {feed_id}",
                ctx.id()
            );
            inserted.insert(entity_type, count);
        }
    }
    Ok(inserted)
}

#[derive(Default)]
struct Inner {
    agencies: BTreeMap<AgencyId, Agency>,
    members: BTreeMap<AgencyId, BTreeSet<String>>,
    records: BTreeMap<FeedId, FeedRecord>,
    feeds: BTreeMap<FeedId, Feed>,
    last_agency_id: AgencyId,
    last_feed_id: FeedId,
}

impl Inner {
    fn record_mut(&mut self, id: FeedId) -> Result<&mut FeedRecord> {
        self.records
            .get_mut(&id)
            .ok_or_else(|| EngineError::Task(format!("unknown feed {id}")))
    }

    fn feed_mut(&mut self, id: FeedId) -> Result<&mut Feed> {
        self.feeds
            .get_mut(&id)
            .ok_or_else(|| EngineError::Task(format!("unknown feed {id}")))
    }
}

/// In memory implementation of [AgencyDirectory] and [FeedStore]
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, agency_id: AgencyId, member: &str) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner
            .members
            .entry(agency_id)
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    pub fn members(&self, agency_id: AgencyId) -> Result<BTreeSet<String>> {
        let inner = self.inner.read()?;
        Ok(inner.members.get(&agency_id).cloned().unwrap_or_default())
    }

    pub fn agencies(&self) -> Result<Vec<Agency>> {
        let inner = self.inner.read()?;
        Ok(inner.agencies.values().cloned().collect())
    }
}

impl AgencyDirectory for MemoryStore {
    fn create_agency(&self, name: &str, description: Option<&str>) -> Result<Agency> {
        let mut inner = self.inner.write()?;
        inner.last_agency_id += 1;
        let agency = Agency {
            id: inner.last_agency_id,
            name: name.to_owned(),
            description: description.map(str::to_owned),
        };
        inner.agencies.insert(agency.id, agency.clone());
        Ok(agency)
    }

    fn agency(&self, id: AgencyId) -> Result<Option<Agency>> {
        let inner = self.inner.read()?;
        Ok(inner.agencies.get(&id).cloned())
    }

    fn delete_agency(&self, id: AgencyId) -> Result<()> {
        let mut inner = self.inner.write()?;
        if inner.records.values().any(|r| r.agency_id == id) {
            return Err(EngineError::Task(format!(
                "agency {id} still owns feeds"
            )));
        }
        inner.agencies.remove(&id);
        inner.members.remove(&id);
        Ok(())
    }

    fn copy_members(&self, from: AgencyId, to: AgencyId) -> Result<()> {
        let mut inner = self.inner.write()?;
        let members = inner.members.get(&from).cloned().unwrap_or_default();
        inner.members.entry(to).or_default().extend(members);
        Ok(())
    }
}

impl FeedStore for MemoryStore {
    fn feeds(&self) -> Result<Vec<FeedRecord>> {
        let inner = self.inner.read()?;
        Ok(inner.records.values().cloned().collect())
    }

    fn feed(&self, id: FeedId) -> Result<Option<FeedRecord>> {
        let inner = self.inner.read()?;
        Ok(inner.records.get(&id).cloned())
    }

    fn create_feed(&self, new_feed: NewFeed) -> Result<FeedRecord> {
        let mut inner = self.inner.write()?;
        if !inner.agencies.contains_key(&new_feed.agency_id) {
            return Err(EngineError::Task(format!(
                "unknown agency {}",
                new_feed.agency_id
            )));
        }
        inner.last_feed_id += 1;
        let record = FeedRecord {
            id: inner.last_feed_id,
            agency_id: new_feed.agency_id,
            name: new_feed.name,
            description: new_feed.description,
            status: FeedStatus::Building,
            active: false,
            origin: new_feed.origin,
        };
        inner.records.insert(record.id, record.clone());
        inner.feeds.insert(record.id, Feed::default());
        Ok(record)
    }

    fn set_status(&self, id: FeedId, status: FeedStatus) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.record_mut(id)?.status = status;
        Ok(())
    }

    fn set_active(&self, id: FeedId) -> Result<()> {
        let mut inner = self.inner.write()?;
        let agency_id = inner.record_mut(id)?.agency_id;
        for record in inner.records.values_mut() {
            if record.agency_id == agency_id {
                record.active = record.id == id;
            }
        }
        Ok(())
    }

    fn delete_feed(&self, id: FeedId) -> Result<()> {
        let mut inner = self.inner.write()?;
        inner.records.remove(&id);
        inner.feeds.remove(&id);
        Ok(())
    }

    fn load(&self, id: FeedId) -> Result<Feed> {
        let inner = self.inner.read()?;
        inner
            .feeds
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::Task(format!("unknown feed {id}")))
    }

    fn insert(&self, id: FeedId, rows: Rows) -> Result<usize> {
        let mut inner = self.inner.write()?;
        let len = rows.len();
        rows.append_to(inner.feed_mut(id)?);
        Ok(len)
    }

    fn remove(&self, id: FeedId, keys: &KeySet) -> Result<()> {
        let mut inner = self.inner.write()?;
        graph::remove(inner.feed_mut(id)?, keys);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn store_with_sample() -> (MemoryStore, FeedRecord) {
        let store = MemoryStore::new();
        let agency = store.create_agency("Metro", None).unwrap();
        let record = import_feed(
            &store,
            NewFeed {
                agency_id: agency.id,
                name: "sample".to_owned(),
                ..NewFeed::default()
            },
            sample_feed(),
        )
        .unwrap();
        (store, record)
    }

    #[test]
    fn import_then_load() {
        let (store, record) = store_with_sample();
        assert_eq!(FeedStatus::Ready, record.status);
        assert_eq!(Some(record.clone()), store.feed(record.id).unwrap());
        assert_eq!(sample_feed(), store.load(record.id).unwrap());
    }

    #[test]
    fn one_active_feed_per_agency() {
        let (store, first) = store_with_sample();
        let second = import_feed(
            &store,
            NewFeed {
                agency_id: first.agency_id,
                name: "second".to_owned(),
                ..NewFeed::default()
            },
            Feed::default(),
        )
        .unwrap();
        store.set_active(first.id).unwrap();
        store.set_active(second.id).unwrap();
        let active: Vec<FeedId> = store
            .feeds()
            .unwrap()
            .into_iter()
            .filter(|r| r.active)
            .map(|r| r.id)
            .collect();
        assert_eq!(vec![second.id], active);
    }

    #[test]
    fn feed_needs_an_agency() {
        let store = MemoryStore::new();
        let res = store.create_feed(NewFeed {
            agency_id: 42,
            name: "orphan".to_owned(),
            ..NewFeed::default()
        });
        assert!(matches!(res, Err(EngineError::Task(_))));
    }

    #[test]
    fn agency_with_feeds_is_kept() {
        let (store, record) = store_with_sample();
        assert!(store.delete_agency(record.agency_id).is_err());
        store.delete_feed(record.id).unwrap();
        store.delete_agency(record.agency_id).unwrap();
        assert_eq!(None, store.agency(record.agency_id).unwrap());
    }

    #[test]
    fn remove_selected_rows() {
        let (store, record) = store_with_sample();
        store
            .remove(record.id, &keys(&[(EntityType::Route, "r2")]))
            .unwrap();
        let feed = store.load(record.id).unwrap();
        assert_eq!(1, feed.routes.len());
        assert_eq!(2, feed.trips.len());
    }

    fn building_feed(store: &MemoryStore) -> FeedRecord {
        let agency = store.create_agency("tmp", None).unwrap();
        store
            .create_feed(NewFeed {
                agency_id: agency.id,
                name: "tmp".to_owned(),
                ..NewFeed::default()
            })
            .unwrap()
    }

    #[test]
    fn rollback_unless_committed() {
        let store = MemoryStore::new();
        let record = building_feed(&store);
        {
            let mut rollback = Rollback::new(&store);
            rollback.feed_id = Some(record.id);
            rollback.agency_id = Some(record.agency_id);
        }
        assert_eq!(None, store.feed(record.id).unwrap());
        assert_eq!(None, store.agency(record.agency_id).unwrap());

        let record = building_feed(&store);
        let mut rollback = Rollback::new(&store);
        rollback.feed_id = Some(record.id);
        rollback.commit();
        assert!(store.feed(record.id).unwrap().is_some());
    }

    #[test]
    fn copy_layer_by_layer() {
        use crate::tasks::{TaskKind, TaskRegistry, TaskRequest};

        let store = MemoryStore::new();
        let registry = TaskRegistry::new();
        let ctx = registry
            .register(TaskRequest {
                kind: TaskKind::Merge,
                locks: vec![],
                validation_result: None,
            })
            .unwrap();
        for parallel in [false, true] {
            let record = building_feed(&store);
            let inserted =
                copy_in_layers(&store, &ctx, record.id, sample_feed(), parallel).unwrap();
            assert_eq!(Some(&4), inserted.get(&EntityType::StopTime));
            assert_eq!(Some(&2), inserted.get(&EntityType::Shape));
            assert_eq!(sample_feed(), store.load(record.id).unwrap());
        }
    }

    #[test]
    fn copy_members() {
        let store = MemoryStore::new();
        let a = store.create_agency("a", None).unwrap();
        let b = store.create_agency("b", None).unwrap();
        store.add_member(a.id, "alice").unwrap();
        store.copy_members(a.id, b.id).unwrap();
        assert_eq!(set(&["alice"]), store.members(b.id).unwrap());
    }
}
