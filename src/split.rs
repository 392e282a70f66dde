//! Moving a set of routes, and everything they need, into a new agency.
//!
//! A [SplitPlan] partitions the feed once: the rows brought along by the routes, the subset of
//! them that no other row needs (removable from the source) and the shared remainder, copied
//! but never removed.

use crate::configuration::Configuration;
use crate::counts;
use crate::error::{EngineError, Result};
use crate::graph::{self, with_table, ForeignKey, KeySet, Row};
use crate::merge::{check_counts, check_integrity, detach_agency};
use crate::store::{self, AgencyId, FeedId, FeedRecord, FeedStatus, NewFeed, Rollback, Store};
use crate::tasks::{
    Lock, LockKey, TaskContext, TaskId, TaskKind, TaskOutcome, TaskRequest, TaskScheduler,
    TaskStatus,
};
use gtfs_structures::{EntityType, Feed};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRequest {
    pub feed_id: FeedId,
    pub route_ids: Vec<String>,
    pub new_agency_name: String,
    #[serde(default)]
    pub new_agency_description: Option<String>,
    pub new_feed_name: String,
    /// Gives the members of the source agency access to the new one
    #[serde(default)]
    pub copy_users: bool,
    #[serde(default)]
    pub remove_from_source: bool,
}

impl SplitRequest {
    fn fingerprint(&self, agency_id: AgencyId) -> Result<String> {
        let mut normalized = self.clone();
        normalized.route_ids.sort();
        normalized.route_ids.dedup();
        let json = serde_json::to_vec(&(agency_id, &normalized))
            .map_err(|e| EngineError::Task(format!("cannot serialize split request: {e}")))?;
        Ok(format!("split:{:x}", Sha256::digest(&json)))
    }
}

/// What a split brings along, counted like [counts::entity_counts]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitDependencies {
    pub routes: usize,
    pub trips: usize,
    pub stops: usize,
    pub stop_times: usize,
    /// Rows of calendar.txt
    pub calendars: usize,
    pub calendar_dates: usize,
    /// Distinct shape ids
    pub shapes: usize,
    pub fare_rules: usize,
    pub fare_attributes: usize,
    /// Stops also used by the rest of the feed
    pub shared_stops: usize,
    pub shared_shapes: usize,
    /// Service ids also used by the rest of the feed
    pub shared_calendars: usize,
    pub shared_fare_attributes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSplitResponse {
    pub task_id: Option<TaskId>,
    pub new_agency_id: Option<AgencyId>,
    pub new_feed_id: Option<FeedId>,
    pub status: TaskStatus,
    pub message: String,
    /// As computed when the request was accepted
    pub dependencies: SplitDependencies,
}

/// Partition of a feed by a route selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitPlan {
    /// Everything the selected routes bring along
    pub selected: KeySet,
    /// Part of `selected` that nothing else references
    pub removed: KeySet,
    /// `selected` minus `removed`, for stops, shapes, calendars and fare attributes
    pub shared: KeySet,
}

const SHARED_TYPES: [EntityType; 4] = [
    EntityType::Stop,
    EntityType::Shape,
    EntityType::Calendar,
    EntityType::FareAttribute,
];

impl SplitPlan {
    pub fn new(feed: &Feed, route_ids: &[String]) -> Self {
        let seeds = KeySet::from([(
            EntityType::Route,
            route_ids.iter().cloned().collect::<BTreeSet<String>>(),
        )]);
        let selected = graph::closure(feed, &seeds);
        let removed = removable(feed, &selected);
        let shared = SHARED_TYPES
            .into_iter()
            .map(|t| {
                let kept: BTreeSet<String> = selected
                    .get(&t)
                    .into_iter()
                    .flatten()
                    .filter(|k| !removed.get(&t).is_some_and(|r| r.contains(*k)))
                    .cloned()
                    .collect();
                (t, kept)
            })
            .filter(|(_, kept)| !kept.is_empty())
            .collect();
        SplitPlan {
            selected,
            removed,
            shared,
        }
    }

    /// Rows of the new feed
    pub fn split_feed(&self, feed: &Feed) -> Feed {
        graph::subset(feed, &self.selected)
    }

    /// Rows left in the source when `remove_from_source` is set
    pub fn retained_feed(&self, feed: &Feed) -> Feed {
        let mut retained = feed.clone();
        graph::remove(&mut retained, &self.removed);
        retained
    }

    fn shared_count(&self, entity_type: EntityType) -> usize {
        self.shared.get(&entity_type).map_or(0, BTreeSet::len)
    }

    pub fn dependencies(&self, feed: &Feed) -> SplitDependencies {
        let counts = counts::entity_counts(&self.split_feed(feed));
        let count = |t: EntityType| counts.get(&t).copied().unwrap_or(0);
        SplitDependencies {
            routes: count(EntityType::Route),
            trips: count(EntityType::Trip),
            stops: count(EntityType::Stop),
            stop_times: count(EntityType::StopTime),
            calendars: count(EntityType::Calendar),
            calendar_dates: count(EntityType::CalendarDate),
            shapes: count(EntityType::Shape),
            fare_rules: count(EntityType::FareRule),
            fare_attributes: count(EntityType::FareAttribute),
            shared_stops: self.shared_count(EntityType::Stop),
            shared_shapes: self.shared_count(EntityType::Shape),
            shared_calendars: self.shared_count(EntityType::Calendar),
            shared_fare_attributes: self.shared_count(EntityType::FareAttribute),
        }
    }
}

/// Largest part of `selected` that can leave the feed without breaking a reference
///
/// Keys still referenced by a kept row are kept, and so are the rows owned by a kept key, until
/// nothing changes.
fn removable(feed: &Feed, selected: &KeySet) -> KeySet {
    let mut removed = selected.clone();
    loop {
        let mut changed = false;

        let retained = graph::retained_references(feed, &removed);
        for (entity_type, keys) in removed.iter_mut() {
            if let Some(referenced) = retained.get(entity_type) {
                let before = keys.len();
                keys.retain(|k| !referenced.contains(k));
                changed |= keys.len() != before;
            }
        }

        for fk in ForeignKey::ALL.into_iter().filter(|fk| fk.is_ownership()) {
            let owners = removed.get(&fk.referenced());
            let orphans: Vec<String> = with_table!(feed, fk.referencing(), rows => rows
                .iter()
                .filter(|r| graph::contains_row(*r, &removed))
                .filter(|r| {
                    r.reference(fk)
                        .is_some_and(|owner| !owners.is_some_and(|o| o.contains(owner)))
                })
                .map(graph::key_or_identity)
                .collect());
            if let Some(keys) = removed.get_mut(&fk.referencing()) {
                for orphan in orphans {
                    changed |= keys.remove(&orphan);
                }
            }
        }

        if !changed {
            return removed;
        }
    }
}

fn load_selection<S: Store + ?Sized>(
    store: &S,
    feed_id: FeedId,
    route_ids: &[String],
) -> Result<(FeedRecord, Feed)> {
    if route_ids.is_empty() {
        return Err(EngineError::Precondition(
            "a split needs at least one route".to_owned(),
        ));
    }
    let record = store
        .feed(feed_id)?
        .ok_or_else(|| EngineError::Precondition(format!("unknown feed {feed_id}")))?;
    if record.status != FeedStatus::Ready {
        return Err(EngineError::Precondition(format!(
            "feed {feed_id} is not ready"
        )));
    }
    let feed = store.load(feed_id)?;
    let known = graph::ids(&feed, EntityType::Route);
    let unknown: Vec<&str> = route_ids
        .iter()
        .map(String::as_str)
        .filter(|r| !known.contains(r))
        .collect();
    if !unknown.is_empty() {
        return Err(EngineError::Precondition(format!(
            "unknown route(s) in feed {feed_id}: {}",
            unknown.join(", ")
        )));
    }
    Ok((record, feed))
}

/// Every precondition of a split request, then the source snapshot
fn load_request<S: Store + ?Sized>(
    store: &S,
    agency_id: AgencyId,
    request: &SplitRequest,
) -> Result<(FeedRecord, Feed)> {
    let (record, feed) = load_selection(store, request.feed_id, &request.route_ids)?;
    if record.agency_id != agency_id {
        return Err(EngineError::Precondition(format!(
            "feed {} does not belong to agency {agency_id}",
            record.id
        )));
    }
    if request.new_agency_name.trim().is_empty() {
        return Err(EngineError::Precondition(
            "the new agency needs a name".to_owned(),
        ));
    }
    if request.new_feed_name.trim().is_empty() {
        return Err(EngineError::Precondition(
            "the new feed needs a name".to_owned(),
        ));
    }
    Ok((record, feed))
}

/// Counts of what splitting `route_ids` out of `feed_id` would bring along
pub fn compute_dependencies<S: Store + ?Sized>(
    store: &S,
    feed_id: FeedId,
    route_ids: &[String],
) -> Result<SplitDependencies> {
    let (_, feed) = load_selection(store, feed_id, route_ids)?;
    Ok(SplitPlan::new(&feed, route_ids).dependencies(&feed))
}

/// Checks the request, then submits the split of a feed of `agency_id`
pub fn execute<S: Store + ?Sized + 'static>(
    store: &Arc<S>,
    scheduler: &dyn TaskScheduler,
    config: &Configuration,
    agency_id: AgencyId,
    request: &SplitRequest,
) -> Result<ExecuteSplitResponse> {
    let origin = request.fingerprint(agency_id)?;
    let done = store
        .feeds()?
        .into_iter()
        .find(|r| r.status == FeedStatus::Ready && r.origin.as_deref() == Some(origin.as_str()));
    if let Some(done) = done {
        info!("split already done in feed {}", done.id);
        return Ok(ExecuteSplitResponse {
            task_id: None,
            new_agency_id: Some(done.agency_id),
            new_feed_id: Some(done.id),
            status: TaskStatus::Completed,
            message: format!("already split into feed {}", done.id),
            dependencies: SplitDependencies::default(),
        });
    }

    // preview only, the job plans again once it holds the lock on the source
    let (record, feed) = load_request(store.as_ref(), agency_id, request)?;
    let dependencies = SplitPlan::new(&feed, &request.route_ids).dependencies(&feed);
    info!(
        "split of {} route(s) out of feed {}: {} trip(s), {} shared stop(s)",
        dependencies.routes, record.id, dependencies.trips, dependencies.shared_stops
    );

    let job = SplitJob {
        store: store.clone(),
        agency_id,
        request: request.clone(),
        origin,
        parallel_copy: config.parallel_copy,
        verify_counts: config.verify_counts,
    };
    let task_id = scheduler.submit(
        TaskRequest {
            kind: TaskKind::Split,
            locks: vec![
                Lock::exclusive(LockKey::Feed(request.feed_id)),
                Lock::exclusive(LockKey::AgencyName(
                    request.new_agency_name.trim().to_owned(),
                )),
            ],
            validation_result: None,
        },
        Box::new(move |ctx: &TaskContext| job.run(ctx)),
    )?;

    let info = scheduler.status(task_id)?;
    let status = info.as_ref().map_or(TaskStatus::Pending, |i| i.status);
    let outcome = info.as_ref().and_then(|i| i.outcome.clone()).unwrap_or_default();
    let message = match (status, outcome.feed_id) {
        (TaskStatus::Completed, Some(feed_id)) => format!(
            "{} route(s) split into feed {feed_id}",
            dependencies.routes
        ),
        _ => info
            .and_then(|i| i.message)
            .unwrap_or_else(|| format!("split task {task_id} is {status}")),
    };
    Ok(ExecuteSplitResponse {
        task_id: Some(task_id),
        new_agency_id: outcome.agency_id,
        new_feed_id: outcome.feed_id,
        status,
        message,
        dependencies,
    })
}

struct SplitJob<S: ?Sized> {
    store: Arc<S>,
    agency_id: AgencyId,
    request: SplitRequest,
    origin: String,
    parallel_copy: bool,
    verify_counts: bool,
}

impl<S: Store + ?Sized> SplitJob<S> {
    fn run(self, ctx: &TaskContext) -> Result<TaskOutcome> {
        let task = ctx.id();
        let store = self.store.as_ref();
        ctx.checkpoint()?;

        // the source cannot change from here on
        let (source, feed) = load_request(store, self.agency_id, &self.request)?;
        let plan = SplitPlan::new(&feed, &self.request.route_ids);
        debug!(
            "task {task}: {} key(s) selected, {} removable",
            plan.selected.values().map(BTreeSet::len).sum::<usize>(),
            plan.removed.values().map(BTreeSet::len).sum::<usize>()
        );

        let mut rollback = Rollback::new(store);
        let agency = store.create_agency(
            self.request.new_agency_name.trim(),
            self.request.new_agency_description.as_deref(),
        )?;
        rollback.agency_id = Some(agency.id);
        let record = store.create_feed(NewFeed {
            agency_id: agency.id,
            name: self.request.new_feed_name.trim().to_owned(),
            description: None,
            origin: Some(self.origin.clone()),
        })?;
        rollback.feed_id = Some(record.id);
        info!(
            "task {task}: splitting feed {} into feed {} of agency {}",
            source.id, record.id, agency.id
        );

        let mut split = plan.split_feed(&feed);
        detach_agency(&mut split);
        let expected = counts::entity_counts(&split);
        store::copy_in_layers(store, ctx, record.id, split, self.parallel_copy)?;
        ctx.checkpoint()?;

        let target = store.load(record.id)?;
        if self.verify_counts {
            check_counts(&expected, &target)?;
        }
        check_integrity(&target)?;
        if self.request.remove_from_source {
            check_removable(&feed, &plan.removed)?;
        }
        ctx.checkpoint()?;

        store.set_status(record.id, FeedStatus::Ready)?;
        store.set_active(record.id)?;
        if self.request.copy_users {
            store.copy_members(source.agency_id, agency.id)?;
        }
        if self.request.remove_from_source {
            store.remove(source.id, &plan.removed)?;
            let removed: usize = plan.removed.values().map(BTreeSet::len).sum();
            info!(
                "task {task}: removed {removed} key(s) from feed {}",
                source.id
            );
        }
        rollback.commit();
        Ok(TaskOutcome {
            agency_id: Some(agency.id),
            feed_id: Some(record.id),
        })
    }
}

/// Fails when a row left in the feed would reference a removed key
fn check_removable(feed: &Feed, removed: &KeySet) -> Result<()> {
    for (entity_type, keys) in graph::dependents(feed, removed) {
        let kept = removed.get(&entity_type);
        if let Some(key) = keys.iter().find(|k| !kept.is_some_and(|r| r.contains(*k))) {
            warn!("{entity_type} {key} would be left dangling");
            return Err(EngineError::IntegrityViolation(format!(
                "{entity_type} {key} is kept but depends on removed rows"
            )));
        }
    }
    Ok(())
}
