//! Merging two or more feeds into a new one.
//!
//! [validate] is a pure read. [execute] validates again, takes the locks and submits a job that
//! validates once more under those locks, resolves identifiers, copies every table into a fresh
//! feed and verifies it before making it visible. A failed or cancelled job leaves nothing behind.

use crate::configuration::Configuration;
use crate::conflicts::{self, Conflict, Source};
use crate::counts::{self, Counts, FeedCounts};
use crate::error::{EngineError, Result};
use crate::graph;
use crate::resolution::{self, strategy_for, Resolution, Strategies, Strategy};
use crate::store::{self, AgencyId, FeedId, FeedRecord, FeedStatus, NewFeed, Rollback, Store};
use crate::tasks::{
    Lock, LockKey, TaskContext, TaskId, TaskKind, TaskOutcome, TaskRequest, TaskScheduler,
    TaskStatus,
};
use gtfs_structures::{EntityType, Feed};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Dangling references or duplicates reported per source feed before summing up the rest
const MAX_REPORTED: usize = 10;

/// Where the merged feed goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MergeTarget {
    ExistingAgency(AgencyId),
    #[serde(rename_all = "camelCase")]
    NewAgency {
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub sources: Vec<FeedId>,
    pub target: MergeTarget,
    pub feed_name: String,
    #[serde(default)]
    pub feed_description: Option<String>,
    /// Falls back to the configured default
    #[serde(default)]
    pub activate_on_success: Option<bool>,
    /// Per entity type, types not given use the configured default
    #[serde(default)]
    pub strategies: Strategies,
}

#[derive(Serialize)]
struct NormalizedRequest<'a> {
    sources: Vec<FeedId>,
    target: &'a MergeTarget,
    feed_name: &'a str,
    feed_description: Option<&'a str>,
    activate: bool,
    strategies: BTreeMap<EntityType, Strategy>,
}

impl MergeRequest {
    fn activate(&self, config: &Configuration) -> bool {
        self.activate_on_success
            .unwrap_or(config.activate_on_success_default)
    }

    fn locks(&self) -> Vec<Lock> {
        let mut locks: Vec<Lock> = self
            .sources
            .iter()
            .map(|id| Lock::shared(LockKey::Feed(*id)))
            .collect();
        locks.push(Lock::exclusive(match &self.target {
            MergeTarget::ExistingAgency(id) => LockKey::Agency(*id),
            MergeTarget::NewAgency { name, .. } => LockKey::AgencyName(name.trim().to_owned()),
        }));
        locks
    }

    /// sha256 of the request once defaults are applied and sources sorted
    ///
    /// Two requests with the same fingerprint produce the same feed, which makes a retry of a
    /// completed merge a no-op.
    pub fn fingerprint(&self, config: &Configuration) -> Result<String> {
        let mut sources = self.sources.clone();
        sources.sort_unstable();
        let normalized = NormalizedRequest {
            sources,
            target: &self.target,
            feed_name: self.feed_name.trim(),
            feed_description: self.feed_description.as_deref(),
            activate: self.activate(config),
            strategies: EntityType::ALL
                .into_iter()
                .filter(|t| t.is_keyed())
                .map(|t| (t, strategy_for(&self.strategies, config.default_strategy, t)))
                .collect(),
        };
        let json = serde_json::to_vec(&normalized)
            .map_err(|e| EngineError::Task(format!("cannot serialize merge request: {e}")))?;
        Ok(format!("merge:{:x}", Sha256::digest(&json)))
    }
}

/// Outcome of a merge validation, as shown before executing it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// No error and no conflict
    pub valid: bool,
    pub conflicts: Vec<Conflict>,
    pub feed_counts: Vec<FeedCounts>,
    pub totals: Counts,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteMergeResponse {
    pub task_id: Option<TaskId>,
    pub new_agency_id: Option<AgencyId>,
    pub new_feed_id: Option<FeedId>,
    pub status: TaskStatus,
    pub message: String,
    pub validation_result: Option<ValidationResult>,
}

struct Loaded {
    record: FeedRecord,
    agency_name: String,
    feed: Feed,
}

/// Checks a merge request against the current state of the store
///
/// Only storage failures are returned as errors; everything wrong with the request ends up in
/// [ValidationResult::errors].
pub fn validate<S: Store + ?Sized>(store: &S, request: &MergeRequest) -> Result<ValidationResult> {
    validate_and_load(store, request).map(|(result, _)| result)
}

fn validate_and_load<S: Store + ?Sized>(
    store: &S,
    request: &MergeRequest,
) -> Result<(ValidationResult, Vec<Loaded>)> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if request.sources.len() < 2 {
        errors.push(format!(
            "a merge needs at least 2 source feeds, got {}",
            request.sources.len()
        ));
    }

    let mut seen = BTreeSet::new();
    let mut loaded = Vec::new();
    for &feed_id in &request.sources {
        if !seen.insert(feed_id) {
            errors.push(format!("feed {feed_id} is given twice"));
            continue;
        }
        let Some(record) = store.feed(feed_id)? else {
            errors.push(format!("unknown feed {feed_id}"));
            continue;
        };
        if record.status != FeedStatus::Ready {
            errors.push(format!("feed {feed_id} is not ready"));
            continue;
        }
        let agency_name = store
            .agency(record.agency_id)?
            .map(|a| a.name)
            .unwrap_or_default();
        let feed = store.load(feed_id)?;
        loaded.push(Loaded {
            record,
            agency_name,
            feed,
        });
    }

    for source in &loaded {
        let id = source.record.id;
        if source.feed.is_empty() {
            warnings.push(format!("feed {id} ({}) is empty", source.record.name));
        }
        let dangling = graph::dangling_references(&source.feed);
        for reference in dangling.iter().take(MAX_REPORTED) {
            errors.push(format!("feed {id}: {reference}"));
        }
        if dangling.len() > MAX_REPORTED {
            errors.push(format!(
                "feed {id}: {} more dangling reference(s)",
                dangling.len() - MAX_REPORTED
            ));
        }
        let duplicates = graph::duplicates(&source.feed);
        for (entity_type, key) in duplicates.iter().take(MAX_REPORTED) {
            errors.push(format!("feed {id}: {entity_type} {key} is duplicated"));
        }
        if duplicates.len() > MAX_REPORTED {
            errors.push(format!(
                "feed {id}: {} more duplicated key(s)",
                duplicates.len() - MAX_REPORTED
            ));
        }
    }

    match &request.target {
        MergeTarget::ExistingAgency(agency_id) => {
            if store.agency(*agency_id)?.is_none() {
                errors.push(format!("unknown target agency {agency_id}"));
            }
            for source in loaded.iter().filter(|l| l.record.agency_id == *agency_id) {
                errors.push(format!(
                    "target agency {agency_id} owns source feed {}",
                    source.record.id
                ));
            }
        }
        MergeTarget::NewAgency { name, .. } => {
            if name.trim().is_empty() {
                errors.push("the new agency needs a name".to_owned());
            }
        }
    }
    if request.feed_name.trim().is_empty() {
        errors.push("the merged feed needs a name".to_owned());
    }

    let feed_counts: Vec<FeedCounts> = loaded
        .iter()
        .map(|l| FeedCounts {
            feed_id: l.record.id,
            feed_name: l.record.name.clone(),
            agency_id: l.record.agency_id,
            agency_name: l.agency_name.clone(),
            counts: counts::entity_counts(&l.feed),
        })
        .collect();
    let totals = counts::totals(&feed_counts);

    let conflicts = if request.sources.len() >= 2 {
        let sources: Vec<Source> = loaded
            .iter()
            .map(|l| Source {
                feed_id: l.record.id,
                agency_id: l.record.agency_id,
                feed: &l.feed,
            })
            .collect();
        match conflicts::detect(&sources) {
            Ok(conflicts) => conflicts,
            Err(EngineError::Precondition(message)) => {
                errors.push(message);
                Vec::new()
            }
            Err(e) => return Err(e),
        }
    } else {
        Vec::new()
    };
    for (entity_type, found) in conflicts::by_type(&conflicts) {
        warnings.push(format!(
            "{} conflicting {entity_type} id(s), auto_prefix on {entity_type} resolves them",
            found.len()
        ));
    }

    let result = ValidationResult {
        valid: errors.is_empty() && conflicts.is_empty(),
        conflicts,
        feed_counts,
        totals,
        warnings,
        errors,
    };
    Ok((result, loaded))
}

/// Validates again, then submits the merge
///
/// Request errors are returned as [EngineError::Precondition]. Conflicts left on
/// `fail_on_conflict` types give a `failed` response without any task.
pub fn execute<S: Store + ?Sized + 'static>(
    store: &Arc<S>,
    scheduler: &dyn TaskScheduler,
    config: &Configuration,
    request: &MergeRequest,
) -> Result<ExecuteMergeResponse> {
    let origin = request.fingerprint(config)?;
    let done = store
        .feeds()?
        .into_iter()
        .find(|r| r.status == FeedStatus::Ready && r.origin.as_deref() == Some(origin.as_str()));
    if let Some(done) = done {
        info!("merge already done in feed {}", done.id);
        return Ok(ExecuteMergeResponse {
            task_id: None,
            new_agency_id: Some(done.agency_id),
            new_feed_id: Some(done.id),
            status: TaskStatus::Completed,
            message: format!("already merged into feed {}", done.id),
            validation_result: None,
        });
    }

    let validation = validate(store.as_ref(), request)?;
    if !validation.errors.is_empty() {
        return Err(EngineError::Precondition(validation.errors.join("; ")));
    }
    let unresolved = unresolved(
        &validation.conflicts,
        &request.strategies,
        config.default_strategy,
    );
    if !unresolved.is_empty() {
        let message = EngineError::Conflict(unresolved).to_string();
        warn!("merge of {:?} rejected: {message}", request.sources);
        return Ok(ExecuteMergeResponse {
            task_id: None,
            new_agency_id: None,
            new_feed_id: None,
            status: TaskStatus::Failed,
            message,
            validation_result: Some(validation),
        });
    }

    let job = MergeJob {
        store: store.clone(),
        request: request.clone(),
        origin,
        default_strategy: config.default_strategy,
        parallel_copy: config.parallel_copy,
        verify_counts: config.verify_counts,
        activate: request.activate(config),
    };
    let task_id = scheduler.submit(
        TaskRequest {
            kind: TaskKind::Merge,
            locks: request.locks(),
            validation_result: Some(validation.clone()),
        },
        Box::new(move |ctx: &TaskContext| job.run(ctx)),
    )?;
    info!("merge of {:?} submitted as task {task_id}", request.sources);

    let info = scheduler.status(task_id)?;
    let status = info.as_ref().map_or(TaskStatus::Pending, |i| i.status);
    let outcome = info.as_ref().and_then(|i| i.outcome.clone()).unwrap_or_default();
    let existing_agency = match request.target {
        MergeTarget::ExistingAgency(id) => Some(id),
        MergeTarget::NewAgency { .. } => None,
    };
    let message = match (status, outcome.feed_id) {
        (TaskStatus::Completed, Some(feed_id)) => format!(
            "merged {} feeds into feed {feed_id}",
            request.sources.len()
        ),
        _ => info
            .and_then(|i| i.message)
            .unwrap_or_else(|| format!("merge task {task_id} is {status}")),
    };
    Ok(ExecuteMergeResponse {
        task_id: Some(task_id),
        new_agency_id: outcome.agency_id.or(existing_agency),
        new_feed_id: outcome.feed_id,
        status,
        message,
        validation_result: Some(validation),
    })
}

/// Drops the `agency_id` columns, which name agency.txt rows of the source feeds
///
/// A produced feed belongs to a single agency of the directory, so the column is left empty.
pub(crate) fn detach_agency(feed: &mut Feed) {
    for route in &mut feed.routes {
        route.agency_id = None;
    }
    for fare in &mut feed.fare_attributes {
        fare.agency_id = None;
    }
}

/// Conflicts of the types left on `fail_on_conflict`
fn unresolved(
    conflicts: &[Conflict],
    strategies: &Strategies,
    default_strategy: Strategy,
) -> Vec<Conflict> {
    conflicts
        .iter()
        .filter(|c| {
            strategy_for(strategies, default_strategy, c.entity_type) == Strategy::FailOnConflict
        })
        .cloned()
        .collect()
}

/// Dangling references or duplicated keys in a feed about to be made visible
pub(crate) fn check_integrity(feed: &Feed) -> Result<()> {
    if let Some(reference) = graph::dangling_references(feed).first() {
        return Err(EngineError::IntegrityViolation(reference.to_string()));
    }
    if let Some((entity_type, id)) = graph::duplicates(feed).first() {
        return Err(EngineError::IntegrityViolation(format!(
            "{entity_type} {id} is duplicated"
        )));
    }
    Ok(())
}

pub(crate) fn check_counts(expected: &Counts, feed: &Feed) -> Result<()> {
    let mismatches = counts::mismatches(expected, &counts::entity_counts(feed));
    if mismatches.is_empty() {
        return Ok(());
    }
    let detail: Vec<String> = mismatches
        .iter()
        .map(|(t, expected, actual)| format!("{t}: expected {expected}, got {actual}"))
        .collect();
    Err(EngineError::IntegrityViolation(format!(
        "count mismatch ({})",
        detail.join(", ")
    )))
}

struct MergeJob<S: ?Sized> {
    store: Arc<S>,
    request: MergeRequest,
    origin: String,
    default_strategy: Strategy,
    parallel_copy: bool,
    verify_counts: bool,
    activate: bool,
}

impl<S: Store + ?Sized> MergeJob<S> {
    fn run(self, ctx: &TaskContext) -> Result<TaskOutcome> {
        let task = ctx.id();
        let store = self.store.as_ref();
        ctx.checkpoint()?;

        // sources are read again under their shared locks
        let (validation, sources) = validate_and_load(store, &self.request)?;
        if !validation.errors.is_empty() {
            return Err(EngineError::Precondition(validation.errors.join("; ")));
        }
        let strategies = &self.request.strategies;
        let unresolved = unresolved(&validation.conflicts, strategies, self.default_strategy);
        if !unresolved.is_empty() {
            return Err(EngineError::Conflict(unresolved));
        }

        let inputs: Vec<(FeedId, &Feed)> = sources
            .iter()
            .map(|l| (l.record.id, &l.feed))
            .collect();
        let resolution = Resolution::plan(
            &inputs,
            &validation.conflicts,
            strategies,
            self.default_strategy,
        )?;
        for entity_type in EntityType::ALL {
            if let Some(map) = resolution.map(entity_type) {
                debug!(
                    "task {task}: {} of {} {entity_type} id(s) rewritten",
                    map.rewritten(),
                    map.len()
                );
            }
        }
        let rewritten = inputs
            .iter()
            .map(|(feed_id, feed)| resolution.apply(*feed_id, feed))
            .collect::<Result<Vec<Feed>>>()?;
        resolution::check_unique(&rewritten)?;
        let mut merged = Feed::default();
        for feed in rewritten {
            merged.extend(feed);
        }
        detach_agency(&mut merged);

        let mut rollback = Rollback::new(store);
        let agency_id = match &self.request.target {
            MergeTarget::ExistingAgency(id) => *id,
            MergeTarget::NewAgency { name, description } => {
                let agency = store.create_agency(name.trim(), description.as_deref())?;
                info!("task {task}: created agency {} ({})", agency.id, agency.name);
                rollback.agency_id = Some(agency.id);
                agency.id
            }
        };
        let record = store.create_feed(NewFeed {
            agency_id,
            name: self.request.feed_name.trim().to_owned(),
            description: self.request.feed_description.clone(),
            origin: Some(self.origin.clone()),
        })?;
        rollback.feed_id = Some(record.id);
        info!("task {task}: merging into feed {}", record.id);

        store::copy_in_layers(store, ctx, record.id, merged, self.parallel_copy)?;
        ctx.checkpoint()?;

        let target = store.load(record.id)?;
        if self.verify_counts {
            check_counts(&validation.totals, &target)?;
        }
        check_integrity(&target)?;

        store.set_status(record.id, FeedStatus::Ready)?;
        if self.activate {
            store.set_active(record.id)?;
        }
        rollback.commit();
        info!("task {task}: feed {} of agency {agency_id} is ready", record.id);
        Ok(TaskOutcome {
            agency_id: Some(agency_id),
            feed_id: Some(record.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{import_feed, AgencyDirectory, FeedStore, MemoryStore};
    use crate::tasks::InlineScheduler;
    use crate::test_utils::*;
    use gtfs_structures::FareAttribute;

    /// Two agencies, one feed each
    fn store_with(a: Feed, b: Feed) -> (Arc<MemoryStore>, FeedId, FeedId) {
        let store = Arc::new(MemoryStore::new());
        let mut ids = Vec::new();
        for (name, feed) in [("A", a), ("B", b)] {
            let agency = store.create_agency(name, None).unwrap();
            let record = import_feed(
                store.as_ref(),
                NewFeed {
                    agency_id: agency.id,
                    name: format!("feed {name}"),
                    ..NewFeed::default()
                },
                feed,
            )
            .unwrap();
            ids.push(record.id);
        }
        (store, ids[0], ids[1])
    }

    fn request(sources: Vec<FeedId>) -> MergeRequest {
        MergeRequest {
            sources,
            target: MergeTarget::NewAgency {
                name: "Merged".to_owned(),
                description: None,
            },
            feed_name: "merged".to_owned(),
            feed_description: None,
            activate_on_success: None,
            strategies: Strategies::new(),
        }
    }

    fn routes(ids: &[&str]) -> Feed {
        Feed {
            routes: ids.iter().map(|id| route(id)).collect(),
            ..Feed::default()
        }
    }

    #[test]
    fn request_errors() {
        let (store, a, b) = store_with(routes(&["1"]), routes(&["2"]));
        let mut req = request(vec![a, a, 99]);
        req.feed_name = " ".to_owned();
        req.target = MergeTarget::ExistingAgency(1);
        let result = validate(store.as_ref(), &req).unwrap();
        assert!(!result.valid);
        assert!(result.errors.contains(&format!("feed {a} is given twice")));
        assert!(result.errors.contains(&"unknown feed 99".to_owned()));
        assert!(result
            .errors
            .contains(&format!("target agency 1 owns source feed {a}")));
        assert!(result
            .errors
            .contains(&"the merged feed needs a name".to_owned()));

        let result = validate(store.as_ref(), &request(vec![b])).unwrap();
        assert_eq!(
            vec!["a merge needs at least 2 source feeds, got 1".to_owned()],
            result.errors
        );
    }

    #[test]
    fn dangling_references_are_errors() {
        let mut broken = routes(&["2"]);
        broken.trips.push(trip("t", "nowhere", "daily", None));
        let (store, a, b) = store_with(routes(&["1"]), broken);
        let result = validate(store.as_ref(), &request(vec![a, b])).unwrap();
        assert_eq!(2, result.errors.len());
        assert_eq!(
            format!("feed {b}: trip.route_id -> route references unknown route 'nowhere'"),
            result.errors[0]
        );
    }

    #[test]
    fn empty_source_is_a_warning() {
        let (store, a, b) = store_with(routes(&["1"]), routes(&["2"]));
        let agency = store.create_agency("C", None).unwrap();
        let empty = import_feed(
            store.as_ref(),
            NewFeed {
                agency_id: agency.id,
                name: "empty".to_owned(),
                ..NewFeed::default()
            },
            Feed::default(),
        )
        .unwrap();
        let result = validate(store.as_ref(), &request(vec![a, b, empty.id])).unwrap();
        assert!(result.valid);
        assert_eq!(vec![format!("feed {} (empty) is empty", empty.id)], result.warnings);
        assert_eq!(2, result.totals[&EntityType::Route]);
    }

    #[test]
    fn conflicts_hint_at_auto_prefix() {
        let (store, a, b) = store_with(routes(&["1", "2"]), routes(&["2", "1"]));
        let result = validate(store.as_ref(), &request(vec![a, b])).unwrap();
        assert!(!result.valid);
        assert!(result.errors.is_empty());
        assert_eq!(2, result.conflicts.len());
        assert_eq!(
            vec!["2 conflicting route id(s), auto_prefix on route resolves them".to_owned()],
            result.warnings
        );
    }

    #[test]
    fn fingerprint_ignores_source_order_and_defaults() {
        let config = Configuration::default();
        let mut first = request(vec![1, 2]);
        let mut second = request(vec![2, 1]);
        second.activate_on_success = Some(false);
        second
            .strategies
            .insert(EntityType::Route, Strategy::FailOnConflict);
        assert_eq!(
            first.fingerprint(&config).unwrap(),
            second.fingerprint(&config).unwrap()
        );
        first
            .strategies
            .insert(EntityType::Stop, Strategy::AutoPrefix);
        assert_ne!(
            first.fingerprint(&config).unwrap(),
            second.fingerprint(&config).unwrap()
        );
        assert!(first.fingerprint(&config).unwrap().starts_with("merge:"));
    }

    #[test]
    fn merge_into_existing_agency() {
        let (store, a, b) = store_with(sample_feed(), routes(&["x"]));
        let target = store.create_agency("Target", None).unwrap();
        let scheduler = InlineScheduler::new();
        let mut req = request(vec![a, b]);
        req.target = MergeTarget::ExistingAgency(target.id);
        req.activate_on_success = Some(true);

        let response = execute(&store, &scheduler, &Configuration::default(), &req).unwrap();
        assert_eq!(TaskStatus::Completed, response.status, "{}", response.message);
        assert_eq!(Some(target.id), response.new_agency_id);
        let feed_id = response.new_feed_id.unwrap();
        let record = store.feed(feed_id).unwrap().unwrap();
        assert!(record.active);
        assert_eq!(FeedStatus::Ready, record.status);
        assert_eq!(3, store.load(feed_id).unwrap().routes.len());
    }

    #[test]
    fn request_json() {
        let json = r#"{
            "sources": [1, 2],
            "target": {"newAgency": {"name": "Metro"}},
            "feedName": "merged",
            "strategies": {"route": "auto_prefix", "stop": "fail_on_conflict"}
        }"#;
        let req: MergeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(Some(&Strategy::AutoPrefix), req.strategies.get(&EntityType::Route));
        assert_eq!(None, req.activate_on_success);

        let value = serde_json::to_value(ValidationResult::default()).unwrap();
        assert!(value.get("feedCounts").is_some());
    }

    #[test]
    fn duplicated_keys_are_errors() {
        let (store, a, b) = store_with(routes(&["1", "1"]), routes(&["2"]));
        let result = validate(store.as_ref(), &request(vec![a, b])).unwrap();
        assert!(!result.valid);
        assert_eq!(vec![format!("feed {a}: route 1 is duplicated")], result.errors);

        let scheduler = InlineScheduler::new();
        assert!(matches!(
            execute(&store, &scheduler, &Configuration::default(), &request(vec![a, b])),
            Err(EngineError::Precondition(_))
        ));
        assert_eq!(2, store.feeds().unwrap().len());
    }

    #[test]
    fn agency_columns_are_cleared() {
        let mut a = routes(&["1"]);
        a.routes[0].agency_id = Some("STM".to_owned());
        let mut b = routes(&["2"]);
        b.fare_attributes.push(FareAttribute {
            agency_id: Some("RTL".to_owned()),
            ..fare("day_pass")
        });
        let (store, a, b) = store_with(a, b);

        let scheduler = InlineScheduler::new();
        let response =
            execute(&store, &scheduler, &Configuration::default(), &request(vec![a, b])).unwrap();
        assert_eq!(TaskStatus::Completed, response.status, "{}", response.message);
        let merged = store.load(response.new_feed_id.unwrap()).unwrap();
        assert!(merged.routes.iter().all(|r| r.agency_id.is_none()));
        assert_eq!(None, merged.fare_attributes[0].agency_id);
    }
}
