//! Transport agnostic entry points of the engine.

use crate::configuration::Configuration;
use crate::error::Result;
use crate::merge::{self, ExecuteMergeResponse, MergeRequest, ValidationResult};
use crate::split::{self, ExecuteSplitResponse, SplitDependencies, SplitRequest};
use crate::store::{AgencyId, FeedId, Store};
use crate::tasks::{TaskId, TaskInfo, TaskScheduler};
use log::debug;
use std::sync::Arc;

/// Merge and split operations over a store, running their jobs on a scheduler
pub struct FeedService<S: Store + ?Sized + 'static> {
    store: Arc<S>,
    scheduler: Arc<dyn TaskScheduler>,
    config: Configuration,
}

impl<S: Store + ?Sized + 'static> FeedService<S> {
    pub fn new(store: Arc<S>, scheduler: Arc<dyn TaskScheduler>, config: Configuration) -> Self {
        FeedService {
            store,
            scheduler,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Read only, safe to call on every refresh
    pub fn validate_merge(&self, request: &MergeRequest) -> Result<ValidationResult> {
        debug!("validating merge of {:?}", request.sources);
        merge::validate(self.store.as_ref(), request)
    }

    pub fn execute_merge(&self, request: &MergeRequest) -> Result<ExecuteMergeResponse> {
        merge::execute(&self.store, self.scheduler.as_ref(), &self.config, request)
    }

    /// Read only
    pub fn compute_split_dependencies(
        &self,
        feed_id: FeedId,
        route_ids: &[String],
    ) -> Result<SplitDependencies> {
        split::compute_dependencies(self.store.as_ref(), feed_id, route_ids)
    }

    pub fn execute_split(
        &self,
        agency_id: AgencyId,
        request: &SplitRequest,
    ) -> Result<ExecuteSplitResponse> {
        split::execute(
            &self.store,
            self.scheduler.as_ref(),
            &self.config,
            agency_id,
            request,
        )
    }

    pub fn task_status(&self, id: TaskId) -> Result<Option<TaskInfo>> {
        self.scheduler.status(id)
    }

    /// False when the task is unknown or already finished
    pub fn cancel_task(&self, id: TaskId) -> Result<bool> {
        self.scheduler.cancel(id)
    }
}
