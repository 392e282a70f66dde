/*! Merging and splitting of GTFS feeds.

A merge copies two or more feeds into a new one, detecting identifiers used by several sources
and rewriting them per entity type ([resolution::Strategy]). A split moves a set of routes, with
every row they need, into a new agency, copying the rows that the rest of the feed still uses.

Both run as tasks on a [tasks::TaskScheduler] and talk to storage through [store::FeedStore] and
[store::AgencyDirectory]. [service::FeedService] is the entry point.

The foreign keys between GTFS tables are listed once, in [graph::ForeignKey], and every
component walks that list.
*/

pub mod configuration;
pub mod conflicts;
pub mod counts;
pub mod error;
pub mod graph;
pub mod merge;
pub mod resolution;
pub mod service;
pub mod split;
pub mod store;
pub mod tasks;
#[cfg(test)]
mod test_utils;

pub use configuration::Configuration;
pub use error::{EngineError, Result};
pub use merge::{ExecuteMergeResponse, MergeRequest, MergeTarget, ValidationResult};
pub use resolution::Strategy;
pub use service::FeedService;
pub use split::{ExecuteSplitResponse, SplitDependencies, SplitRequest};
pub use store::{MemoryStore, Store};
pub use tasks::{InlineScheduler, TaskScheduler, TaskStatus, TokioScheduler};
