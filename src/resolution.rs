//! Identifier rewriting for merges.
//!
//! A [Resolution] is computed once from the sources and the conflicts, then applied to each
//! source in a single pass. Nothing is mutated while the maps are being built.

use crate::conflicts::Conflict;
use crate::error::{EngineError, Result};
use crate::graph::{self, with_table_mut, ForeignKey, Row};
use crate::store::FeedId;
use gtfs_structures::{EntityType, Feed};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// How identifier collisions of one entity type are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Any collision aborts the merge before anything is written
    #[default]
    FailOnConflict,
    /// Every id of the type is prefixed with its source feed, see [prefixed_id]
    AutoPrefix,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Strategy::FailOnConflict => "fail_on_conflict",
            Strategy::AutoPrefix => "auto_prefix",
        })
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fail_on_conflict" => Ok(Strategy::FailOnConflict),
            "auto_prefix" => Ok(Strategy::AutoPrefix),
            _ => Err(format!(
                "unknown strategy '{s}', expected fail_on_conflict or auto_prefix"
            )),
        }
    }
}

pub type Strategies = BTreeMap<EntityType, Strategy>;

/// Identifier given by `auto_prefix` to `id` coming from feed `feed_id`
///
/// Feed ids are distinct numbers ended by `_`, so two sources can never produce the same
/// identifier.
///
/// ```
/// assert_eq!("f12_1", feedmerge::resolution::prefixed_id(12, "1"));
/// ```
pub fn prefixed_id(feed_id: FeedId, id: &str) -> String {
    format!("f{feed_id}_{id}")
}

/// Final identifier of every `(source feed, original id)` of one entity type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteMap {
    entries: FxHashMap<(FeedId, String), String>,
}

impl RewriteMap {
    pub fn get(&self, feed_id: FeedId, id: &str) -> Option<&str> {
        self.entries
            .get(&(feed_id, id.to_owned()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifiers that are changed by the map
    pub fn rewritten(&self) -> usize {
        self.entries.iter().filter(|((_, from), to)| from != *to).count()
    }
}

/// The rewrite maps of every keyed type
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    maps: BTreeMap<EntityType, RewriteMap>,
    /// Fare zones are prefixed along with the stops
    prefix_zones: bool,
}

/// Strategy of an entity type, `default` when not given
pub fn strategy_for(strategies: &Strategies, default: Strategy, entity_type: EntityType) -> Strategy {
    strategies.get(&entity_type).copied().unwrap_or(default)
}

impl Resolution {
    /// Builds the rewrite maps, or fails with every conflict on a `fail_on_conflict` type
    ///
    /// Strategies given for composite types are ignored.
    pub fn plan(
        sources: &[(FeedId, &Feed)],
        conflicts: &[Conflict],
        strategies: &Strategies,
        default: Strategy,
    ) -> Result<Self> {
        let unresolved: Vec<Conflict> = conflicts
            .iter()
            .filter(|c| {
                strategy_for(strategies, default, c.entity_type) == Strategy::FailOnConflict
            })
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            return Err(EngineError::Conflict(unresolved));
        }

        let mut maps = BTreeMap::new();
        for entity_type in EntityType::ALL.into_iter().filter(|t| t.is_keyed()) {
            let strategy = strategy_for(strategies, default, entity_type);
            let mut map = RewriteMap::default();
            for (feed_id, feed) in sources {
                for id in graph::ids(feed, entity_type) {
                    let target = match strategy {
                        Strategy::FailOnConflict => id.to_owned(),
                        Strategy::AutoPrefix => prefixed_id(*feed_id, id),
                    };
                    map.entries.insert((*feed_id, id.to_owned()), target);
                }
            }
            maps.insert(entity_type, map);
        }
        let prefix_zones =
            strategy_for(strategies, default, EntityType::Stop) == Strategy::AutoPrefix;
        Ok(Resolution { maps, prefix_zones })
    }

    pub fn map(&self, entity_type: EntityType) -> Option<&RewriteMap> {
        self.maps.get(&entity_type)
    }

    fn lookup(&self, entity_type: EntityType, feed_id: FeedId, id: &str) -> Result<String> {
        self.maps
            .get(&entity_type)
            .and_then(|m| m.get(feed_id, id))
            .map(str::to_owned)
            .ok_or_else(|| {
                EngineError::IntegrityViolation(format!(
                    "no rewrite for {entity_type} '{id}' of feed {feed_id}"
                ))
            })
    }

    /// Rewritten copy of the feed `feed_id`: own keys through the map of their type,
    /// references through the map of the type they reference, zones like stops
    pub fn apply(&self, feed_id: FeedId, feed: &Feed) -> Result<Feed> {
        fn rewrite_rows<R: Row>(
            resolution: &Resolution,
            feed_id: FeedId,
            rows: &mut [R],
        ) -> Result<()> {
            let edges: Vec<ForeignKey> = graph::edges_from(R::ENTITY_TYPE).collect();
            for row in rows {
                if let Some(key) = row.key_mut() {
                    *key = resolution.lookup(R::ENTITY_TYPE, feed_id, key)?;
                }
                for fk in &edges {
                    if let Some(value) = row.reference_mut(*fk) {
                        *value = resolution.lookup(fk.referenced(), feed_id, value)?;
                    }
                }
            }
            Ok(())
        }

        let mut rewritten = feed.clone();
        for entity_type in EntityType::ALL {
            with_table_mut!(rewritten, entity_type, rows => rewrite_rows(self, feed_id, rows))?;
        }
        if self.prefix_zones {
            for zone in graph::zones_mut(&mut rewritten) {
                *zone = prefixed_id(feed_id, zone);
            }
        }
        Ok(rewritten)
    }
}

/// Fails when the union of the rewritten feeds would hold the same key twice
pub fn check_unique(feeds: &[Feed]) -> Result<()> {
    let mut union = Feed::default();
    for feed in feeds {
        union.extend(feed.clone());
    }
    let duplicates = graph::duplicates(&union);
    if duplicates.is_empty() {
        return Ok(());
    }
    let sample: BTreeSet<String> = duplicates
        .iter()
        .take(5)
        .map(|(t, id)| format!("{t} {id}"))
        .collect();
    Err(EngineError::IntegrityViolation(format!(
        "{} duplicated key(s) after resolution: {}",
        duplicates.len(),
        sample.into_iter().collect::<Vec<_>>().join(", ")
    )))
}
