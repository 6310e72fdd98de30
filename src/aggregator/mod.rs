//! Aggregator reduction across the hierarchy.
//!
//! Aggregated values travel upward in marshaled form and are folded
//! name-by-name at every level: vertex deltas into a partition map,
//! partition maps into a worker map, worker maps into the coordinator's
//! per-step map. Absence is the identity, so a name present on only one
//! side is carried through unchanged.
//!
//! The engine registers one system aggregator, [`VertexStats`], which every
//! partition contributes each step; the coordinator reads it to decide
//! termination.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::plugin::{Aggregator, AnyValue, Plugin, UserValue};

/// Name under which the per-step vertex statistics are aggregated.
pub const VERTEX_STATS_NAME: &str = "grapnel/vertex-stats";

/// Per-step vertex statistics, the BSP termination oracle.
///
/// `active_vertices` counts vertices that did not vote to halt during the
/// step. The count is known-imprecise (a vertex can receive mail after it
/// acked), so the termination predicate also requires `messages_sent == 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexStats {
    /// Vertices still active after this step.
    pub active_vertices: u64,
    /// Messages emitted during this step.
    pub messages_sent: u64,
}

impl VertexStats {
    /// Marshal into the transport form used by the stats aggregator.
    pub fn to_any(self) -> AnyValue {
        // plain struct of two u64s, serialization cannot fail
        let value = serde_json::to_vec(&self).expect("vertex stats serialize");
        AnyValue::new(VERTEX_STATS_NAME, value)
    }
}

/// System aggregator summing [`VertexStats`] componentwise.
pub struct VertexStatsAggregator;

static VERTEX_STATS_AGGREGATOR: VertexStatsAggregator = VertexStatsAggregator;

impl Aggregator for VertexStatsAggregator {
    fn name(&self) -> &str {
        VERTEX_STATS_NAME
    }

    fn aggregate(&self, a: UserValue, b: UserValue) -> anyhow::Result<UserValue> {
        let (a, b) = match (a.downcast::<VertexStats>(), b.downcast::<VertexStats>()) {
            (Ok(a), Ok(b)) => (a, b),
            _ => bail!("vertex stats aggregator received a non-stats value"),
        };
        Ok(Box::new(VertexStats {
            active_vertices: a.active_vertices + b.active_vertices,
            messages_sent: a.messages_sent + b.messages_sent,
        }))
    }

    fn marshal_value(&self, v: &UserValue) -> anyhow::Result<AnyValue> {
        let stats = v
            .downcast_ref::<VertexStats>()
            .context("vertex stats aggregator received a non-stats value")?;
        Ok(stats.to_any())
    }

    fn unmarshal_value(&self, pb: &AnyValue) -> anyhow::Result<UserValue> {
        if pb.type_url != VERTEX_STATS_NAME {
            bail!("unexpected stats payload tag: {}", pb.type_url);
        }
        let stats: VertexStats =
            serde_json::from_slice(&pb.value).context("decoding vertex stats")?;
        Ok(Box::new(stats))
    }

    fn to_display(&self, v: &UserValue) -> String {
        match v.downcast_ref::<VertexStats>() {
            Some(s) => format!(
                "active={} messages={}",
                s.active_vertices, s.messages_sent
            ),
            None => "<not vertex stats>".to_string(),
        }
    }
}

/// Fully-reduced aggregator values of one superstep, published by the
/// coordinator at the end of the step they describe.
#[derive(Debug, Clone, Default)]
pub struct AggregatedSnapshot {
    /// The step whose values these are.
    pub superstep: u64,
    /// Marshaled values per aggregator name.
    pub values: Arc<HashMap<String, AnyValue>>,
}

/// Whether `name` belongs to an engine-internal aggregator.
pub fn is_system_aggregator(name: &str) -> bool {
    name == VERTEX_STATS_NAME
}

/// Look up an aggregator by name across the system set and the plugin's.
pub fn find_aggregator<'a>(plugin: &'a dyn Plugin, name: &str) -> Option<&'a dyn Aggregator> {
    if name == VERTEX_STATS_NAME {
        return Some(&VERTEX_STATS_AGGREGATOR);
    }
    plugin
        .aggregators()
        .iter()
        .find(|a| a.name() == name)
        .map(|a| a.as_ref())
}

/// Fold `incoming` into `acc` name-by-name.
///
/// Both maps hold marshaled values; a name present on both sides is
/// unmarshaled, aggregated, and re-marshaled, otherwise the incoming value
/// is carried through as-is.
pub fn merge_value_maps(
    plugin: &dyn Plugin,
    acc: &mut HashMap<String, AnyValue>,
    incoming: &HashMap<String, AnyValue>,
) -> Result<()> {
    for (name, value) in incoming {
        let merged = match acc.remove(name) {
            Some(existing) => {
                let aggregator = find_aggregator(plugin, name).ok_or_else(|| {
                    EngineError::Aggregator {
                        name: name.clone(),
                        message: "unknown aggregator".to_string(),
                    }
                })?;
                let folded = aggregator
                    .unmarshal_value(&existing)
                    .and_then(|a| {
                        let b = aggregator.unmarshal_value(value)?;
                        aggregator.aggregate(a, b)
                    })
                    .and_then(|v| aggregator.marshal_value(&v))
                    .map_err(|e| EngineError::Aggregator {
                        name: name.clone(),
                        message: format!("{e:#}"),
                    })?;
                folded
            }
            None => value.clone(),
        };
        acc.insert(name.clone(), merged);
    }
    Ok(())
}

/// Unmarshal the value aggregated under `name`, if present.
pub fn get_aggregated_value(
    plugin: &dyn Plugin,
    values: &HashMap<String, AnyValue>,
    name: &str,
) -> Result<Option<UserValue>> {
    let Some(value) = values.get(name) else {
        return Ok(None);
    };
    let aggregator = find_aggregator(plugin, name).ok_or_else(|| EngineError::Aggregator {
        name: name.to_string(),
        message: "unknown aggregator".to_string(),
    })?;
    aggregator
        .unmarshal_value(value)
        .map(Some)
        .map_err(|e| EngineError::Aggregator {
            name: name.to_string(),
            message: format!("{e:#}"),
        })
}

/// Extract the [`VertexStats`] entry from a reduced value map.
pub fn get_stats(values: &HashMap<String, AnyValue>) -> Result<VertexStats> {
    let Some(value) = values.get(VERTEX_STATS_NAME) else {
        return Err(EngineError::Protocol {
            message: "vertex stats missing from aggregated values".to_string(),
        });
    };
    if value.type_url != VERTEX_STATS_NAME {
        return Err(EngineError::Aggregator {
            name: VERTEX_STATS_NAME.to_string(),
            message: format!("unexpected payload tag: {}", value.type_url),
        });
    }
    serde_json::from_slice(&value.value).map_err(|e| EngineError::Aggregator {
        name: VERTEX_STATS_NAME.to_string(),
        message: e.to_string(),
    })
}
