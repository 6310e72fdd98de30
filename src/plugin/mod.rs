//! The plugin contract.
//!
//! A plugin describes one particular graph computation: how vertices are
//! materialized, what a vertex does each superstep, how user payloads are
//! marshaled, and which combiner/aggregators apply. The engine consumes a
//! plugin through the object-safe traits below and never inspects user
//! values beyond the plugin's own codec and aggregate functions.

mod value;

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use value::{
    decode_string, decode_u32, decode_u64, encode_string, encode_u32, encode_u64, AnyValue,
};

/// Globally unique vertex identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(String);

impl VertexId {
    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VertexId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VertexId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// In-process holder for an opaque user value (a message payload or an
/// aggregatable value). Plugins downcast to their concrete types.
pub type UserValue = Box<dyn Any + Send>;

/// Everything a vertex can see and do while computing one superstep.
pub trait ComputeContext {
    /// Index of the current superstep, starting at 0.
    fn superstep(&self) -> u64;

    /// Messages delivered to this vertex during the previous superstep.
    fn received_messages(&self) -> &[UserValue];

    /// Queue a message for `dest`, delivered at the next superstep.
    fn send_message_to(&mut self, dest: VertexId, message: UserValue) -> anyhow::Result<()>;

    /// Declare this vertex has no further work. It is skipped in subsequent
    /// steps until a message re-activates it.
    fn vote_to_halt(&mut self);

    /// Read an aggregated value as of the end of the previous superstep.
    fn get_aggregated(&self, name: &str) -> anyhow::Result<Option<UserValue>>;

    /// Record a delta for `name`, folded into the aggregator this step.
    fn put_aggregatable(&mut self, name: &str, value: UserValue) -> anyhow::Result<()>;
}

/// A single vertex's user state and computation.
pub trait VertexProgram: Send {
    /// Run one superstep for this vertex.
    fn compute(&mut self, ctx: &mut dyn ComputeContext) -> anyhow::Result<()>;

    /// The vertex id.
    fn id(&self) -> &VertexId;

    /// Render the current vertex value for diagnostics.
    fn value_as_string(&self) -> String;
}

/// Commutative-associative reducer producing one global value per superstep.
///
/// Absence is the identity: the engine only calls [`aggregate`]
/// (Aggregator::aggregate) when both sides are present.
pub trait Aggregator: Send + Sync {
    /// Unique aggregator name.
    fn name(&self) -> &str;

    /// Fold two values into one.
    fn aggregate(&self, a: UserValue, b: UserValue) -> anyhow::Result<UserValue>;

    /// Marshal a value for cross-boundary transport.
    fn marshal_value(&self, v: &UserValue) -> anyhow::Result<AnyValue>;

    /// Unmarshal a transported value.
    fn unmarshal_value(&self, pb: &AnyValue) -> anyhow::Result<UserValue>;

    /// Render a value for display.
    fn to_display(&self, v: &UserValue) -> String;
}

/// Optional per-destination message reducer applied before delivery.
///
/// Must be commutative, associative, and non-expanding: the returned list is
/// non-empty and no longer than the input.
pub trait Combiner: Send + Sync {
    /// Fold the messages queued for `destination` within one superstep.
    fn combine(
        &self,
        destination: &VertexId,
        messages: Vec<UserValue>,
    ) -> anyhow::Result<Vec<UserValue>>;
}

/// A particular graph computation, supplied by the user.
pub trait Plugin: Send + Sync + 'static {
    /// Materialize a single vertex by id (per-vertex load path).
    fn new_vertex(&self, id: &VertexId) -> anyhow::Result<Box<dyn VertexProgram>>;

    /// Materialize every vertex of one partition (bulk load path). Each
    /// produced program must be handed to `register`.
    fn new_partition_vertices(
        &self,
        partition_id: u64,
        num_of_partitions: u64,
        register: &mut dyn FnMut(Box<dyn VertexProgram>),
    ) -> anyhow::Result<()>;

    /// Deterministically map a vertex id to its owning partition.
    fn partition(&self, vertex: &VertexId, num_of_partitions: u64) -> anyhow::Result<u64>;

    /// Marshal a user message payload for transport.
    fn marshal_message(&self, message: &UserValue) -> anyhow::Result<AnyValue>;

    /// Unmarshal a transported user message payload.
    fn unmarshal_message(&self, pb: &AnyValue) -> anyhow::Result<UserValue>;

    /// The message combiner, if this computation has one.
    fn combiner(&self) -> Option<&dyn Combiner> {
        None
    }

    /// User aggregators to register for the job.
    fn aggregators(&self) -> &[Box<dyn Aggregator>] {
        &[]
    }
}

/// Default partitioner: FNV-1a over the vertex id, reduced modulo
/// `num_of_partitions`.
pub fn hash_partition(vertex: &VertexId, num_of_partitions: u64) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in vertex.as_str().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash % num_of_partitions.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_partition_is_deterministic_and_in_range() {
        let n = 7;
        for id in ["a", "b", "vertex-42", ""] {
            let vid = VertexId::from(id);
            let p = hash_partition(&vid, n);
            assert_eq!(p, hash_partition(&vid, n));
            assert!(p < n);
        }
    }

    #[test]
    fn hash_partition_spreads_ids() {
        let n = 4;
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            seen.insert(hash_partition(&VertexId::from(format!("v{i}").as_str()), n));
        }
        assert!(seen.len() > 1);
    }
}
