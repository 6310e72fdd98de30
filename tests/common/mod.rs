//! Shared fixtures: small in-memory graph plugins driving the engine the
//! way a real computation would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};

use grapnel::plugin::{
    decode_u32, encode_u32, hash_partition, Aggregator, AnyValue, Combiner, ComputeContext,
    Plugin, UserValue, VertexId, VertexProgram,
};

/// Name of the user aggregator registered by [`MaxValuePlugin`].
pub const MAX_AGGREGATOR: &str = "maximum";

/// Opt-in engine logging for debugging runs: `RUST_LOG=debug cargo test`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn max_of(messages: &[UserValue]) -> anyhow::Result<u32> {
    if messages.is_empty() {
        bail!("expects non-empty messages");
    }
    let mut max = 0u32;
    for message in messages {
        let value = message
            .downcast_ref::<u32>()
            .ok_or_else(|| anyhow!("unexpected message type"))?;
        max = max.max(*value);
    }
    Ok(max)
}

// ============================================================================
// Maximum-value propagation plugin
// ============================================================================

struct MaxVertex {
    id: VertexId,
    value: u32,
    outgoing: Vec<VertexId>,
}

impl VertexProgram for MaxVertex {
    fn compute(&mut self, ctx: &mut dyn ComputeContext) -> anyhow::Result<()> {
        // no messages are visible in superstep 0
        if ctx.superstep() > 0 {
            let incoming = {
                let messages = ctx.received_messages();
                if messages.is_empty() {
                    None
                } else {
                    Some(max_of(messages)?)
                }
            };
            match incoming {
                None => {
                    ctx.vote_to_halt();
                    return ctx.put_aggregatable(MAX_AGGREGATOR, Box::new(self.value));
                }
                Some(max) if max <= self.value => {
                    ctx.vote_to_halt();
                    return ctx.put_aggregatable(MAX_AGGREGATOR, Box::new(self.value));
                }
                Some(max) => self.value = max,
            }
        }

        for edge in self.outgoing.clone() {
            ctx.send_message_to(edge, Box::new(self.value))?;
        }
        ctx.put_aggregatable(MAX_AGGREGATOR, Box::new(self.value))
    }

    fn id(&self) -> &VertexId {
        &self.id
    }

    fn value_as_string(&self) -> String {
        self.value.to_string()
    }
}

struct MaxAggregator;

impl Aggregator for MaxAggregator {
    fn name(&self) -> &str {
        MAX_AGGREGATOR
    }

    fn aggregate(&self, a: UserValue, b: UserValue) -> anyhow::Result<UserValue> {
        let (a, b) = match (a.downcast::<u32>(), b.downcast::<u32>()) {
            (Ok(a), Ok(b)) => (*a, *b),
            _ => bail!("max aggregator expects u32 values"),
        };
        Ok(Box::new(a.max(b)))
    }

    fn marshal_value(&self, v: &UserValue) -> anyhow::Result<AnyValue> {
        let value = v
            .downcast_ref::<u32>()
            .ok_or_else(|| anyhow!("max aggregator expects u32 values"))?;
        Ok(encode_u32(*value))
    }

    fn unmarshal_value(&self, pb: &AnyValue) -> anyhow::Result<UserValue> {
        Ok(Box::new(decode_u32(pb)?))
    }

    fn to_display(&self, v: &UserValue) -> String {
        match v.downcast_ref::<u32>() {
            Some(value) => value.to_string(),
            None => "<unknown>".to_string(),
        }
    }
}

pub struct MaxCombiner;

impl Combiner for MaxCombiner {
    fn combine(
        &self,
        _destination: &VertexId,
        messages: Vec<UserValue>,
    ) -> anyhow::Result<Vec<UserValue>> {
        let max = max_of(&messages)?;
        Ok(vec![Box::new(max)])
    }
}

/// Maximum-value propagation over a fixed adjacency table.
pub struct MaxValuePlugin {
    graph: HashMap<VertexId, (u32, Vec<VertexId>)>,
    partition_overrides: HashMap<VertexId, u64>,
    use_combiner: bool,
    combiner: MaxCombiner,
    aggregators: Vec<Box<dyn Aggregator>>,
}

impl MaxValuePlugin {
    /// Build from `(vertex, initial value, outgoing edges)` rows.
    pub fn new(rows: &[(&str, u32, &[&str])]) -> Self {
        let graph = rows
            .iter()
            .map(|(id, value, edges)| {
                (
                    VertexId::from(*id),
                    (*value, edges.iter().map(|e| VertexId::from(*e)).collect()),
                )
            })
            .collect();
        Self {
            graph,
            partition_overrides: HashMap::new(),
            use_combiner: false,
            combiner: MaxCombiner,
            aggregators: vec![Box::new(MaxAggregator)],
        }
    }

    /// Fold same-destination messages through the max combiner.
    pub fn with_combiner(mut self) -> Self {
        self.use_combiner = true;
        self
    }

    /// Pin a vertex to a partition instead of hashing.
    pub fn with_partition_override(mut self, vertex: &str, partition: u64) -> Self {
        self.partition_overrides
            .insert(VertexId::from(vertex), partition);
        self
    }

    fn partition_for(&self, vertex: &VertexId, num_of_partitions: u64) -> u64 {
        match self.partition_overrides.get(vertex) {
            Some(partition) => *partition,
            None => hash_partition(vertex, num_of_partitions),
        }
    }
}

impl Plugin for MaxValuePlugin {
    fn new_vertex(&self, id: &VertexId) -> anyhow::Result<Box<dyn VertexProgram>> {
        let (value, outgoing) = self
            .graph
            .get(id)
            .with_context(|| format!("unknown vertex {id}"))?;
        Ok(Box::new(MaxVertex {
            id: id.clone(),
            value: *value,
            outgoing: outgoing.clone(),
        }))
    }

    fn new_partition_vertices(
        &self,
        partition_id: u64,
        num_of_partitions: u64,
        register: &mut dyn FnMut(Box<dyn VertexProgram>),
    ) -> anyhow::Result<()> {
        for (id, (value, outgoing)) in &self.graph {
            if self.partition_for(id, num_of_partitions) == partition_id {
                register(Box::new(MaxVertex {
                    id: id.clone(),
                    value: *value,
                    outgoing: outgoing.clone(),
                }));
            }
        }
        Ok(())
    }

    fn partition(&self, vertex: &VertexId, num_of_partitions: u64) -> anyhow::Result<u64> {
        Ok(self.partition_for(vertex, num_of_partitions))
    }

    fn marshal_message(&self, message: &UserValue) -> anyhow::Result<AnyValue> {
        let value = message
            .downcast_ref::<u32>()
            .ok_or_else(|| anyhow!("unexpected message type"))?;
        Ok(encode_u32(*value))
    }

    fn unmarshal_message(&self, pb: &AnyValue) -> anyhow::Result<UserValue> {
        Ok(Box::new(decode_u32(pb)?))
    }

    fn combiner(&self) -> Option<&dyn Combiner> {
        if self.use_combiner {
            Some(&self.combiner)
        } else {
            None
        }
    }

    fn aggregators(&self) -> &[Box<dyn Aggregator>] {
        &self.aggregators
    }
}

/// The four-vertex propagation graph: `A->B, B->C, C->D, A->C`.
pub fn four_vertex_plugin() -> Arc<MaxValuePlugin> {
    Arc::new(MaxValuePlugin::new(&[
        ("A", 5, &["B", "C"]),
        ("B", 2, &["C"]),
        ("C", 9, &["D"]),
        ("D", 1, &[]),
    ]))
}

// ============================================================================
// Halt / re-wake plugin
// ============================================================================

struct SleeperVertex {
    id: VertexId,
    last_computed: Option<u64>,
}

impl VertexProgram for SleeperVertex {
    fn compute(&mut self, ctx: &mut dyn ComputeContext) -> anyhow::Result<()> {
        self.last_computed = Some(ctx.superstep());
        ctx.vote_to_halt();
        Ok(())
    }

    fn id(&self) -> &VertexId {
        &self.id
    }

    fn value_as_string(&self) -> String {
        match self.last_computed {
            Some(step) => step.to_string(),
            None => "never".to_string(),
        }
    }
}

struct WakerVertex {
    id: VertexId,
    target: VertexId,
}

impl VertexProgram for WakerVertex {
    fn compute(&mut self, ctx: &mut dyn ComputeContext) -> anyhow::Result<()> {
        match ctx.superstep() {
            2 => ctx.send_message_to(self.target.clone(), Box::new(1u32))?,
            step if step >= 3 => ctx.vote_to_halt(),
            _ => {}
        }
        Ok(())
    }

    fn id(&self) -> &VertexId {
        &self.id
    }

    fn value_as_string(&self) -> String {
        "waker".to_string()
    }
}

/// Two vertices: `sleeper` halts immediately every time it runs, `waker`
/// pokes it with one message at superstep 2.
pub struct WakePlugin;

impl WakePlugin {
    fn build(&self, id: &VertexId) -> Option<Box<dyn VertexProgram>> {
        match id.as_str() {
            "sleeper" => Some(Box::new(SleeperVertex {
                id: id.clone(),
                last_computed: None,
            })),
            "waker" => Some(Box::new(WakerVertex {
                id: id.clone(),
                target: VertexId::from("sleeper"),
            })),
            _ => None,
        }
    }
}

impl Plugin for WakePlugin {
    fn new_vertex(&self, id: &VertexId) -> anyhow::Result<Box<dyn VertexProgram>> {
        self.build(id).ok_or_else(|| anyhow!("unknown vertex {id}"))
    }

    fn new_partition_vertices(
        &self,
        partition_id: u64,
        num_of_partitions: u64,
        register: &mut dyn FnMut(Box<dyn VertexProgram>),
    ) -> anyhow::Result<()> {
        for id in ["sleeper", "waker"] {
            let id = VertexId::from(id);
            if hash_partition(&id, num_of_partitions) == partition_id {
                register(self.build(&id).expect("known vertex"));
            }
        }
        Ok(())
    }

    fn partition(&self, vertex: &VertexId, num_of_partitions: u64) -> anyhow::Result<u64> {
        Ok(hash_partition(vertex, num_of_partitions))
    }

    fn marshal_message(&self, message: &UserValue) -> anyhow::Result<AnyValue> {
        let value = message
            .downcast_ref::<u32>()
            .ok_or_else(|| anyhow!("unexpected message type"))?;
        Ok(encode_u32(*value))
    }

    fn unmarshal_message(&self, pb: &AnyValue) -> anyhow::Result<UserValue> {
        Ok(Box::new(decode_u32(pb)?))
    }
}

// ============================================================================
// Combiner observation plugin
// ============================================================================

struct SenderVertex {
    id: VertexId,
    payload: u32,
    dest: VertexId,
}

impl VertexProgram for SenderVertex {
    fn compute(&mut self, ctx: &mut dyn ComputeContext) -> anyhow::Result<()> {
        if ctx.superstep() == 0 {
            ctx.send_message_to(self.dest.clone(), Box::new(self.payload))?;
        }
        // halting in the same step the message goes out is fine; the
        // message is still delivered
        ctx.vote_to_halt();
        Ok(())
    }

    fn id(&self) -> &VertexId {
        &self.id
    }

    fn value_as_string(&self) -> String {
        self.payload.to_string()
    }
}

struct CollectorVertex {
    id: VertexId,
    observed: String,
}

impl VertexProgram for CollectorVertex {
    fn compute(&mut self, ctx: &mut dyn ComputeContext) -> anyhow::Result<()> {
        if ctx.superstep() > 0 {
            let summary = {
                let messages = ctx.received_messages();
                if messages.is_empty() {
                    None
                } else {
                    Some(format!("{}/{}", messages.len(), max_of(messages)?))
                }
            };
            if let Some(summary) = summary {
                self.observed = summary;
            }
            ctx.vote_to_halt();
        }
        Ok(())
    }

    fn id(&self) -> &VertexId {
        &self.id
    }

    fn value_as_string(&self) -> String {
        self.observed.clone()
    }
}

/// Senders co-located on partition 0 fire one message each at a collector
/// on partition 1; the collector records how many messages it actually saw
/// and their maximum, making the combiner's fold observable.
pub struct CombinerProbePlugin {
    senders: Vec<(VertexId, u32)>,
    collector: VertexId,
    combiner: MaxCombiner,
}

impl CombinerProbePlugin {
    pub fn new(payloads: &[u32]) -> Self {
        Self {
            senders: payloads
                .iter()
                .enumerate()
                .map(|(i, p)| (VertexId::from(format!("s{i}").as_str()), *p))
                .collect(),
            collector: VertexId::from("collector"),
            combiner: MaxCombiner,
        }
    }
}

impl Plugin for CombinerProbePlugin {
    fn new_vertex(&self, id: &VertexId) -> anyhow::Result<Box<dyn VertexProgram>> {
        if *id == self.collector {
            return Ok(Box::new(CollectorVertex {
                id: id.clone(),
                observed: "0/0".to_string(),
            }));
        }
        self.senders
            .iter()
            .find(|(sender, _)| sender == id)
            .map(|(sender, payload)| {
                Box::new(SenderVertex {
                    id: sender.clone(),
                    payload: *payload,
                    dest: self.collector.clone(),
                }) as Box<dyn VertexProgram>
            })
            .ok_or_else(|| anyhow!("unknown vertex {id}"))
    }

    fn new_partition_vertices(
        &self,
        partition_id: u64,
        _num_of_partitions: u64,
        register: &mut dyn FnMut(Box<dyn VertexProgram>),
    ) -> anyhow::Result<()> {
        if partition_id == 0 {
            for (sender, _) in &self.senders {
                register(self.new_vertex(sender)?);
            }
        } else if partition_id == 1 {
            register(self.new_vertex(&self.collector)?);
        }
        Ok(())
    }

    fn partition(&self, vertex: &VertexId, _num_of_partitions: u64) -> anyhow::Result<u64> {
        if *vertex == self.collector {
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn marshal_message(&self, message: &UserValue) -> anyhow::Result<AnyValue> {
        let value = message
            .downcast_ref::<u32>()
            .ok_or_else(|| anyhow!("unexpected message type"))?;
        Ok(encode_u32(*value))
    }

    fn unmarshal_message(&self, pb: &AnyValue) -> anyhow::Result<UserValue> {
        Ok(Box::new(decode_u32(pb)?))
    }

    fn combiner(&self) -> Option<&dyn Combiner> {
        Some(&self.combiner)
    }
}
