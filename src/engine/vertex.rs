//! The vertex actor: one per graph vertex.
//!
//! Wraps the user's [`VertexProgram`] and enforces the BSP visibility rule
//! with a double-buffered inbox: mail accumulates in the pending queue and
//! only becomes visible after the barrier that begins the next superstep
//! swaps the queues. The compute acknowledgement is withheld until every
//! message the vertex emitted has been acked end-to-end.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregator::{find_aggregator, is_system_aggregator};
use crate::command::{GetVertexValueAck, PartitionMessage, SuperStepMessage, VertexMessage};
use crate::error::EngineError;
use crate::plugin::{AnyValue, ComputeContext, Plugin, UserValue, VertexId, VertexProgram};
use crate::util::AckSet;

/// How the vertex materializes its program on startup.
pub enum VertexInit {
    /// Ask the plugin to build the program by id (per-vertex load).
    ById(VertexId),
    /// The program was already built by a bulk load.
    Loaded(Box<dyn VertexProgram>),
}

/// Spawn arguments for a vertex actor.
pub struct VertexArgs {
    /// The job's plugin.
    pub plugin: Arc<dyn Plugin>,
    /// Owning partition, target of all upward traffic.
    pub partition: ActorRef<PartitionMessage>,
    /// Program source.
    pub init: VertexInit,
}

/// Actor shell; all mutable state lives in [`VertexActorState`].
pub struct VertexActor;

/// Mutable state of a vertex actor.
pub struct VertexActorState {
    plugin: Arc<dyn Plugin>,
    partition: ActorRef<PartitionMessage>,
    program: Box<dyn VertexProgram>,
    halted: bool,
    /// Messages visible to the current superstep's compute.
    current: Vec<SuperStepMessage>,
    /// Mail for the next superstep, swapped in at the barrier.
    pending: Vec<SuperStepMessage>,
    /// Outstanding delivery acks for messages emitted this step.
    message_acks: AckSet<Uuid>,
    /// Compute finished, compute ack deferred until the acks drain.
    awaiting_message_acks: bool,
    /// Deltas published at the last computed step; re-contributed verbatim
    /// while the vertex is skipped as halted.
    last_deltas: HashMap<String, AnyValue>,
}

impl VertexActorState {
    fn send_compute_ack(&self) {
        let ack = PartitionMessage::ComputeAck {
            vertex_id: self.program.id().clone(),
            halted: self.halted,
            aggregated_values: self.last_deltas.clone(),
        };
        if self.partition.send_message(ack).is_err() {
            warn!(vertex = %self.program.id(), "partition gone, dropping compute ack");
        }
    }
}

/// Compute-time view handed to the user program.
struct VertexComputeContext<'a> {
    superstep: u64,
    received: Vec<UserValue>,
    plugin: &'a dyn Plugin,
    snapshot: &'a HashMap<String, AnyValue>,
    outgoing: Vec<(VertexId, AnyValue)>,
    voted_halt: bool,
    puts: Vec<(String, UserValue)>,
}

impl ComputeContext for VertexComputeContext<'_> {
    fn superstep(&self) -> u64 {
        self.superstep
    }

    fn received_messages(&self) -> &[UserValue] {
        &self.received
    }

    fn send_message_to(&mut self, dest: VertexId, message: UserValue) -> anyhow::Result<()> {
        let payload = self.plugin.marshal_message(&message)?;
        self.outgoing.push((dest, payload));
        Ok(())
    }

    fn vote_to_halt(&mut self) {
        self.voted_halt = true;
    }

    fn get_aggregated(&self, name: &str) -> anyhow::Result<Option<UserValue>> {
        let Some(value) = self.snapshot.get(name) else {
            return Ok(None);
        };
        let aggregator = find_aggregator(self.plugin, name)
            .ok_or_else(|| anyhow::anyhow!("unknown aggregator: {name}"))?;
        aggregator.unmarshal_value(value).map(Some)
    }

    fn put_aggregatable(&mut self, name: &str, value: UserValue) -> anyhow::Result<()> {
        if is_system_aggregator(name) {
            anyhow::bail!("{name} is reserved for the engine");
        }
        if find_aggregator(self.plugin, name).is_none() {
            anyhow::bail!("unknown aggregator: {name}");
        }
        self.puts.push((name.to_string(), value));
        Ok(())
    }
}

impl Actor for VertexActor {
    type Msg = VertexMessage;
    type State = VertexActorState;
    type Arguments = VertexArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let program = match args.init {
            VertexInit::ById(id) => args
                .plugin
                .new_vertex(&id)
                .map_err(|e| ActorProcessingErr::from(EngineError::plugin(e)))?,
            VertexInit::Loaded(program) => program,
        };
        debug!(vertex = %program.id(), "vertex ready");
        Ok(VertexActorState {
            plugin: args.plugin,
            partition: args.partition,
            program,
            halted: false,
            current: Vec::new(),
            pending: Vec::new(),
            message_acks: AckSet::new(),
            awaiting_message_acks: false,
            last_deltas: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            VertexMessage::SuperStepBarrier => {
                state.current = mem::take(&mut state.pending);
                if !state.current.is_empty() {
                    // incoming mail re-activates a halted vertex
                    state.halted = false;
                }
                let ack = PartitionMessage::SuperStepBarrierAck {
                    vertex_id: state.program.id().clone(),
                };
                let _ = state.partition.send_message(ack);
            }

            VertexMessage::Compute {
                superstep,
                aggregated_values,
            } => {
                if state.halted && state.current.is_empty() {
                    state.send_compute_ack();
                    return Ok(());
                }

                let plugin = state.plugin.clone();
                let envelopes = mem::take(&mut state.current);
                let mut received = Vec::with_capacity(envelopes.len());
                for envelope in &envelopes {
                    if let Some(payload) = &envelope.payload {
                        let value = plugin
                            .unmarshal_message(payload)
                            .map_err(EngineError::plugin)?;
                        received.push(value);
                    }
                }

                let mut ctx = VertexComputeContext {
                    superstep,
                    received,
                    plugin: plugin.as_ref(),
                    snapshot: aggregated_values.as_ref(),
                    outgoing: Vec::new(),
                    voted_halt: false,
                    puts: Vec::new(),
                };
                state
                    .program
                    .compute(&mut ctx)
                    .map_err(EngineError::plugin)?;

                state.halted = ctx.voted_halt;

                // fold same-name puts, then marshal for transport
                let mut deltas: HashMap<String, UserValue> = HashMap::new();
                for (name, value) in ctx.puts {
                    let aggregator = find_aggregator(plugin.as_ref(), &name)
                        .expect("put_aggregatable validated the name");
                    let folded = match deltas.remove(&name) {
                        Some(prev) => aggregator
                            .aggregate(prev, value)
                            .map_err(EngineError::plugin)?,
                        None => value,
                    };
                    deltas.insert(name, folded);
                }
                let mut marshaled = HashMap::new();
                for (name, value) in &deltas {
                    let aggregator = find_aggregator(plugin.as_ref(), name)
                        .expect("delta names were validated");
                    let pb = aggregator
                        .marshal_value(value)
                        .map_err(EngineError::plugin)?;
                    marshaled.insert(name.clone(), pb);
                }
                state.last_deltas = marshaled;

                for (dest, payload) in ctx.outgoing {
                    let envelope = SuperStepMessage {
                        uuid: Uuid::new_v4(),
                        superstep,
                        src_vertex_id: state.program.id().clone(),
                        dest_vertex_id: dest,
                        payload: Some(payload),
                    };
                    state.message_acks.add(envelope.uuid);
                    let _ = state
                        .partition
                        .send_message(PartitionMessage::SuperStepMessage(envelope));
                }

                if state.message_acks.complete() {
                    state.send_compute_ack();
                } else {
                    state.awaiting_message_acks = true;
                }
            }

            VertexMessage::Deliver(envelope) => {
                state.pending.push(envelope);
            }

            VertexMessage::SuperStepMessageAck { uuid } => {
                if !state.message_acks.ack(&uuid) {
                    warn!(vertex = %state.program.id(), %uuid, "ack for unknown message");
                    return Ok(());
                }
                if state.awaiting_message_acks && state.message_acks.complete() {
                    state.awaiting_message_acks = false;
                    state.send_compute_ack();
                }
            }

            VertexMessage::GetVertexValue(reply) => {
                let ack = GetVertexValueAck {
                    vertex_id: state.program.id().clone(),
                    value: Some(state.program.value_as_string()),
                };
                if reply.send(ack).is_err() {
                    warn!(vertex = %state.program.id(), "value query caller dropped");
                }
            }
        }
        Ok(())
    }
}
