//! The partition actor: owns the vertex actors of one partition id.
//!
//! Fans barriers and compute commands down to its vertices, folds their
//! acks and aggregator deltas back into a single partition-level ack, and
//! routes vertex messages: in-partition destinations are delivered straight
//! into the target's pending inbox (and acked on the spot), everything else
//! is forwarded to the worker with a per-uuid return path so the delivery
//! ack can find its way back to the emitting vertex.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::{merge_value_maps, VertexStats, VERTEX_STATS_NAME};
use crate::command::{
    GetVertexValueAck, LoadVertexAck, PartitionMessage, SuperStepMessage, VertexMessage,
    WorkerMessage,
};
use crate::engine::vertex::{VertexActor, VertexArgs, VertexInit};
use crate::error::EngineError;
use crate::plugin::{AnyValue, Plugin, VertexId};
use crate::util::AckSet;

/// Spawn arguments for a partition actor.
pub struct PartitionArgs {
    /// The job's plugin.
    pub plugin: Arc<dyn Plugin>,
    /// Owning worker, target of all upward traffic.
    pub worker: ActorRef<WorkerMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionPhase {
    Init,
    Idle,
    Barrier,
    Computing,
}

/// Actor shell; all mutable state lives in [`PartitionActorState`].
pub struct PartitionActor;

/// Mutable state of a partition actor.
pub struct PartitionActorState {
    plugin: Arc<dyn Plugin>,
    worker: ActorRef<WorkerMessage>,
    partition_id: u64,
    phase: PartitionPhase,
    vertices: HashMap<VertexId, ActorRef<VertexMessage>>,
    vertex_acks: AckSet<VertexId>,
    superstep: u64,
    active_vertices: u64,
    messages_sent: u64,
    aggregated: HashMap<String, AnyValue>,
    /// Forwarded envelopes awaiting a worker ack, keyed by uuid; the value
    /// is the emitting vertex that gets the ack relayed back.
    routes: HashMap<Uuid, ActorRef<VertexMessage>>,
    /// Per-destination buffer while a combiner is configured.
    combine_buffer: HashMap<VertexId, Vec<SuperStepMessage>>,
    /// Outstanding delivery acks for flushed combined envelopes.
    flush_acks: AckSet<Uuid>,
    /// Every vertex has acked its compute for the current step.
    vertices_done: bool,
}

impl PartitionActorState {
    /// Deliver locally or forward upward, completing or arranging the
    /// delivery ack either way.
    fn route_message(&mut self, envelope: SuperStepMessage) -> Result<(), ActorProcessingErr> {
        let src_local = self.vertices.contains_key(&envelope.src_vertex_id);
        let uuid = envelope.uuid;

        if let Some(dest) = self.vertices.get(&envelope.dest_vertex_id) {
            let src_id = envelope.src_vertex_id.clone();
            let _ = dest.send_message(VertexMessage::Deliver(envelope));
            // accepted into the pending inbox, ack right away
            if src_local {
                if let Some(src) = self.vertices.get(&src_id) {
                    let _ = src.send_message(VertexMessage::SuperStepMessageAck { uuid });
                }
            } else {
                let _ = self
                    .worker
                    .send_message(WorkerMessage::SuperStepMessageAck { uuid });
            }
            return Ok(());
        }

        if !src_local {
            // the worker routed a message here that we do not own; the
            // sender would wait forever for its ack
            return Err(EngineError::Protocol {
                message: format!(
                    "partition {} received message {} for unowned vertex {}",
                    self.partition_id, uuid, envelope.dest_vertex_id
                ),
            }
            .into());
        }

        let src = self
            .vertices
            .get(&envelope.src_vertex_id)
            .expect("source is local")
            .clone();
        self.routes.insert(uuid, src);
        let _ = self.worker.send_message(WorkerMessage::OutboundMessage {
            message: envelope,
            from_partition: self.partition_id,
        });
        Ok(())
    }

    /// All vertex compute acks are in: flush combined messages if a
    /// combiner is configured, then try to complete the stage.
    fn finish_vertices(&mut self) -> Result<(), ActorProcessingErr> {
        self.vertices_done = true;
        if self.plugin.combiner().is_some() {
            self.flush_combined()?;
        }
        self.maybe_finish_compute()
    }

    fn flush_combined(&mut self) -> Result<(), ActorProcessingErr> {
        let plugin = self.plugin.clone();
        let combiner = plugin.combiner().expect("combiner checked by caller");
        let buffer = mem::take(&mut self.combine_buffer);

        for (dest, envelopes) in buffer {
            let original_count = envelopes.len();
            let src = envelopes[0].src_vertex_id.clone();
            let mut values = Vec::with_capacity(original_count);
            for envelope in &envelopes {
                if let Some(payload) = &envelope.payload {
                    values.push(
                        plugin
                            .unmarshal_message(payload)
                            .map_err(EngineError::plugin)?,
                    );
                }
            }

            let combined = combiner
                .combine(&dest, values)
                .map_err(EngineError::plugin)?;
            if combined.is_empty() || combined.len() > original_count {
                return Err(EngineError::Plugin {
                    message: format!(
                        "combiner for {dest} returned {} messages from {original_count}",
                        combined.len()
                    ),
                }
                .into());
            }

            for value in combined {
                let payload = plugin.marshal_message(&value).map_err(EngineError::plugin)?;
                let envelope = SuperStepMessage {
                    uuid: Uuid::new_v4(),
                    superstep: self.superstep,
                    src_vertex_id: src.clone(),
                    dest_vertex_id: dest.clone(),
                    payload: Some(payload),
                };
                if let Some(local) = self.vertices.get(&dest) {
                    // originals were acked on acceptance, nothing to track
                    let _ = local.send_message(VertexMessage::Deliver(envelope));
                } else {
                    self.flush_acks.add(envelope.uuid);
                    let _ = self.worker.send_message(WorkerMessage::OutboundMessage {
                        message: envelope,
                        from_partition: self.partition_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Complete the compute stage once vertex acks and flush acks are in.
    fn maybe_finish_compute(&mut self) -> Result<(), ActorProcessingErr> {
        if self.phase != PartitionPhase::Computing
            || !self.vertices_done
            || !self.flush_acks.complete()
        {
            return Ok(());
        }

        let stats = VertexStats {
            active_vertices: self.active_vertices,
            messages_sent: self.messages_sent,
        };
        let mut stats_map = HashMap::new();
        stats_map.insert(VERTEX_STATS_NAME.to_string(), stats.to_any());
        merge_value_maps(self.plugin.as_ref(), &mut self.aggregated, &stats_map)?;

        debug!(
            partition = self.partition_id,
            superstep = self.superstep,
            active = stats.active_vertices,
            messages = stats.messages_sent,
            "partition compute complete"
        );
        let _ = self.worker.send_message(WorkerMessage::ComputePartitionAck {
            partition_id: self.partition_id,
            aggregated_values: mem::take(&mut self.aggregated),
        });
        self.phase = PartitionPhase::Idle;
        self.vertices_done = false;
        Ok(())
    }
}

impl Actor for PartitionActor {
    type Msg = PartitionMessage;
    type State = PartitionActorState;
    type Arguments = PartitionArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(PartitionActorState {
            plugin: args.plugin,
            worker: args.worker,
            partition_id: 0,
            phase: PartitionPhase::Init,
            vertices: HashMap::new(),
            vertex_acks: AckSet::new(),
            superstep: 0,
            active_vertices: 0,
            messages_sent: 0,
            aggregated: HashMap::new(),
            routes: HashMap::new(),
            combine_buffer: HashMap::new(),
            flush_acks: AckSet::new(),
            vertices_done: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PartitionMessage::InitPartition { partition_id } => {
                state.partition_id = partition_id;
                state.phase = PartitionPhase::Idle;
                let _ = state
                    .worker
                    .send_message(WorkerMessage::InitPartitionAck { partition_id });
            }

            PartitionMessage::LoadVertex { vertex_id, reply } => {
                let args = VertexArgs {
                    plugin: state.plugin.clone(),
                    partition: myself.clone(),
                    init: VertexInit::ById(vertex_id.clone()),
                };
                let ack = match Actor::spawn_linked(None, VertexActor, args, myself.get_cell())
                    .await
                {
                    Ok((vertex, _)) => {
                        state.vertices.insert(vertex_id.clone(), vertex);
                        LoadVertexAck {
                            vertex_id,
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(vertex = %vertex_id, error = %e, "vertex load failed");
                        LoadVertexAck {
                            vertex_id,
                            error: Some(e.to_string()),
                        }
                    }
                };
                if reply.send(ack).is_err() {
                    warn!("load vertex caller dropped");
                }
            }

            PartitionMessage::LoadPartitionVertices { num_of_partitions } => {
                let mut programs = Vec::new();
                state
                    .plugin
                    .new_partition_vertices(state.partition_id, num_of_partitions, &mut |p| {
                        programs.push(p)
                    })
                    .map_err(EngineError::plugin)?;

                let loaded = programs.len();
                for program in programs {
                    let vertex_id = program.id().clone();
                    let args = VertexArgs {
                        plugin: state.plugin.clone(),
                        partition: myself.clone(),
                        init: VertexInit::Loaded(program),
                    };
                    let (vertex, _) =
                        Actor::spawn_linked(None, VertexActor, args, myself.get_cell()).await?;
                    state.vertices.insert(vertex_id, vertex);
                }

                info!(
                    partition = state.partition_id,
                    vertices = loaded,
                    "partition vertices loaded"
                );
                let _ = state
                    .worker
                    .send_message(WorkerMessage::LoadPartitionVerticesPartitionAck {
                        partition_id: state.partition_id,
                    });
            }

            PartitionMessage::SuperStepBarrier => {
                state.phase = PartitionPhase::Barrier;
                state.vertex_acks.clear();
                for (vertex_id, vertex) in &state.vertices {
                    state.vertex_acks.add(vertex_id.clone());
                    let _ = vertex.send_message(VertexMessage::SuperStepBarrier);
                }
                if state.vertex_acks.complete() {
                    // partition owns no vertices
                    let _ = state
                        .worker
                        .send_message(WorkerMessage::SuperStepBarrierPartitionAck {
                            partition_id: state.partition_id,
                        });
                    state.phase = PartitionPhase::Idle;
                }
            }

            PartitionMessage::SuperStepBarrierAck { vertex_id } => {
                if state.phase != PartitionPhase::Barrier {
                    warn!(vertex = %vertex_id, "barrier ack outside barrier stage");
                    return Ok(());
                }
                if !state.vertex_acks.ack(&vertex_id) {
                    warn!(vertex = %vertex_id, "barrier ack from unknown vertex");
                    return Ok(());
                }
                if state.vertex_acks.complete() {
                    let _ = state
                        .worker
                        .send_message(WorkerMessage::SuperStepBarrierPartitionAck {
                            partition_id: state.partition_id,
                        });
                    state.phase = PartitionPhase::Idle;
                }
            }

            PartitionMessage::Compute {
                superstep,
                aggregated_values,
            } => {
                state.phase = PartitionPhase::Computing;
                state.superstep = superstep;
                state.active_vertices = 0;
                state.messages_sent = 0;
                state.aggregated.clear();
                state.combine_buffer.clear();
                state.flush_acks.clear();
                state.vertices_done = false;
                state.vertex_acks.clear();

                for (vertex_id, vertex) in &state.vertices {
                    state.vertex_acks.add(vertex_id.clone());
                    let _ = vertex.send_message(VertexMessage::Compute {
                        superstep,
                        aggregated_values: Arc::clone(&aggregated_values),
                    });
                }
                if state.vertex_acks.complete() {
                    state.finish_vertices()?;
                }
            }

            PartitionMessage::ComputeAck {
                vertex_id,
                halted,
                aggregated_values,
            } => {
                if state.phase != PartitionPhase::Computing {
                    warn!(vertex = %vertex_id, "compute ack outside compute stage");
                    return Ok(());
                }
                if !state.vertex_acks.ack(&vertex_id) {
                    warn!(vertex = %vertex_id, "compute ack from unknown vertex");
                    return Ok(());
                }
                merge_value_maps(state.plugin.as_ref(), &mut state.aggregated, &aggregated_values)?;
                if !halted {
                    state.active_vertices += 1;
                }
                if state.vertex_acks.complete() {
                    state.finish_vertices()?;
                }
            }

            PartitionMessage::SuperStepMessage(envelope) => {
                let src_local = state.vertices.contains_key(&envelope.src_vertex_id);
                if src_local {
                    state.messages_sent += 1;
                    if state.plugin.combiner().is_some() {
                        // accept into the buffer and ack the emitter now;
                        // the fold happens when all compute acks are in
                        if let Some(src) = state.vertices.get(&envelope.src_vertex_id) {
                            let _ = src.send_message(VertexMessage::SuperStepMessageAck {
                                uuid: envelope.uuid,
                            });
                        }
                        state
                            .combine_buffer
                            .entry(envelope.dest_vertex_id.clone())
                            .or_default()
                            .push(envelope);
                        return Ok(());
                    }
                }
                state.route_message(envelope)?;
            }

            PartitionMessage::SuperStepMessageAck { uuid } => {
                if let Some(src) = state.routes.remove(&uuid) {
                    let _ = src.send_message(VertexMessage::SuperStepMessageAck { uuid });
                } else if state.flush_acks.ack(&uuid) {
                    state.maybe_finish_compute()?;
                } else {
                    warn!(%uuid, "delivery ack for unknown message");
                }
            }

            PartitionMessage::GetVertexValue { vertex_id, reply } => {
                match state.vertices.get(&vertex_id) {
                    Some(vertex) => {
                        let _ = vertex.send_message(VertexMessage::GetVertexValue(reply));
                    }
                    None => {
                        let ack = GetVertexValueAck {
                            vertex_id,
                            value: None,
                        };
                        let _ = reply.send(ack);
                    }
                }
            }

            PartitionMessage::Shutdown => {
                info!(partition = state.partition_id, "partition shutting down");
                for vertex in state.vertices.values() {
                    vertex.stop(None);
                }
                myself.stop(None);
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorFailed(actor_cell, err) => {
                error!(
                    partition = state.partition_id,
                    actor = ?actor_cell.get_id(),
                    error = %err,
                    "vertex failed"
                );
                // no per-vertex recovery in this design; escalate
                Err(EngineError::Plugin {
                    message: format!("vertex failed: {err}"),
                }
                .into())
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                debug!(actor = ?actor_cell.get_id(), ?reason, "vertex terminated");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
