//! The worker actor: unit of process placement, owning one or more
//! partitions.
//!
//! Mirrors the coordinator one level down: fans barrier / compute / load
//! commands out to its partitions, folds their acks into a single
//! worker-level ack, and routes vertex messages between partitions and peer
//! workers using the cluster map and the plugin's partitioner.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::merge_value_maps;
use crate::command::{
    ClusterInfo, CoordinatorMessage, GetVertexValueAck, LoadVertexAck, PartitionMessage,
    WorkerMessage,
};
use crate::config::ClusterConfig;
use crate::engine::partition::{PartitionActor, PartitionArgs};
use crate::error::EngineError;
use crate::plugin::{AnyValue, Plugin, VertexId};
use crate::util::AckSet;

/// Spawn arguments for a worker actor.
pub struct WorkerArgs {
    /// The job's plugin.
    pub plugin: Arc<dyn Plugin>,
    /// Cluster tunables, passed through to children.
    pub config: ClusterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Init,
    Idle,
    Loading,
    AwaitingBarrier,
    Computing,
}

/// Where the delivery ack for a forwarded envelope must be sent back to.
enum AckReturn {
    /// A local partition emitted the envelope.
    Partition(ActorRef<PartitionMessage>),
    /// A peer worker forwarded the envelope to us.
    Peer(ActorRef<WorkerMessage>),
}

/// Actor shell; all mutable state lives in [`WorkerActorState`].
pub struct WorkerActor;

/// Mutable state of a worker actor.
pub struct WorkerActorState {
    plugin: Arc<dyn Plugin>,
    #[allow(dead_code)]
    config: ClusterConfig,
    coordinator: Option<ActorRef<CoordinatorMessage>>,
    /// Owned partitions in assignment order.
    partitions: Vec<(u64, ActorRef<PartitionMessage>)>,
    cluster: Option<ClusterInfo>,
    phase: WorkerPhase,
    partition_acks: AckSet<u64>,
    aggregated: HashMap<String, AnyValue>,
    /// Per-uuid return paths for envelopes this worker forwarded.
    routes: HashMap<Uuid, AckReturn>,
}

impl WorkerActorState {
    fn coordinator(&self) -> Result<&ActorRef<CoordinatorMessage>, ActorProcessingErr> {
        self.coordinator.as_ref().ok_or_else(|| {
            EngineError::Protocol {
                message: "worker has no coordinator yet".to_string(),
            }
            .into()
        })
    }

    fn local_partition(&self, partition_id: u64) -> Option<&ActorRef<PartitionMessage>> {
        self.partitions
            .iter()
            .find(|(id, _)| *id == partition_id)
            .map(|(_, p)| p)
    }

    /// Map a vertex to its partition id using the cluster-wide count.
    fn partition_of(&self, vertex_id: &VertexId) -> Result<u64, ActorProcessingErr> {
        let cluster = self.cluster.as_ref().ok_or_else(|| {
            ActorProcessingErr::from(EngineError::Protocol {
                message: "worker has no cluster info yet".to_string(),
            })
        })?;
        self.plugin
            .partition(vertex_id, cluster.num_of_partitions())
            .map_err(|e| EngineError::plugin(e).into())
    }
}

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(WorkerActorState {
            plugin: args.plugin,
            config: args.config,
            coordinator: None,
            partitions: Vec::new(),
            cluster: None,
            phase: WorkerPhase::Init,
            partition_acks: AckSet::new(),
            aggregated: HashMap::new(),
            routes: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::InitWorker {
                coordinator,
                partitions,
            } => {
                state.coordinator = Some(coordinator);
                for partition_id in partitions {
                    let args = PartitionArgs {
                        plugin: state.plugin.clone(),
                        worker: myself.clone(),
                    };
                    let (partition, _) =
                        Actor::spawn_linked(None, PartitionActor, args, myself.get_cell()).await?;
                    let _ =
                        partition.send_message(PartitionMessage::InitPartition { partition_id });
                    state.partition_acks.add(partition_id);
                    state.partitions.push((partition_id, partition));
                }
                debug!(partitions = state.partitions.len(), "worker initializing");
            }

            WorkerMessage::InitPartitionAck { partition_id } => {
                if !state.partition_acks.ack(&partition_id) {
                    warn!(partition = partition_id, "init ack from unknown partition");
                    return Ok(());
                }
                if state.partition_acks.complete() {
                    let ack = CoordinatorMessage::InitWorkerAck {
                        worker: myself.get_id(),
                    };
                    let _ = state.coordinator()?.send_message(ack);
                    state.phase = WorkerPhase::Idle;
                    info!("worker ready");
                }
            }

            WorkerMessage::ClusterInfo(cluster) => {
                state.cluster = Some(cluster);
            }

            WorkerMessage::LoadVertex { vertex_id, reply } => {
                let partition_id = state.partition_of(&vertex_id)?;
                match state.local_partition(partition_id) {
                    Some(partition) => {
                        let _ = partition
                            .send_message(PartitionMessage::LoadVertex { vertex_id, reply });
                    }
                    None => {
                        warn!(vertex = %vertex_id, partition = partition_id, "load for partition this worker does not own");
                        let _ = reply.send(LoadVertexAck {
                            vertex_id,
                            error: Some(format!("partition {partition_id} not on this worker")),
                        });
                    }
                }
            }

            WorkerMessage::LoadPartitionVertices { num_of_partitions } => {
                state.phase = WorkerPhase::Loading;
                state.partition_acks.clear();
                for (partition_id, partition) in &state.partitions {
                    state.partition_acks.add(*partition_id);
                    let _ = partition
                        .send_message(PartitionMessage::LoadPartitionVertices { num_of_partitions });
                }
            }

            WorkerMessage::LoadPartitionVerticesPartitionAck { partition_id } => {
                if state.phase != WorkerPhase::Loading {
                    warn!(partition = partition_id, "load ack outside loading stage");
                    return Ok(());
                }
                if !state.partition_acks.ack(&partition_id) {
                    warn!(partition = partition_id, "load ack from unknown partition");
                    return Ok(());
                }
                if state.partition_acks.complete() {
                    let ack = CoordinatorMessage::LoadPartitionVerticesWorkerAck {
                        worker: myself.get_id(),
                    };
                    let _ = state.coordinator()?.send_message(ack);
                    state.phase = WorkerPhase::Idle;
                }
            }

            WorkerMessage::SuperStepBarrier => {
                state.phase = WorkerPhase::AwaitingBarrier;
                state.partition_acks.clear();
                for (partition_id, partition) in &state.partitions {
                    state.partition_acks.add(*partition_id);
                    let _ = partition.send_message(PartitionMessage::SuperStepBarrier);
                }
            }

            WorkerMessage::SuperStepBarrierPartitionAck { partition_id } => {
                if state.phase != WorkerPhase::AwaitingBarrier {
                    warn!(partition = partition_id, "barrier ack outside barrier stage");
                    return Ok(());
                }
                if !state.partition_acks.ack(&partition_id) {
                    warn!(partition = partition_id, "barrier ack from unknown partition");
                    return Ok(());
                }
                if state.partition_acks.complete() {
                    let ack = CoordinatorMessage::SuperStepBarrierWorkerAck {
                        worker: myself.get_id(),
                    };
                    let _ = state.coordinator()?.send_message(ack);
                    state.phase = WorkerPhase::Idle;
                }
            }

            WorkerMessage::Compute {
                superstep,
                aggregated_values,
            } => {
                state.phase = WorkerPhase::Computing;
                state.partition_acks.clear();
                state.aggregated.clear();
                for (partition_id, partition) in &state.partitions {
                    state.partition_acks.add(*partition_id);
                    let _ = partition.send_message(PartitionMessage::Compute {
                        superstep,
                        aggregated_values: Arc::clone(&aggregated_values),
                    });
                }
            }

            WorkerMessage::ComputePartitionAck {
                partition_id,
                aggregated_values,
            } => {
                if state.phase != WorkerPhase::Computing {
                    warn!(partition = partition_id, "compute ack outside compute stage");
                    return Ok(());
                }
                if !state.partition_acks.ack(&partition_id) {
                    warn!(partition = partition_id, "compute ack from unknown partition");
                    return Ok(());
                }
                merge_value_maps(state.plugin.as_ref(), &mut state.aggregated, &aggregated_values)?;
                if state.partition_acks.complete() {
                    let ack = CoordinatorMessage::ComputeWorkerAck {
                        worker: myself.get_id(),
                        aggregated_values: mem::take(&mut state.aggregated),
                    };
                    let _ = state.coordinator()?.send_message(ack);
                    state.phase = WorkerPhase::Idle;
                }
            }

            WorkerMessage::OutboundMessage {
                message,
                from_partition,
            } => {
                let dest_partition = state.partition_of(&message.dest_vertex_id)?;
                if dest_partition == from_partition {
                    // the source partition owns the destination id yet did
                    // not find the vertex; routing it back would loop
                    return Err(EngineError::Protocol {
                        message: format!(
                            "vertex {} does not exist in its partition {dest_partition}",
                            message.dest_vertex_id
                        ),
                    }
                    .into());
                }
                let source = state.local_partition(from_partition).cloned().ok_or_else(|| {
                    ActorProcessingErr::from(EngineError::Protocol {
                        message: format!("outbound message from unknown partition {from_partition}"),
                    })
                })?;
                state
                    .routes
                    .insert(message.uuid, AckReturn::Partition(source));

                if let Some(local) = state.local_partition(dest_partition) {
                    let _ = local.send_message(PartitionMessage::SuperStepMessage(message));
                } else {
                    let cluster = state.cluster.as_ref().ok_or_else(|| {
                        ActorProcessingErr::from(EngineError::Protocol {
                            message: "routing without cluster info".to_string(),
                        })
                    })?;
                    let peer = cluster.find_worker_by_partition(dest_partition).ok_or_else(
                        || {
                            ActorProcessingErr::from(EngineError::Protocol {
                                message: format!("no worker owns partition {dest_partition}"),
                            })
                        },
                    )?;
                    let _ = peer.worker.send_message(WorkerMessage::InboundMessage {
                        message,
                        reply_to: myself.clone(),
                    });
                }
            }

            WorkerMessage::InboundMessage { message, reply_to } => {
                let dest_partition = state.partition_of(&message.dest_vertex_id)?;
                let local = state.local_partition(dest_partition).cloned().ok_or_else(|| {
                    ActorProcessingErr::from(EngineError::Protocol {
                        message: format!(
                            "peer routed message for partition {dest_partition} this worker does not own"
                        ),
                    })
                })?;
                state.routes.insert(message.uuid, AckReturn::Peer(reply_to));
                let _ = local.send_message(PartitionMessage::SuperStepMessage(message));
            }

            WorkerMessage::SuperStepMessageAck { uuid } => match state.routes.remove(&uuid) {
                Some(AckReturn::Partition(partition)) => {
                    let _ = partition.send_message(PartitionMessage::SuperStepMessageAck { uuid });
                }
                Some(AckReturn::Peer(peer)) => {
                    let _ = peer.send_message(WorkerMessage::SuperStepMessageAck { uuid });
                }
                None => warn!(%uuid, "delivery ack with no return path"),
            },

            WorkerMessage::GetVertexValue { vertex_id, reply } => {
                let partition_id = state.partition_of(&vertex_id)?;
                match state.local_partition(partition_id) {
                    Some(partition) => {
                        let _ = partition
                            .send_message(PartitionMessage::GetVertexValue { vertex_id, reply });
                    }
                    None => {
                        let _ = reply.send(GetVertexValueAck {
                            vertex_id,
                            value: None,
                        });
                    }
                }
            }

            WorkerMessage::Shutdown => {
                info!("worker shutting down");
                for (_, partition) in &state.partitions {
                    let _ = partition.send_message(PartitionMessage::Shutdown);
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
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match event {
            SupervisionEvent::ActorFailed(actor_cell, err) => {
                error!(actor = ?actor_cell.get_id(), error = %err, "partition failed");
                // no recovery mid-job; escalate to the coordinator
                Err(EngineError::Plugin {
                    message: format!("partition failed: {err}"),
                }
                .into())
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                debug!(actor = ?actor_cell.get_id(), ?reason, "partition terminated");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
