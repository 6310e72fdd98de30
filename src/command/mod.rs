//! Command envelopes exchanged between the coordinator, workers, partitions,
//! and vertices.
//!
//! Each actor level has one message enum; the shared payload structs below
//! carry the data that climbs or descends the hierarchy. Request/response
//! commands carry an `RpcReplyPort`; stage acknowledgements are plain casts
//! that identify their sender explicitly (worker actor id, partition id, or
//! vertex id) so the receiving ack set can strike them off.

use std::collections::HashMap;
use std::sync::Arc;

use ractor::{ActorId, ActorRef, RpcReplyPort};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::plugin::{AnyValue, VertexId};

// ============================================================================
// Shared payloads
// ============================================================================

/// One worker requested in a `NewCluster` command.
#[derive(Debug, Clone)]
pub struct WorkerReq {
    /// Registry name of the worker actor. Required for remote workers;
    /// ignored for local ones.
    pub name: Option<String>,
    /// Attach to an already-registered worker instead of spawning one.
    pub remote: bool,
}

impl WorkerReq {
    /// A worker spawned in-process by the coordinator.
    pub fn local() -> Self {
        Self {
            name: None,
            remote: false,
        }
    }

    /// A worker running elsewhere, found under `name` in the process
    /// registry.
    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            remote: true,
        }
    }
}

/// A worker's entry in the cluster map.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Handle of the worker actor.
    pub worker: ActorRef<WorkerMessage>,
    /// Partition ids owned by this worker.
    pub partitions: Vec<u64>,
}

/// The cluster map: every worker and its partition assignment.
///
/// Invariant: every partition id in `[0, num_of_partitions)` appears in
/// exactly one worker.
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    /// Workers in assignment order.
    pub workers: Vec<WorkerInfo>,
}

impl ClusterInfo {
    /// Total number of partitions across all workers.
    pub fn num_of_partitions(&self) -> u64 {
        self.workers.iter().map(|w| w.partitions.len() as u64).sum()
    }

    /// The worker owning `partition`, if any.
    pub fn find_worker_by_partition(&self, partition: u64) -> Option<&WorkerInfo> {
        self.workers
            .iter()
            .find(|w| w.partitions.contains(&partition))
    }
}

/// A vertex-to-vertex message in flight between two supersteps.
///
/// The uuid correlates the end-to-end delivery acknowledgement: every hop
/// remembers where the envelope came from, and the ack retraces the path
/// once the terminal partition has accepted the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperStepMessage {
    /// Delivery correlation id.
    pub uuid: Uuid,
    /// Superstep during which the message was sent.
    pub superstep: u64,
    /// Sending vertex.
    pub src_vertex_id: VertexId,
    /// Receiving vertex.
    pub dest_vertex_id: VertexId,
    /// Marshaled user payload.
    pub payload: Option<AnyValue>,
}

/// Reply to a single-vertex load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadVertexAck {
    /// The vertex that was (or failed to be) loaded.
    pub vertex_id: VertexId,
    /// Failure description, if loading failed.
    pub error: Option<String>,
}

/// Reply to a vertex value query. `value` is `None` when the vertex is
/// unknown to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetVertexValueAck {
    /// The queried vertex.
    pub vertex_id: VertexId,
    /// Rendered vertex value, if the vertex exists.
    pub value: Option<String>,
}

/// Reply to a coordinator stats query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatsAck {
    /// Human-readable name of the coordinator state.
    pub state: String,
    /// Superstep of the last published aggregation snapshot.
    pub superstep: u64,
    /// Vertices that did not vote to halt during that step.
    pub active_vertices: u64,
    /// Messages emitted during that step.
    pub messages_sent: u64,
    /// Diagnostic of the failure, when the job is in the failed state.
    pub last_error: Option<String>,
}

/// Reply to an aggregated-values query: user aggregators rendered as
/// strings, system aggregators filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShowAggregatedValueAck {
    /// Aggregator name to rendered value.
    pub aggregated_values: HashMap<String, String>,
}

// ============================================================================
// Actor messages
// ============================================================================

/// Messages handled by the coordinator actor.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Build the cluster: assign partitions, spawn or attach workers.
    NewCluster {
        /// Requested workers.
        workers: Vec<WorkerReq>,
        /// Total partitions to distribute.
        num_of_partitions: u64,
        /// Answered once every worker has initialized, or on rejection.
        reply: RpcReplyPort<Result<(), EngineError>>,
    },
    /// Load every partition's vertices through the plugin's bulk loader.
    LoadPartitionVertices {
        /// Answered once every partition has finished loading.
        reply: RpcReplyPort<Result<(), EngineError>>,
    },
    /// Load one vertex by id (diagnostic path).
    LoadVertex {
        /// Vertex to load.
        vertex_id: VertexId,
        /// Answered by the owning partition.
        reply: RpcReplyPort<LoadVertexAck>,
    },
    /// Start the superstep loop; runs until the termination predicate holds.
    StartSuperStep,
    /// Read-only state query, served from any state.
    CoordinatorStats(RpcReplyPort<CoordinatorStatsAck>),
    /// Read-only aggregated-values query, served from any state.
    ShowAggregatedValue(RpcReplyPort<ShowAggregatedValueAck>),
    /// Read-only vertex value query, forwarded to the owning worker.
    GetVertexValue {
        /// Vertex to query.
        vertex_id: VertexId,
        /// Answered by the vertex, or with `value: None` if unknown.
        reply: RpcReplyPort<GetVertexValueAck>,
    },
    /// Tear the whole cluster down.
    Shutdown(RpcReplyPort<()>),

    /// Worker finished initializing its partitions.
    InitWorkerAck {
        /// Acking worker.
        worker: ActorId,
    },
    /// Worker finished bulk-loading all its partitions.
    LoadPartitionVerticesWorkerAck {
        /// Acking worker.
        worker: ActorId,
    },
    /// Worker passed the superstep barrier.
    SuperStepBarrierWorkerAck {
        /// Acking worker.
        worker: ActorId,
    },
    /// Worker finished computing; carries its merged aggregator map.
    ComputeWorkerAck {
        /// Acking worker.
        worker: ActorId,
        /// Aggregator values merged across the worker's partitions.
        aggregated_values: HashMap<String, AnyValue>,
    },

    /// Step watchdog fired; ignored unless the epoch still matches.
    StepTimeout {
        /// Epoch the watchdog was armed in.
        epoch: u64,
    },
}


/// Messages handled by a worker actor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Assign partitions and introduce the coordinator.
    InitWorker {
        /// Coordinator to ack back to.
        coordinator: ActorRef<CoordinatorMessage>,
        /// Partition ids this worker owns.
        partitions: Vec<u64>,
    },
    /// The cluster map, broadcast by the coordinator after assignment.
    ClusterInfo(ClusterInfo),
    /// Load one vertex owned by this worker.
    LoadVertex {
        /// Vertex to load.
        vertex_id: VertexId,
        /// Forwarded to the owning partition.
        reply: RpcReplyPort<LoadVertexAck>,
    },
    /// Bulk-load every partition of this worker.
    LoadPartitionVertices {
        /// Cluster-wide partition count, needed by the plugin loader.
        num_of_partitions: u64,
    },
    /// Superstep barrier fan-out.
    SuperStepBarrier,
    /// Compute fan-out for one superstep.
    Compute {
        /// Superstep index.
        superstep: u64,
        /// Fully-reduced aggregator values of the previous step.
        aggregated_values: Arc<HashMap<String, AnyValue>>,
    },
    /// Read-only vertex value query.
    GetVertexValue {
        /// Vertex to query.
        vertex_id: VertexId,
        /// Forwarded to the owning partition.
        reply: RpcReplyPort<GetVertexValueAck>,
    },
    /// Stop this worker and everything below it.
    Shutdown,

    /// Partition finished initializing.
    InitPartitionAck {
        /// Acking partition.
        partition_id: u64,
    },
    /// Partition finished bulk-loading its vertices.
    LoadPartitionVerticesPartitionAck {
        /// Acking partition.
        partition_id: u64,
    },
    /// Partition passed the superstep barrier.
    SuperStepBarrierPartitionAck {
        /// Acking partition.
        partition_id: u64,
    },
    /// Partition finished computing; carries its reduced aggregator map.
    ComputePartitionAck {
        /// Acking partition.
        partition_id: u64,
        /// Reduced aggregator values including the partition's vertex stats.
        aggregated_values: HashMap<String, AnyValue>,
    },

    /// A message from one of this worker's partitions that needs routing.
    OutboundMessage {
        /// The envelope.
        message: SuperStepMessage,
        /// Partition the envelope came from; its vertex gets the final ack.
        from_partition: u64,
    },
    /// A message arriving from a peer worker for a local partition.
    InboundMessage {
        /// The envelope.
        message: SuperStepMessage,
        /// Peer worker expecting the delivery ack.
        reply_to: ActorRef<WorkerMessage>,
    },
    /// Delivery acknowledgement travelling back along the forwarding path.
    SuperStepMessageAck {
        /// Correlation id of the acknowledged envelope.
        uuid: Uuid,
    },
}


/// Messages handled by a partition actor.
#[derive(Debug)]
pub enum PartitionMessage {
    /// Assign the partition id.
    InitPartition {
        /// This partition's id.
        partition_id: u64,
    },
    /// Load one vertex into this partition.
    LoadVertex {
        /// Vertex to load.
        vertex_id: VertexId,
        /// Answered once the vertex actor is running.
        reply: RpcReplyPort<LoadVertexAck>,
    },
    /// Bulk-load this partition's vertices through the plugin.
    LoadPartitionVertices {
        /// Cluster-wide partition count.
        num_of_partitions: u64,
    },
    /// Superstep barrier fan-out.
    SuperStepBarrier,
    /// Compute fan-out for one superstep.
    Compute {
        /// Superstep index.
        superstep: u64,
        /// Fully-reduced aggregator values of the previous step.
        aggregated_values: Arc<HashMap<String, AnyValue>>,
    },
    /// Read-only vertex value query.
    GetVertexValue {
        /// Vertex to query.
        vertex_id: VertexId,
        /// Forwarded to the vertex, or answered empty if unknown.
        reply: RpcReplyPort<GetVertexValueAck>,
    },
    /// Stop this partition and its vertices.
    Shutdown,

    /// Vertex passed the superstep barrier.
    SuperStepBarrierAck {
        /// Acking vertex.
        vertex_id: VertexId,
    },
    /// Vertex finished computing (all of its messages delivered).
    ComputeAck {
        /// Acking vertex.
        vertex_id: VertexId,
        /// Whether the vertex is halted after this step.
        halted: bool,
        /// The vertex's marshaled aggregator deltas for this step.
        aggregated_values: HashMap<String, AnyValue>,
    },

    /// A vertex message to route: emitted by a local vertex, or delivered
    /// down from the worker for a local destination.
    SuperStepMessage(SuperStepMessage),
    /// Delivery acknowledgement returning from the worker.
    SuperStepMessageAck {
        /// Correlation id of the acknowledged envelope.
        uuid: Uuid,
    },
}


/// Messages handled by a vertex actor.
#[derive(Debug)]
pub enum VertexMessage {
    /// Swap inboxes and report readiness for the next superstep.
    SuperStepBarrier,
    /// Run one superstep of the user program.
    Compute {
        /// Superstep index.
        superstep: u64,
        /// Fully-reduced aggregator values of the previous step.
        aggregated_values: Arc<HashMap<String, AnyValue>>,
    },
    /// Mail for the next superstep; queued into the pending inbox.
    Deliver(SuperStepMessage),
    /// One of this vertex's outgoing messages was fully delivered.
    SuperStepMessageAck {
        /// Correlation id of the acknowledged envelope.
        uuid: Uuid,
    },
    /// Read-only vertex value query.
    GetVertexValue(RpcReplyPort<GetVertexValueAck>),
}

