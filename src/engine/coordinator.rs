//! The coordinator actor: singleton driver of the job-global state machine.
//!
//! Holds the cluster map, walks `Init → Idle → (LoadingVertices |
//! AwaitingBarrier → Computing)` through cascading worker acknowledgements,
//! reduces aggregator values at the top of the hierarchy, and decides
//! termination from the vertex statistics of each completed superstep.
//! Read-only queries are served from any state; a fatal child error or a
//! stage watchdog moves the job to the terminal failed state, which keeps
//! answering queries with the retained diagnostic.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use tracing::{debug, error, info, warn};

use crate::aggregator::{
    find_aggregator, get_stats, is_system_aggregator, merge_value_maps, AggregatedSnapshot,
};
use crate::command::{
    ClusterInfo, CoordinatorMessage, CoordinatorStatsAck, GetVertexValueAck, LoadVertexAck,
    ShowAggregatedValueAck, WorkerInfo, WorkerMessage, WorkerReq,
};
use crate::config::ClusterConfig;
use crate::engine::worker::{WorkerActor, WorkerArgs};
use crate::error::EngineError;
use crate::plugin::{AnyValue, Plugin, VertexId};
use crate::util::AckSet;

/// Coordinator states, mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorPhase {
    Init,
    Idle,
    LoadingVertices,
    AwaitingBarrier,
    Computing,
    Failed,
}

impl CoordinatorPhase {
    fn state_name(self) -> &'static str {
        match self {
            CoordinatorPhase::Init => "initializing cluster",
            CoordinatorPhase::Idle => "idle",
            CoordinatorPhase::LoadingVertices => "loading vertices of each partition",
            CoordinatorPhase::AwaitingBarrier => "processing superstep",
            CoordinatorPhase::Computing => "processing superstep - computing",
            CoordinatorPhase::Failed => "failed",
        }
    }
}

/// Spawn arguments for the coordinator actor.
pub struct CoordinatorArgs {
    /// The job's plugin.
    pub plugin: Arc<dyn Plugin>,
    /// Cluster tunables.
    pub config: ClusterConfig,
    /// Invoked once after the shutdown broadcast.
    pub shutdown_hook: Option<Box<dyn FnOnce() + Send + Sync>>,
}

/// Actor shell; all mutable state lives in [`CoordinatorActorState`].
pub struct CoordinatorActor;

/// Mutable state of the coordinator actor.
pub struct CoordinatorActorState {
    plugin: Arc<dyn Plugin>,
    config: ClusterConfig,
    phase: CoordinatorPhase,
    cluster: Option<ClusterInfo>,
    worker_acks: AckSet<ActorId>,
    aggregated_current_step: HashMap<String, AnyValue>,
    last_snapshot: Option<AggregatedSnapshot>,
    current_step: u64,
    /// Bumped on every stage transition; invalidates stale watchdogs.
    epoch: u64,
    new_cluster_reply: Option<RpcReplyPort<Result<(), EngineError>>>,
    load_reply: Option<RpcReplyPort<Result<(), EngineError>>>,
    shutdown_hook: Option<Box<dyn FnOnce() + Send + Sync>>,
    last_error: Option<String>,
}

impl CoordinatorActorState {
    /// Move to the terminal failed state, keeping the diagnostic and
    /// answering any held driver reply.
    fn fail(&mut self, err: EngineError) {
        let message = err.to_string();
        error!(error = %message, "job failed");
        self.last_error = Some(message);
        self.phase = CoordinatorPhase::Failed;
        self.epoch += 1;

        let mut err = Some(err);
        if let Some(reply) = self.new_cluster_reply.take() {
            if let Some(e) = err.take() {
                let _ = reply.send(Err(e));
            }
        }
        if let Some(reply) = self.load_reply.take() {
            match err.take() {
                Some(e) => {
                    let _ = reply.send(Err(e));
                }
                None => {
                    let _ = reply.send(Err(EngineError::Protocol {
                        message: self.last_error.clone().unwrap_or_default(),
                    }));
                }
            }
        }
    }

    /// The worker owning `vertex_id` per the plugin's partitioner.
    fn worker_for_vertex(&self, vertex_id: &VertexId) -> Option<&WorkerInfo> {
        let cluster = self.cluster.as_ref()?;
        let partition = match self
            .plugin
            .partition(vertex_id, cluster.num_of_partitions())
        {
            Ok(p) => p,
            Err(e) => {
                warn!(vertex = %vertex_id, error = %e, "partitioner failed");
                return None;
            }
        };
        cluster.find_worker_by_partition(partition)
    }

    /// Bump the epoch and, when configured, arm the stage watchdog.
    fn arm_watchdog(&mut self, myself: &ActorRef<CoordinatorMessage>) {
        self.epoch += 1;
        if let Some(timeout) = self.config.step_timeout {
            let epoch = self.epoch;
            let _ = myself.send_after(timeout, move || CoordinatorMessage::StepTimeout { epoch });
        }
    }

    fn broadcast_barrier(&mut self) {
        let cluster = self.cluster.as_ref().expect("cluster is initialized");
        self.worker_acks.clear();
        for info in &cluster.workers {
            self.worker_acks.add(info.worker.get_id());
            let _ = info.worker.send_message(WorkerMessage::SuperStepBarrier);
        }
    }

    fn broadcast_compute(&mut self) {
        let values = self
            .last_snapshot
            .as_ref()
            .map(|s| Arc::clone(&s.values))
            .unwrap_or_default();
        let cluster = self.cluster.as_ref().expect("cluster is initialized");
        self.worker_acks.clear();
        for info in &cluster.workers {
            self.worker_acks.add(info.worker.get_id());
            let _ = info.worker.send_message(WorkerMessage::Compute {
                superstep: self.current_step,
                aggregated_values: Arc::clone(&values),
            });
        }
    }

    /// Answer a command the current state has no transition for through its
    /// reply port, if it carries one, and return the description.
    fn answer_unhandled(&mut self, message: CoordinatorMessage) -> String {
        let description = format!(
            "unhandled command in state '{}': {message:?}",
            self.phase.state_name()
        );
        match message {
            CoordinatorMessage::NewCluster { reply, .. }
            | CoordinatorMessage::LoadPartitionVertices { reply } => {
                let _ = reply.send(Err(EngineError::Protocol {
                    message: description.clone(),
                }));
            }
            CoordinatorMessage::LoadVertex { vertex_id, reply } => {
                let _ = reply.send(LoadVertexAck {
                    vertex_id,
                    error: Some(description.clone()),
                });
            }
            _ => {}
        }
        description
    }

    /// Unexpected commands at the coordinator level indicate a protocol
    /// bug; answer any carried reply port, then fail the job.
    fn reject(&mut self, message: CoordinatorMessage) {
        let description = self.answer_unhandled(message);
        self.fail(EngineError::Protocol {
            message: description,
        });
    }
}

/// Deterministic partition assignment: contiguous ids, worker order,
/// balanced to within one partition.
pub(crate) fn assign_partitions(
    num_workers: u64,
    num_partitions: u64,
) -> Result<Vec<Vec<u64>>, EngineError> {
    if num_workers == 0 {
        return Err(EngineError::Config {
            message: "no available workers".to_string(),
        });
    }
    if num_partitions == 0 {
        return Err(EngineError::Config {
            message: "no partitions".to_string(),
        });
    }
    if num_workers > num_partitions {
        return Err(EngineError::Config {
            message: format!("{num_workers} workers for {num_partitions} partitions"),
        });
    }

    let base = num_partitions / num_workers;
    let extra = num_partitions % num_workers;
    let mut assigned = Vec::with_capacity(num_workers as usize);
    let mut next = 0u64;
    for i in 0..num_workers {
        let count = base + u64::from(i < extra);
        assigned.push((next..next + count).collect());
        next += count;
    }
    Ok(assigned)
}

/// Wait for a registered remote worker to appear in the process registry.
async fn attach_worker(
    name: &str,
    timeout: Duration,
) -> Result<ActorRef<WorkerMessage>, EngineError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(cell) = ractor::registry::where_is(name.to_string()) {
            return Ok(cell.into());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::Transport {
                message: format!("worker '{name}' not registered within {timeout:?}"),
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

impl Actor for CoordinatorActor {
    type Msg = CoordinatorMessage;
    type State = CoordinatorActorState;
    type Arguments = CoordinatorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(CoordinatorActorState {
            plugin: args.plugin,
            config: args.config,
            phase: CoordinatorPhase::Init,
            cluster: None,
            worker_acks: AckSet::new(),
            aggregated_current_step: HashMap::new(),
            last_snapshot: None,
            current_step: 0,
            epoch: 0,
            new_cluster_reply: None,
            load_reply: None,
            shutdown_hook: args.shutdown_hook,
            last_error: None,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // queries and shutdown are served from any state
        match message {
            CoordinatorMessage::CoordinatorStats(reply) => {
                let mut ack = CoordinatorStatsAck {
                    state: state.phase.state_name().to_string(),
                    superstep: 0,
                    active_vertices: 0,
                    messages_sent: 0,
                    last_error: state.last_error.clone(),
                };
                if let Some(snapshot) = &state.last_snapshot {
                    ack.superstep = snapshot.superstep;
                    match get_stats(&snapshot.values) {
                        Ok(stats) => {
                            ack.active_vertices = stats.active_vertices;
                            ack.messages_sent = stats.messages_sent;
                        }
                        Err(e) => warn!(error = %e, "stats unavailable in snapshot"),
                    }
                }
                if reply.send(ack).is_err() {
                    warn!("stats caller dropped");
                }
                return Ok(());
            }

            CoordinatorMessage::ShowAggregatedValue(reply) => {
                let mut aggregated_values = HashMap::new();
                if let Some(snapshot) = &state.last_snapshot {
                    for (name, value) in snapshot.values.iter() {
                        if is_system_aggregator(name) {
                            continue;
                        }
                        let Some(aggregator) = find_aggregator(state.plugin.as_ref(), name)
                        else {
                            warn!(aggregator = %name, "no aggregator for value");
                            continue;
                        };
                        match aggregator.unmarshal_value(value) {
                            Ok(v) => {
                                aggregated_values.insert(name.clone(), aggregator.to_display(&v));
                            }
                            Err(e) => {
                                warn!(aggregator = %name, error = %e, "value unreadable")
                            }
                        }
                    }
                }
                let _ = reply.send(ShowAggregatedValueAck { aggregated_values });
                return Ok(());
            }

            CoordinatorMessage::GetVertexValue { vertex_id, reply } => {
                match state.worker_for_vertex(&vertex_id) {
                    Some(info) => {
                        let _ = info
                            .worker
                            .send_message(WorkerMessage::GetVertexValue { vertex_id, reply });
                    }
                    None => {
                        warn!(vertex = %vertex_id, "no worker owns the vertex");
                        let _ = reply.send(GetVertexValueAck {
                            vertex_id,
                            value: None,
                        });
                    }
                }
                return Ok(());
            }

            CoordinatorMessage::Shutdown(reply) => {
                info!("shutdown");
                if let Some(cluster) = &state.cluster {
                    for info in &cluster.workers {
                        let _ = info.worker.send_message(WorkerMessage::Shutdown);
                    }
                }
                let _ = reply.send(());
                if let Some(hook) = state.shutdown_hook.take() {
                    hook();
                }
                myself.stop(None);
                return Ok(());
            }

            CoordinatorMessage::StepTimeout { epoch } => {
                let stalled = epoch == state.epoch
                    && matches!(
                        state.phase,
                        CoordinatorPhase::AwaitingBarrier | CoordinatorPhase::Computing
                    );
                if stalled {
                    state.fail(EngineError::Transport {
                        message: format!(
                            "superstep {} stalled in state '{}' ({} worker acks outstanding)",
                            state.current_step,
                            state.phase.state_name(),
                            state.worker_acks.pending()
                        ),
                    });
                }
                return Ok(());
            }

            other => self.handle_phase(myself, other, state).await?,
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
                state.fail(EngineError::Plugin {
                    message: format!("worker {:?} failed: {err}", actor_cell.get_id()),
                });
            }
            SupervisionEvent::ActorTerminated(actor_cell, _, reason) => {
                debug!(actor = ?actor_cell.get_id(), ?reason, "worker terminated");
            }
            _ => {}
        }
        Ok(())
    }
}

impl CoordinatorActor {
    async fn handle_phase(
        &self,
        myself: ActorRef<CoordinatorMessage>,
        message: CoordinatorMessage,
        state: &mut CoordinatorActorState,
    ) -> Result<(), ActorProcessingErr> {
        match state.phase {
            CoordinatorPhase::Init => self.handle_init(myself, message, state).await,
            CoordinatorPhase::Idle => self.handle_idle(myself, message, state),
            CoordinatorPhase::LoadingVertices => self.handle_loading(message, state),
            CoordinatorPhase::AwaitingBarrier => self.handle_barrier(myself, message, state),
            CoordinatorPhase::Computing => self.handle_computing(myself, message, state),
            CoordinatorPhase::Failed => {
                // terminal; answer what can be answered and keep the
                // original diagnostic
                let description = state.answer_unhandled(message);
                warn!(%description, "command dropped by failed job");
                Ok(())
            }
        }
    }

    async fn handle_init(
        &self,
        myself: ActorRef<CoordinatorMessage>,
        message: CoordinatorMessage,
        state: &mut CoordinatorActorState,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMessage::NewCluster {
                workers,
                num_of_partitions,
                reply,
            } => {
                if state.cluster.is_some() {
                    let _ = reply.send(Err(EngineError::Config {
                        message: "cluster has already been initialized".to_string(),
                    }));
                    return Ok(());
                }

                let assigned =
                    match assign_partitions(workers.len() as u64, num_of_partitions) {
                        Ok(a) => a,
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            return Ok(());
                        }
                    };

                state.worker_acks.clear();
                let mut infos = Vec::with_capacity(workers.len());
                for (req, partitions) in workers.into_iter().zip(assigned) {
                    let worker = match self.resolve_worker(&myself, state, &req).await {
                        Ok(w) => w,
                        Err(e) => {
                            let _ = reply.send(Err(EngineError::Transport {
                                message: e.to_string(),
                            }));
                            state.fail(e);
                            return Ok(());
                        }
                    };
                    let _ = worker.send_message(WorkerMessage::InitWorker {
                        coordinator: myself.clone(),
                        partitions: partitions.clone(),
                    });
                    state.worker_acks.add(worker.get_id());
                    infos.push(WorkerInfo { worker, partitions });
                }

                let cluster = ClusterInfo { workers: infos };
                for info in &cluster.workers {
                    let _ = info
                        .worker
                        .send_message(WorkerMessage::ClusterInfo(cluster.clone()));
                }
                state.cluster = Some(cluster);
                state.new_cluster_reply = Some(reply);
                debug!("start initializing workers");
                Ok(())
            }

            CoordinatorMessage::InitWorkerAck { worker } => {
                if !state.worker_acks.ack(&worker) {
                    warn!(?worker, "init ack from unknown worker");
                    return Ok(());
                }
                if state.worker_acks.complete() {
                    state.worker_acks.clear();
                    state.phase = CoordinatorPhase::Idle;
                    if let Some(reply) = state.new_cluster_reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                    info!("cluster initialized, coordinator idle");
                }
                Ok(())
            }

            other => {
                state.reject(other);
                Ok(())
            }
        }
    }

    fn handle_idle(
        &self,
        myself: ActorRef<CoordinatorMessage>,
        message: CoordinatorMessage,
        state: &mut CoordinatorActorState,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMessage::LoadVertex { vertex_id, reply } => {
                match state.worker_for_vertex(&vertex_id) {
                    Some(info) => {
                        let _ = info
                            .worker
                            .send_message(WorkerMessage::LoadVertex { vertex_id, reply });
                    }
                    None => {
                        let message = format!("no worker owns vertex {vertex_id}");
                        warn!(%message, "load vertex rejected");
                        let _ = reply.send(LoadVertexAck {
                            vertex_id,
                            error: Some(message),
                        });
                    }
                }
                Ok(())
            }

            CoordinatorMessage::LoadPartitionVertices { reply } => {
                let cluster = state.cluster.as_ref().expect("idle implies cluster");
                let num_of_partitions = cluster.num_of_partitions();
                state.worker_acks.clear();
                for info in &cluster.workers {
                    state.worker_acks.add(info.worker.get_id());
                    let _ = info
                        .worker
                        .send_message(WorkerMessage::LoadPartitionVertices { num_of_partitions });
                }
                state.load_reply = Some(reply);
                state.phase = CoordinatorPhase::LoadingVertices;
                info!("loading partition vertices");
                Ok(())
            }

            CoordinatorMessage::StartSuperStep => {
                state.aggregated_current_step.clear();
                state.current_step = 0;
                state.broadcast_barrier();
                state.phase = CoordinatorPhase::AwaitingBarrier;
                state.arm_watchdog(&myself);
                info!("------ superstep 0 started ------");
                Ok(())
            }

            other => {
                state.reject(other);
                Ok(())
            }
        }
    }

    fn handle_loading(
        &self,
        message: CoordinatorMessage,
        state: &mut CoordinatorActorState,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMessage::LoadPartitionVerticesWorkerAck { worker } => {
                if !state.worker_acks.ack(&worker) {
                    warn!(?worker, "load ack from unknown worker");
                    return Ok(());
                }
                if state.worker_acks.complete() {
                    state.worker_acks.clear();
                    state.phase = CoordinatorPhase::Idle;
                    if let Some(reply) = state.load_reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                    info!("vertex loading completed");
                }
                Ok(())
            }
            other => {
                state.reject(other);
                Ok(())
            }
        }
    }

    fn handle_barrier(
        &self,
        myself: ActorRef<CoordinatorMessage>,
        message: CoordinatorMessage,
        state: &mut CoordinatorActorState,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMessage::SuperStepBarrierWorkerAck { worker } => {
                if !state.worker_acks.ack(&worker) {
                    warn!(?worker, "barrier ack from unknown worker");
                    return Ok(());
                }
                if state.worker_acks.complete() {
                    state.broadcast_compute();
                    state.phase = CoordinatorPhase::Computing;
                    state.arm_watchdog(&myself);
                    debug!(step = state.current_step, "start computing");
                }
                Ok(())
            }
            other => {
                state.reject(other);
                Ok(())
            }
        }
    }

    fn handle_computing(
        &self,
        myself: ActorRef<CoordinatorMessage>,
        message: CoordinatorMessage,
        state: &mut CoordinatorActorState,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CoordinatorMessage::ComputeWorkerAck {
                worker,
                aggregated_values,
            } => {
                if !state.worker_acks.ack(&worker) {
                    warn!(?worker, "compute ack from unknown worker");
                    return Ok(());
                }
                if let Err(e) = merge_value_maps(
                    state.plugin.as_ref(),
                    &mut state.aggregated_current_step,
                    &aggregated_values,
                ) {
                    state.fail(e);
                    return Ok(());
                }

                if !state.worker_acks.complete() {
                    return Ok(());
                }
                state.worker_acks.clear();

                let stats = match get_stats(&state.aggregated_current_step) {
                    Ok(stats) => stats,
                    Err(e) => {
                        state.fail(e);
                        return Ok(());
                    }
                };

                // snapshot is tagged with the step whose values it contains
                state.last_snapshot = Some(AggregatedSnapshot {
                    superstep: state.current_step,
                    values: Arc::new(mem::take(&mut state.aggregated_current_step)),
                });

                if stats.active_vertices == 0 && stats.messages_sent == 0 {
                    state.phase = CoordinatorPhase::Idle;
                    state.epoch += 1;
                    info!(step = state.current_step, "finish computing, job complete");
                } else {
                    state.current_step += 1;
                    state.broadcast_barrier();
                    state.phase = CoordinatorPhase::AwaitingBarrier;
                    state.arm_watchdog(&myself);
                    info!("----- superstep {} started -----", state.current_step);
                }
                Ok(())
            }
            other => {
                state.reject(other);
                Ok(())
            }
        }
    }

    async fn resolve_worker(
        &self,
        myself: &ActorRef<CoordinatorMessage>,
        state: &CoordinatorActorState,
        req: &WorkerReq,
    ) -> Result<ActorRef<WorkerMessage>, EngineError> {
        if req.remote {
            let name = req.name.as_deref().ok_or_else(|| EngineError::Config {
                message: "remote worker requires a registry name".to_string(),
            })?;
            return attach_worker(name, state.config.worker_init_timeout).await;
        }

        let args = WorkerArgs {
            plugin: state.plugin.clone(),
            config: state.config.clone(),
        };
        Actor::spawn_linked(req.name.clone(), WorkerActor, args, myself.get_cell())
            .await
            .map(|(worker, _)| worker)
            .map_err(|e| EngineError::Transport {
                message: format!("failed to spawn worker: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_balanced_and_contiguous() {
        assert_eq!(
            assign_partitions(3, 7).unwrap(),
            vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]
        );
        assert_eq!(assign_partitions(2, 2).unwrap(), vec![vec![0], vec![1]]);
        assert_eq!(assign_partitions(1, 4).unwrap(), vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn assignment_rejects_degenerate_clusters() {
        assert!(matches!(
            assign_partitions(0, 4),
            Err(EngineError::Config { .. })
        ));
        assert!(matches!(
            assign_partitions(3, 0),
            Err(EngineError::Config { .. })
        ));
        assert!(matches!(
            assign_partitions(5, 3),
            Err(EngineError::Config { .. })
        ));
    }

    #[test]
    fn assignment_spread_is_within_one() {
        for (workers, partitions) in [(2u64, 9u64), (4, 10), (5, 5), (3, 100)] {
            let assigned = assign_partitions(workers, partitions).unwrap();
            let sizes: Vec<usize> = assigned.iter().map(Vec::len).collect();
            let max = sizes.iter().max().unwrap();
            let min = sizes.iter().min().unwrap();
            assert!(max - min <= 1);
            let all: Vec<u64> = assigned.into_iter().flatten().collect();
            assert_eq!(all, (0..partitions).collect::<Vec<_>>());
        }
    }
}
