//! Driver-side client for a running job.
//!
//! The client does not run as an actor; it wraps the coordinator's
//! `ActorRef` and turns the control commands into async request/response
//! calls with a per-operation timeout, keeping driver code free of actor
//! plumbing.

use std::sync::Arc;
use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef, RpcReplyPort};
use tokio::task::JoinHandle;

use crate::command::{
    CoordinatorMessage, CoordinatorStatsAck, GetVertexValueAck, ShowAggregatedValueAck, WorkerReq,
};
use crate::config::ClusterConfig;
use crate::engine::{CoordinatorActor, CoordinatorArgs};
use crate::error::EngineError;
use crate::plugin::{Plugin, VertexId};

/// Handle for driving a job through its coordinator.
#[derive(Clone)]
pub struct JobClient {
    coordinator: ActorRef<CoordinatorMessage>,
    timeout: Duration,
}

impl JobClient {
    /// Spawn a coordinator for `plugin` and return a client for it, plus
    /// the coordinator's join handle for callers that want to await
    /// termination.
    pub async fn spawn(
        plugin: Arc<dyn Plugin>,
        config: ClusterConfig,
    ) -> Result<(Self, JoinHandle<()>), EngineError> {
        let timeout = Duration::from_millis(config.rpc_timeout_ms);
        let args = CoordinatorArgs {
            plugin,
            config,
            shutdown_hook: None,
        };
        let (coordinator, handle) = Actor::spawn(None, CoordinatorActor, args)
            .await
            .map_err(|e| EngineError::Transport {
                message: format!("failed to spawn coordinator: {e}"),
            })?;
        Ok((Self::new(coordinator, timeout), handle))
    }

    /// Wrap an already-running coordinator.
    pub fn new(coordinator: ActorRef<CoordinatorMessage>, timeout: Duration) -> Self {
        Self {
            coordinator,
            timeout,
        }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(RpcReplyPort<T>) -> CoordinatorMessage,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
    {
        match self.coordinator.call(build, Some(self.timeout)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(EngineError::Transport {
                message: format!("coordinator call timed out after {:?}", self.timeout),
            }),
            Ok(CallResult::SenderError) => Err(EngineError::Transport {
                message: "coordinator dropped the reply".to_string(),
            }),
            Err(e) => Err(EngineError::Transport {
                message: format!("coordinator unreachable: {e}"),
            }),
        }
    }

    /// Build the cluster. Resolves once every worker has initialized.
    pub async fn new_cluster(
        &self,
        workers: Vec<WorkerReq>,
        num_of_partitions: u64,
    ) -> Result<(), EngineError> {
        self.call(|reply| CoordinatorMessage::NewCluster {
            workers,
            num_of_partitions,
            reply,
        })
        .await?
    }

    /// Bulk-load every partition's vertices.
    pub async fn load_partition_vertices(&self) -> Result<(), EngineError> {
        self.call(|reply| CoordinatorMessage::LoadPartitionVertices { reply })
            .await?
    }

    /// Load a single vertex (diagnostic path).
    pub async fn load_vertex(&self, vertex_id: VertexId) -> Result<(), EngineError> {
        let ack = self
            .call(|reply| CoordinatorMessage::LoadVertex { vertex_id, reply })
            .await?;
        match ack.error {
            None => Ok(()),
            Some(message) => Err(EngineError::Plugin { message }),
        }
    }

    /// Kick off the superstep loop; returns immediately.
    pub fn start_superstep(&self) -> Result<(), EngineError> {
        self.coordinator
            .send_message(CoordinatorMessage::StartSuperStep)
            .map_err(|e| EngineError::Transport {
                message: format!("coordinator unreachable: {e}"),
            })
    }

    /// Current coordinator state and last-step statistics.
    pub async fn stats(&self) -> Result<CoordinatorStatsAck, EngineError> {
        self.call(CoordinatorMessage::CoordinatorStats).await
    }

    /// User-aggregator values of the last completed step, rendered.
    pub async fn aggregated_values(&self) -> Result<ShowAggregatedValueAck, EngineError> {
        self.call(CoordinatorMessage::ShowAggregatedValue).await
    }

    /// A vertex's current value, or `None` if the vertex is unknown.
    pub async fn vertex_value(&self, vertex_id: VertexId) -> Result<Option<String>, EngineError> {
        let ack: GetVertexValueAck = self
            .call(|reply| CoordinatorMessage::GetVertexValue { vertex_id, reply })
            .await?;
        Ok(ack.value)
    }

    /// Tear the cluster down.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.call(CoordinatorMessage::Shutdown).await
    }

    /// Poll [`stats`](Self::stats) until the job is idle.
    ///
    /// An idle coordinator that has not published a snapshot yet (superstep
    /// 0, nothing computed) is treated as "not started" and polled again,
    /// so calling this right after [`start_superstep`](Self::start_superstep)
    /// does not race the cast. Jobs that terminate during superstep 0 are
    /// indistinguishable from unstarted ones and run into `max_wait`.
    ///
    /// Returns the final stats, or an error when the job failed or
    /// `max_wait` elapsed first.
    pub async fn await_idle(
        &self,
        poll: Duration,
        max_wait: Duration,
    ) -> Result<CoordinatorStatsAck, EngineError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut saw_running = false;
        loop {
            let stats = self.stats().await?;
            match stats.state.as_str() {
                "idle" if saw_running || stats.superstep > 0 => return Ok(stats),
                "idle" => {}
                "failed" => {
                    return Err(EngineError::Protocol {
                        message: stats
                            .last_error
                            .unwrap_or_else(|| "job failed".to_string()),
                    })
                }
                _ => saw_running = true,
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Transport {
                    message: format!("job still '{}' after {max_wait:?}", stats.state),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }
}
