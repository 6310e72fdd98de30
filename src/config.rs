//! Cluster configuration.

use std::time::Duration;

/// Tunables for a grapnel cluster.
///
/// All values have working defaults; construct with `ClusterConfig::default()`
/// and override fields as needed.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// How long to wait for a remote worker to appear in the process
    /// registry during cluster initialization. Initialization only; there is
    /// no retry once the cluster is up.
    pub worker_init_timeout: Duration,

    /// Watchdog for a single barrier or compute stage. `None` disables the
    /// watchdog. When it fires before the stage's acknowledgement set is
    /// complete the job enters the terminal failed state.
    pub step_timeout: Option<Duration>,

    /// Timeout applied by [`JobClient`](crate::client::JobClient) to each
    /// request/response command.
    pub rpc_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            worker_init_timeout: Duration::from_secs(30),
            step_timeout: None,
            rpc_timeout_ms: 5000,
        }
    }
}
