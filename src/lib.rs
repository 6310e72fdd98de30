//! Grapnel: a bulk-synchronous (Pregel-style) graph computation engine.
//!
//! A user-supplied [`Plugin`](plugin::Plugin) describes one graph
//! computation: how vertices are materialized, the per-vertex
//! [`compute`](plugin::VertexProgram::compute) function, an optional message
//! combiner, and aggregation functions. The engine runs globally
//! synchronized supersteps across a coordinator / worker / partition /
//! vertex actor hierarchy until every vertex has voted to halt and no
//! messages remain in flight.
//!
//! A job is driven through [`JobClient`]:
//!
//! ```rust,ignore
//! let (client, _handle) = JobClient::spawn(plugin, ClusterConfig::default()).await?;
//! client.new_cluster(vec![WorkerReq::local(), WorkerReq::local()], 4).await?;
//! client.load_partition_vertices().await?;
//! client.start_superstep()?;
//! let stats = client.await_idle(poll, max_wait).await?;
//! ```

#![warn(missing_docs)]

/// Aggregator reduction helpers and the system vertex-stats aggregator.
pub mod aggregator;
/// Driver-side client for a running job.
pub mod client;
/// Command envelopes and per-actor message enums.
pub mod command;
/// Cluster configuration.
pub mod config;
/// The coordinator / worker / partition / vertex actor hierarchy.
pub mod engine;
/// Engine error types.
pub mod error;
/// The user plugin contract.
pub mod plugin;
/// Small shared utilities.
pub mod util;

pub use client::JobClient;
pub use command::WorkerReq;
pub use config::ClusterConfig;
pub use error::EngineError;
