//! End-to-end superstep scenarios over a full local cluster.

mod common;

use std::sync::Arc;
use std::time::Duration;

use grapnel::plugin::{Plugin, VertexId};
use grapnel::{ClusterConfig, EngineError, JobClient, WorkerReq};

use common::{
    four_vertex_plugin, CombinerProbePlugin, MaxValuePlugin, WakePlugin, MAX_AGGREGATOR,
};

const POLL: Duration = Duration::from_millis(20);
const MAX_WAIT: Duration = Duration::from_secs(10);

async fn start_cluster(plugin: Arc<dyn Plugin>, workers: usize, partitions: u64) -> JobClient {
    common::init_tracing();
    let (client, _handle) = JobClient::spawn(plugin, ClusterConfig::default())
        .await
        .expect("spawn coordinator");
    client
        .new_cluster(vec![WorkerReq::local(); workers], partitions)
        .await
        .expect("cluster init");
    client
}

async fn run_to_completion(client: &JobClient) -> grapnel::command::CoordinatorStatsAck {
    client.start_superstep().expect("start superstep");
    client.await_idle(POLL, MAX_WAIT).await.expect("job completes")
}

#[tokio::test]
async fn maximum_value_propagates_across_the_graph() {
    let client = start_cluster(four_vertex_plugin(), 2, 4).await;
    client.load_partition_vertices().await.unwrap();

    let stats = run_to_completion(&client).await;
    assert_eq!(stats.superstep, 2);
    assert_eq!(stats.active_vertices, 0);
    assert_eq!(stats.messages_sent, 0);

    for (vertex, expected) in [("A", "5"), ("B", "5"), ("C", "9"), ("D", "9")] {
        let value = client.vertex_value(VertexId::from(vertex)).await.unwrap();
        assert_eq!(value.as_deref(), Some(expected), "vertex {vertex}");
    }

    let aggregated = client.aggregated_values().await.unwrap();
    assert_eq!(
        aggregated.aggregated_values.get(MAX_AGGREGATOR).map(String::as_str),
        Some("9")
    );

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn loading_vertices_individually_matches_bulk_loading() {
    let client = start_cluster(four_vertex_plugin(), 1, 2).await;
    for vertex in ["A", "B", "C", "D"] {
        client.load_vertex(VertexId::from(vertex)).await.unwrap();
    }

    let stats = run_to_completion(&client).await;
    assert_eq!(stats.superstep, 2);
    let value = client.vertex_value(VertexId::from("D")).await.unwrap();
    assert_eq!(value.as_deref(), Some("9"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn isolated_vertex_halts_and_retains_its_value() {
    let plugin = Arc::new(MaxValuePlugin::new(&[("only", 7, &[])]));
    let client = start_cluster(plugin, 1, 1).await;
    client.load_partition_vertices().await.unwrap();

    let stats = run_to_completion(&client).await;
    assert_eq!(stats.superstep, 1);
    assert_eq!(stats.active_vertices, 0);
    assert_eq!(stats.messages_sent, 0);

    let value = client.vertex_value(VertexId::from("only")).await.unwrap();
    assert_eq!(value.as_deref(), Some("7"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn degenerate_clusters_are_rejected() {
    let (client, _handle) = JobClient::spawn(four_vertex_plugin(), ClusterConfig::default())
        .await
        .unwrap();

    let err = client
        .new_cluster(vec![WorkerReq::local()], 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config { .. }), "{err}");

    let err = client.new_cluster(Vec::new(), 3).await.unwrap_err();
    assert!(matches!(err, EngineError::Config { .. }), "{err}");

    let err = client
        .new_cluster(vec![WorkerReq::local(); 3], 2)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config { .. }), "{err}");

    // a valid request still goes through afterwards
    client
        .new_cluster(vec![WorkerReq::local()], 1)
        .await
        .unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn messages_cross_worker_boundaries() {
    let plugin = Arc::new(
        MaxValuePlugin::new(&[("v1", 5, &["v2"]), ("v2", 1, &[])])
            .with_partition_override("v1", 0)
            .with_partition_override("v2", 1),
    );
    let client = start_cluster(plugin, 2, 2).await;
    client.load_partition_vertices().await.unwrap();

    let stats = run_to_completion(&client).await;
    assert_eq!(stats.superstep, 2);

    // v2 saw v1's value at superstep 1
    let value = client.vertex_value(VertexId::from("v2")).await.unwrap();
    assert_eq!(value.as_deref(), Some("5"));
    let value = client.vertex_value(VertexId::from("v1")).await.unwrap();
    assert_eq!(value.as_deref(), Some("5"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn halted_vertex_wakes_on_incoming_mail() {
    let client = start_cluster(Arc::new(WakePlugin), 1, 2).await;
    client.load_partition_vertices().await.unwrap();

    let stats = run_to_completion(&client).await;
    assert_eq!(stats.superstep, 3);

    // the sleeper halted at step 0 and ran again only at step 3, after the
    // waker's step-2 message re-armed it
    let value = client.vertex_value(VertexId::from("sleeper")).await.unwrap();
    assert_eq!(value.as_deref(), Some("3"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn combiner_folds_same_destination_messages() {
    let client = start_cluster(Arc::new(CombinerProbePlugin::new(&[3, 7, 5])), 2, 2).await;
    client.load_partition_vertices().await.unwrap();

    let stats = run_to_completion(&client).await;
    assert_eq!(stats.superstep, 1);

    // one message, value 7, instead of the original three
    let value = client
        .vertex_value(VertexId::from("collector"))
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("1/7"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn queries_answer_before_and_after_the_job() {
    let plugin = Arc::new(MaxValuePlugin::new(&[("only", 7, &[])]));
    let client = start_cluster(plugin, 1, 1).await;
    client.load_partition_vertices().await.unwrap();

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.state, "idle");
    assert_eq!(stats.superstep, 0);
    assert!(stats.last_error.is_none());

    // unknown vertices answer with no value instead of an error
    let value = client.vertex_value(VertexId::from("missing")).await.unwrap();
    assert_eq!(value, None);

    run_to_completion(&client).await;

    let aggregated = client.aggregated_values().await.unwrap();
    assert!(aggregated.aggregated_values.contains_key(MAX_AGGREGATOR));

    client.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.stats().await.is_err(), "coordinator should be gone");
}

#[tokio::test]
async fn message_to_unknown_vertex_fails_the_job() {
    let plugin = Arc::new(MaxValuePlugin::new(&[("a", 1, &["ghost"])]));
    let client = start_cluster(plugin, 1, 1).await;
    client.load_partition_vertices().await.unwrap();

    client.start_superstep().unwrap();
    let err = client.await_idle(POLL, MAX_WAIT).await.unwrap_err();
    assert!(matches!(err, EngineError::Protocol { .. }), "{err}");

    let stats = client.stats().await.unwrap();
    assert_eq!(stats.state, "failed");
    assert!(stats.last_error.is_some());
}
