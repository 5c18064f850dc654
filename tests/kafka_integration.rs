//! Kafka multiplexer integration tests using testcontainers.
//!
//! Run with: cargo test --test kafka_integration --features kafka -- --nocapture
//!
//! Uses Redpanda, which speaks the Kafka protocol and starts in seconds.

#![cfg(feature = "kafka")]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kafka_mux::client::{
    KafkaAsyncProducer, KafkaConfig, KafkaConsumerFactory, KafkaSyncProducer, Opaque,
};
use kafka_mux::Multiplexer;
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Generates a unique port in the ephemeral range for testing.
fn generate_test_port() -> u16 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        .hash(&mut hasher);

    // Use ports in 29000-29999 range (less likely to conflict)
    29000 + (hasher.finish() % 1000) as u16
}

/// Start Redpanda with the advertised listener matching a fixed host port.
///
/// Clients take broker addresses from metadata, so the advertised address
/// has to be reachable from the host.
async fn start_kafka() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let host_port = generate_test_port();
    let container_port = 9092u16;
    let advertised_addr = format!("localhost:{}", host_port);

    println!(
        "Starting Redpanda with fixed port mapping: {} -> {}",
        host_port, container_port
    );

    // with_wait_for must be called before with_mapped_port due to type constraints
    let image = GenericImage::new("redpandadata/redpanda", "v24.1.1")
        .with_wait_for(WaitFor::message_on_stderr("Successfully started Redpanda"));

    let container = image
        .with_mapped_port(host_port, ContainerPort::Tcp(container_port))
        .with_cmd([
            "redpanda",
            "start",
            "--mode",
            "dev-container",
            "--smp",
            "1",
            "--memory",
            "512M",
            "--overprovisioned",
            "--kafka-addr",
            "0.0.0.0:9092",
            "--advertise-kafka-addr",
            &advertised_addr,
        ])
        .with_startup_timeout(Duration::from_secs(120))
        .start()
        .await
        .expect("Failed to start Redpanda container");

    // Wait for Redpanda to be fully ready
    tokio::time::sleep(Duration::from_secs(3)).await;

    (container, advertised_addr)
}

fn new_multiplexer(bootstrap_servers: &str, name: &str) -> Arc<Multiplexer> {
    let config = KafkaConfig::new([bootstrap_servers]);

    let sync_producer =
        KafkaSyncProducer::new(config.clone()).expect("Failed to create sync producer");
    let async_producer =
        KafkaAsyncProducer::create(config.clone()).expect("Failed to create async producer");

    Multiplexer::new(
        Arc::new(KafkaConsumerFactory::new(config)),
        Arc::new(sync_producer),
        async_producer,
        name,
    )
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

async fn next<T>(rx: &mut mpsc::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(20), rx.recv())
        .await
        .expect("Timed out waiting for message")
        .expect("Channel closed")
}

#[tokio::test]
async fn test_kafka_fan_out() {
    println!("=== Kafka Fan-out Test ===");

    let (_container, bootstrap_servers) = start_kafka().await;
    let topic = unique("orders");
    let mux = new_multiplexer(&bootstrap_servers, &unique("orders-mux"));

    let billing = mux.new_connection("billing");
    let shipping = mux.new_connection("shipping");

    // Produce first so the topic exists before the group subscribes.
    billing
        .send_sync_message(
            &topic,
            Some(Bytes::from_static(b"k1")),
            Bytes::from_static(b"v1"),
        )
        .await
        .expect("Failed to publish");

    let mut billing_orders = billing.consume_topic(&topic).await.unwrap();
    let mut shipping_orders = shipping.consume_topic(&topic).await.unwrap();
    mux.start().await.expect("Failed to start multiplexer");

    let to_billing = next(&mut billing_orders).await;
    let to_shipping = next(&mut shipping_orders).await;

    assert_eq!(to_billing.key, Some(Bytes::from_static(b"k1")));
    assert_eq!(to_billing.value, Bytes::from_static(b"v1"));
    assert_eq!(to_shipping.value, Bytes::from_static(b"v1"));

    mux.close().await;
    println!("=== Kafka Fan-out Test PASSED ===");
}

#[tokio::test]
async fn test_kafka_async_outcome_routing() {
    println!("=== Kafka Async Outcome Test ===");

    let (_container, bootstrap_servers) = start_kafka().await;
    let topic = unique("payments");
    let mux = new_multiplexer(&bootstrap_servers, &unique("payments-mux"));
    mux.start().await.unwrap();

    let conn = mux.new_connection("billing");
    let (success_tx, mut success_rx) = mpsc::channel(4);
    let (error_tx, mut error_rx) = mpsc::channel(4);
    let request: Opaque = Arc::new("req-1".to_string());

    conn.send_async_message(
        &topic,
        None,
        Bytes::from_static(b"paid"),
        Some(request),
        Some(success_tx),
        Some(error_tx),
    )
    .expect("Failed to enqueue");

    let success = next(&mut success_rx).await;
    assert_eq!(success.topic, topic);
    assert!(success.partition >= 0);
    assert_eq!(success.offset, 0);
    assert_eq!(
        success.metadata.downcast_ref::<String>(),
        Some(&"req-1".to_string())
    );
    assert!(error_rx.try_recv().is_err());

    mux.close().await;
    println!("=== Kafka Async Outcome Test PASSED ===");
}

#[tokio::test]
async fn test_kafka_group_resumes_after_marked_offset() {
    println!("=== Kafka Resume Test ===");

    let (_container, bootstrap_servers) = start_kafka().await;
    let topic = unique("orders");
    let group = unique("resume-mux");

    let first = new_multiplexer(&bootstrap_servers, &group);
    let producer = first.new_connection("producer");
    for value in [&b"m1"[..], &b"m2"[..]] {
        producer
            .send_sync_message(&topic, None, Bytes::copy_from_slice(value))
            .await
            .unwrap();
    }

    let mut orders = first
        .new_connection("billing")
        .consume_topic(&topic)
        .await
        .unwrap();
    first.start().await.unwrap();
    assert_eq!(next(&mut orders).await.value, Bytes::from_static(b"m1"));
    assert_eq!(next(&mut orders).await.value, Bytes::from_static(b"m2"));

    // Let the loop mark the last message before leaving the group.
    tokio::time::sleep(Duration::from_secs(1)).await;
    first.close().await;
    drop(first);

    let second = new_multiplexer(&bootstrap_servers, &group);
    second
        .new_connection("producer")
        .send_sync_message(&topic, None, Bytes::from_static(b"m3"))
        .await
        .unwrap();

    let mut resumed = second
        .new_connection("billing")
        .consume_topic(&topic)
        .await
        .unwrap();
    second.start().await.unwrap();
    assert_eq!(next(&mut resumed).await.value, Bytes::from_static(b"m3"));

    second.close().await;
    println!("=== Kafka Resume Test PASSED ===");
}
