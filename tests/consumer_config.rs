//! Loading consumer settings from a file and the environment, then running with them.

mod support;

use std::io::Write;

use streamgroup::ConsumerConfig;
use streamgroup::MessageConsumer;
use streamgroup::testing::DeterministicKeyValueStore;
use streamgroup::testing::InMemoryStreamClient;
use support::RecordingHandler;
use support::wait_for_partitions;

#[tokio::test]
async fn test_consumer_runs_with_file_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
consumer_id = "file-consumer"
block_duration_ms = 20
missing_key_backoff_ms = 10
membership_ttl_ms = 300
heartbeat_interval_ms = 50
leadership_lease_ttl_ms = 300
coordinator_poll_interval_ms = 20
"#
    )
    .unwrap();

    let config = ConsumerConfig::from_toml_file(file.path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.consumer_id.as_deref(), Some("file-consumer"));
    assert_eq!(config.handler_failure_backoff_ms, ConsumerConfig::default().handler_failure_backoff_ms);

    let streams = InMemoryStreamClient::new();
    streams.create_partitions("orders", 2);
    let consumer = MessageConsumer::new(DeterministicKeyValueStore::new(), streams, config).unwrap();
    assert_eq!(consumer.id(), "file-consumer");

    let subscription = consumer.subscribe("billing", ["orders"], RecordingHandler::new()).await.unwrap();
    wait_for_partitions(&subscription, 2).await;
    consumer.close().await;
}

#[test]
fn test_malformed_config_file_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "membership_ttl_ms = \"soon\"").unwrap();

    let err = ConsumerConfig::from_toml_file(file.path()).unwrap_err();
    assert!(matches!(err, streamgroup::ConsumerError::ParseConfig { .. }), "{err}");
}

#[test]
fn test_consumer_id_with_key_separator_is_refused() {
    // Such an id could never be read back from its membership key, so the consumer would lead
    // and heartbeat without ever owning a partition.
    let result = MessageConsumer::new(
        DeterministicKeyValueStore::new(),
        InMemoryStreamClient::new(),
        support::fast_config("host-a/worker-1"),
    );
    assert!(matches!(result, Err(streamgroup::ConsumerError::InvalidConfig { .. })));
}

#[test]
fn test_heartbeat_must_fit_inside_membership_ttl() {
    let config = ConsumerConfig {
        membership_ttl_ms: 100,
        heartbeat_interval_ms: 100,
        ..ConsumerConfig::default()
    };
    assert!(config.validate().is_err());
}
