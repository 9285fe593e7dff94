//! In-process consumer group simulation.
//!
//! Runs several consumers of one group against the in-memory backends, produces messages across
//! all partitions, and reports who consumed what. Optionally kills one consumer halfway through to
//! show the group recovering.
//!
//! # Usage
//!
//! ```sh
//! streamgroup-sim --consumers 3 --channels orders,refunds --partitions 4 --messages 200 --crash
//! RUST_LOG=streamgroup_coordination=debug streamgroup-sim --config sim.toml
//! ```

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use streamgroup::ConsumerConfig;
use streamgroup::Fields;
use streamgroup::LeaderHook;
use streamgroup::MessageConsumer;
use streamgroup::PartitionId;
use streamgroup::StreamClient;
use streamgroup::handler_fn;
use streamgroup::testing::DeterministicKeyValueStore;
use streamgroup::testing::InMemoryStreamClient;
use tokio::time::Instant;
use tracing::info;
use tracing::warn;

type SimConsumer = MessageConsumer<DeterministicKeyValueStore, InMemoryStreamClient>;

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "streamgroup-sim")]
#[command(about = "Simulate a consumer group against in-memory backends")]
struct Args {
    /// Number of consumers in the group.
    #[arg(long, default_value_t = 3)]
    consumers: usize,

    /// Comma-separated channel names.
    #[arg(long, value_delimiter = ',', default_value = "orders")]
    channels: Vec<String>,

    /// Partitions per channel.
    #[arg(long, default_value_t = 4)]
    partitions: u32,

    /// Messages to produce, spread round-robin over every partition.
    #[arg(long, default_value_t = 100)]
    messages: u64,

    /// Subscriber id (group name).
    #[arg(long, default_value = "sim")]
    subscriber_id: String,

    /// Consumer configuration file (TOML). Defaults are tuned for a fast simulation.
    #[arg(long, env = "STREAMGROUP_CONFIG")]
    config: Option<PathBuf>,

    /// Abort the first consumer after half of the messages, without leaving the group cleanly.
    #[arg(long)]
    crash: bool,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

struct LogLeadership {
    consumer: usize,
}

impl LeaderHook for LogLeadership {
    fn on_acquired(&self, subscriber_id: &str) -> anyhow::Result<()> {
        info!(consumer = self.consumer, subscriber_id, "consumer became leader");
        Ok(())
    }

    fn on_lost(&self, subscriber_id: &str) -> anyhow::Result<()> {
        info!(consumer = self.consumer, subscriber_id, "consumer stopped leading");
        Ok(())
    }
}

fn load_config(args: &Args) -> Result<ConsumerConfig> {
    let config = match &args.config {
        Some(path) => ConsumerConfig::from_toml_file(path)?,
        None => ConsumerConfig {
            block_duration_ms: 200,
            missing_key_backoff_ms: 100,
            handler_failure_backoff_ms: 100,
            membership_ttl_ms: 1_500,
            heartbeat_interval_ms: 300,
            leadership_lease_ttl_ms: 1_500,
            coordinator_poll_interval_ms: 200,
            ..ConsumerConfig::default()
        },
    };
    let config = config.apply_env();
    config.validate()?;
    Ok(config)
}

async fn owned_partitions(consumers: &[SimConsumer]) -> BTreeSet<PartitionId> {
    let mut owned = BTreeSet::new();
    for consumer in consumers {
        for subscription in consumer.subscriptions() {
            owned.extend(subscription.assigned_partitions().await);
        }
    }
    owned
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.consumers > 0, "--consumers must be at least 1");
    anyhow::ensure!(args.partitions > 0, "--partitions must be at least 1");
    let config = load_config(&args).context("invalid consumer configuration")?;
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);

    let store = DeterministicKeyValueStore::new();
    let streams = InMemoryStreamClient::new();
    for channel in &args.channels {
        streams.create_partitions(channel, args.partitions);
    }
    let all_partitions: BTreeSet<PartitionId> = args
        .channels
        .iter()
        .flat_map(|c| (0..args.partitions).map(move |i| PartitionId::new(c.as_str(), i)))
        .collect();

    let delivered = Arc::new(AtomicU64::new(0));
    let mut consumers: Vec<SimConsumer> = Vec::with_capacity(args.consumers);
    let mut counts: Vec<Arc<AtomicU64>> = Vec::with_capacity(args.consumers);

    for i in 0..args.consumers {
        let consumer_config = ConsumerConfig {
            consumer_id: Some(format!("sim-consumer-{i}")),
            ..config.clone()
        };
        let consumer = MessageConsumer::new(store.clone(), streams.clone(), consumer_config)?;
        consumer.set_leader_hook(Arc::new(LogLeadership { consumer: i }));

        let count = Arc::new(AtomicU64::new(0));
        let (count_in_handler, delivered) = (count.clone(), delivered.clone());
        consumer
            .subscribe(
                &args.subscriber_id,
                args.channels.iter().cloned(),
                handler_fn(move |_message| {
                    let (count, delivered) = (count_in_handler.clone(), delivered.clone());
                    async move {
                        count.fetch_add(1, Ordering::Relaxed);
                        delivered.fetch_add(1, Ordering::Relaxed);
                        anyhow::Ok(())
                    }
                }),
            )
            .await?;
        consumers.push(consumer);
        counts.push(count);
    }

    while owned_partitions(&consumers).await != all_partitions {
        anyhow::ensure!(Instant::now() < deadline, "partitions were not fully assigned before the timeout");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(partitions = all_partitions.len(), consumers = args.consumers, "group stable, producing");

    let partitions: Vec<&PartitionId> = all_partitions.iter().collect();
    for seq in 0..args.messages {
        if args.crash && seq == args.messages / 2 {
            warn!("aborting sim-consumer-0");
            for subscription in consumers[0].subscriptions() {
                subscription.abort().await;
            }
        }
        let partition = partitions[(seq % partitions.len() as u64) as usize];
        let fields = Fields::from([("seq".to_string(), seq.to_string())]);
        streams.append(&partition.stream_key(), fields).await?;
    }

    while delivered.load(Ordering::Relaxed) < args.messages {
        if Instant::now() >= deadline {
            warn!(
                delivered = delivered.load(Ordering::Relaxed),
                produced = args.messages,
                "not every message was delivered before the timeout"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut report = BTreeMap::new();
    for (i, consumer) in consumers.iter().enumerate() {
        let leader = consumer.subscriptions().iter().any(|s| s.is_leader());
        report.insert(consumer.id().to_string(), (counts[i].load(Ordering::Relaxed), leader));
    }
    for (id, (count, leader)) in &report {
        println!("{id}: {count} messages{}", if *leader { " (leader)" } else { "" });
    }
    println!("delivered {} of {} produced", delivered.load(Ordering::Relaxed), args.messages);

    for consumer in &consumers {
        consumer.close().await;
    }
    Ok(())
}
