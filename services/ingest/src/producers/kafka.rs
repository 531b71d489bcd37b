// Partitioned commit log backend. Records for one vehicle always land on
// the same partition (keyed by device id) so per-vehicle ordering survives
// the topic's partitioning.
use anyhow::{Context, Result};
use async_trait::async_trait;
use fleetline_pipeline::{Producer, ProducerError, Record, ReliableAckHandle, report_error};
use fleetline_wire::wire_topic_name;
use rskafka::client::Client;
use rskafka::client::ClientBuilder;
use rskafka::client::partition::{Compression, PartitionClient, UnknownTopicHandling};
use rskafka::record::Record as KafkaRecord;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::KafkaSection;

use super::{AdapterOptions, KAFKA, PublishQueue};

pub struct KafkaProducer {
    queue: PublishQueue,
}

impl KafkaProducer {
    pub async fn connect(
        section: &KafkaSection,
        options: &AdapterOptions,
        ack: ReliableAckHandle,
    ) -> Result<Self> {
        let client = ClientBuilder::new(section.brokers.clone())
            .build()
            .await
            .context("connect kafka brokers")?;
        let (tx, rx) = PublishQueue::channel(options.queue_depth);
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(
            client,
            rx,
            ack,
            options.namespace.clone(),
            Arc::clone(&depth),
        ));
        Ok(Self {
            queue: PublishQueue::new(KAFKA, tx, depth, options.publish_timeout, worker),
        })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    fn name(&self) -> &str {
        KAFKA
    }

    async fn publish(&self, record: &Record) -> Result<(), ProducerError> {
        self.queue.submit(record).await
    }

    async fn close(&self, deadline: Duration) -> Result<(), ProducerError> {
        self.queue.close(deadline).await
    }
}

async fn run_worker(
    client: Client,
    mut rx: mpsc::Receiver<Record>,
    ack: ReliableAckHandle,
    namespace: String,
    depth: Arc<AtomicUsize>,
) {
    // Partition clients are built lazily per topic and reused; the topic
    // set is small (one per record type).
    let mut topics: HashMap<String, Vec<PartitionClient>> = HashMap::new();
    while let Some(record) = rx.recv().await {
        depth.fetch_sub(1, Ordering::AcqRel);
        let topic = format!("{namespace}_{}", wire_topic_name(&record.type_tag));
        match publish_one(&client, &mut topics, &topic, &record).await {
            Ok(()) => ack.signal(&record),
            Err(err) => report_error(KAFKA, "publish", &err),
        }
    }
}

async fn publish_one(
    client: &Client,
    topics: &mut HashMap<String, Vec<PartitionClient>>,
    topic: &str,
    record: &Record,
) -> Result<()> {
    if !topics.contains_key(topic) {
        topics.insert(topic.to_string(), partition_clients(client, topic).await?);
    }
    let partitions = &topics[topic];
    let index = partition_for(record.identity.device_id(), partitions.len());
    let kafka_record = KafkaRecord {
        key: Some(record.identity.device_id().as_bytes().to_vec()),
        value: Some(record.payload.to_vec()),
        headers: BTreeMap::from([("txid".to_string(), record.txid.to_vec())]),
        timestamp: record.received_at.into(),
    };
    partitions[index]
        .produce(vec![kafka_record], Compression::NoCompression)
        .await
        .with_context(|| format!("produce to {topic}"))?;
    Ok(())
}

async fn partition_clients(client: &Client, topic: &str) -> Result<Vec<PartitionClient>> {
    let known = client.list_topics().await.context("list kafka topics")?;
    let partition_ids: Vec<i32> = known
        .into_iter()
        .find(|candidate| candidate.name == topic)
        .map(|candidate| candidate.partitions.into_iter().collect::<Vec<i32>>())
        .unwrap_or_else(|| vec![0]);
    let mut clients = Vec::with_capacity(partition_ids.len());
    for partition in partition_ids {
        clients.push(
            client
                .partition_client(topic, partition, UnknownTopicHandling::Retry)
                .await
                .with_context(|| format!("partition client {topic}/{partition}"))?,
        );
    }
    Ok(clients)
}

fn partition_for(device_id: &str, partitions: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_choice_is_stable_per_device() {
        let first = partition_for("5YJ3E1EA1NF123456", 12);
        for _ in 0..10 {
            assert_eq!(partition_for("5YJ3E1EA1NF123456", 12), first);
        }
        assert!(first < 12);
    }

    #[test]
    fn single_partition_topics_always_use_zero() {
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }
}
