// Backend producer adapters. Every adapter follows the same shape: publish
// enqueues into a bounded queue within a configured time bound, a worker
// task drives the backend client, and durable acceptance is signalled
// through the adapter's `ReliableAckHandle`. The pipeline never touches a
// backend socket directly.
mod file;
mod kafka;
mod mqtt;
mod nats;

pub use file::FileProducer;
pub use kafka::KafkaProducer;
pub use mqtt::MqttProducer;
pub use nats::NatsProducer;

use anyhow::{Context, Result};
use fleetline_pipeline::{AckSignal, Producer, ProducerError, Record, ReliableAckHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::IngestConfig;

pub const KAFKA: &str = "kafka";
pub const NATS: &str = "nats";
pub const MQTT: &str = "mqtt";
pub const FILE: &str = "file";

/// Construct every producer named in the config. A backend that fails to
/// initialize aborts startup.
pub async fn build(
    config: &IngestConfig,
    ack_tx: &mpsc::Sender<AckSignal>,
) -> Result<HashMap<String, Arc<dyn Producer>>> {
    let options = AdapterOptions {
        namespace: config.namespace.clone(),
        queue_depth: config.producers.queue_depth.max(1),
        publish_timeout: config.publish_timeout(),
    };
    let mut producers: HashMap<String, Arc<dyn Producer>> = HashMap::new();
    if let Some(section) = &config.producers.kafka {
        let producer = KafkaProducer::connect(section, &options, ack_handle(KAFKA, config, ack_tx))
            .await
            .context("initialize kafka producer")?;
        producers.insert(KAFKA.to_string(), Arc::new(producer));
    }
    if let Some(section) = &config.producers.nats {
        let producer = NatsProducer::connect(section, &options, ack_handle(NATS, config, ack_tx))
            .await
            .context("initialize nats producer")?;
        producers.insert(NATS.to_string(), Arc::new(producer));
    }
    if let Some(section) = &config.producers.mqtt {
        let producer = MqttProducer::connect(section, &options, ack_handle(MQTT, config, ack_tx))
            .context("initialize mqtt producer")?;
        producers.insert(MQTT.to_string(), Arc::new(producer));
    }
    if let Some(section) = &config.producers.file {
        let producer = FileProducer::open(section, &options, ack_handle(FILE, config, ack_tx))
            .await
            .context("initialize file producer")?;
        producers.insert(FILE.to_string(), Arc::new(producer));
    }
    Ok(producers)
}

fn ack_handle(
    name: &str,
    config: &IngestConfig,
    ack_tx: &mpsc::Sender<AckSignal>,
) -> ReliableAckHandle {
    let tags = config
        .reliable_ack_sources
        .iter()
        .filter(|(_, producer)| producer.as_str() == name)
        .map(|(tag, _)| tag.clone())
        .collect();
    ReliableAckHandle::new(name, tags, ack_tx.clone())
}

pub(crate) struct AdapterOptions {
    pub namespace: String,
    pub queue_depth: usize,
    pub publish_timeout: Duration,
}

/// Bounded hand-off queue between `publish` and an adapter's worker task.
/// Owns the close protocol: dropping the sender lets the worker drain the
/// backlog, and close waits for it under the deadline.
pub(crate) struct PublishQueue {
    backend: String,
    tx: Mutex<Option<mpsc::Sender<Record>>>,
    depth: Arc<AtomicUsize>,
    publish_timeout: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PublishQueue {
    pub(crate) fn channel(queue_depth: usize) -> (mpsc::Sender<Record>, mpsc::Receiver<Record>) {
        mpsc::channel(queue_depth.max(1))
    }

    pub(crate) fn new(
        backend: &str,
        tx: mpsc::Sender<Record>,
        depth: Arc<AtomicUsize>,
        publish_timeout: Duration,
        worker: JoinHandle<()>,
    ) -> Self {
        Self {
            backend: backend.to_string(),
            tx: Mutex::new(Some(tx)),
            depth,
            publish_timeout,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(crate) async fn submit(&self, record: &Record) -> Result<(), ProducerError> {
        let sender = self.tx.lock().expect("queue lock").clone();
        let Some(sender) = sender else {
            return Err(ProducerError::Closed {
                backend: self.backend.clone(),
            });
        };
        self.depth.fetch_add(1, Ordering::AcqRel);
        match tokio::time::timeout(self.publish_timeout, sender.send(record.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Err(ProducerError::Closed {
                    backend: self.backend.clone(),
                })
            }
            Err(_) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                Err(ProducerError::Timeout {
                    backend: self.backend.clone(),
                })
            }
        }
    }

    /// Stop accepting records and wait for the worker to drain its
    /// backlog. Records still queued at the deadline are surfaced through
    /// the error hook before the worker is aborted.
    pub(crate) async fn close(&self, deadline: Duration) -> Result<(), ProducerError> {
        drop(self.tx.lock().expect("queue lock").take());
        let worker = self.worker.lock().expect("worker lock").take();
        let Some(worker) = worker else {
            return Ok(());
        };
        let abort = worker.abort_handle();
        match tokio::time::timeout(deadline, worker).await {
            Ok(_) => Ok(()),
            Err(_) => {
                let pending = self.depth.load(Ordering::Acquire);
                fleetline_pipeline::report_error(
                    &self.backend,
                    "close",
                    &format!("deadline exceeded with {pending} records still queued"),
                );
                abort.abort();
                Err(ProducerError::Timeout {
                    backend: self.backend.clone(),
                })
            }
        }
    }
}
