// Subject-bus backend. Subjects follow the fleet convention
// `<namespace>.<device_id>.<topic>`; existing subscribers depend on the
// `V` -> `data` substitution inside `wire_topic_name`.
use anyhow::{Context, Result};
use async_trait::async_trait;
use fleetline_pipeline::{Producer, ProducerError, Record, ReliableAckHandle, report_error};
use fleetline_wire::wire_topic_name;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::NatsSection;

use super::{AdapterOptions, NATS, PublishQueue};

pub struct NatsProducer {
    queue: PublishQueue,
}

impl NatsProducer {
    pub async fn connect(
        section: &NatsSection,
        options: &AdapterOptions,
        ack: ReliableAckHandle,
    ) -> Result<Self> {
        let client = async_nats::connect(&section.url)
            .await
            .context("connect nats server")?;
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
            queue: PublishQueue::new(NATS, tx, depth, options.publish_timeout, worker),
        })
    }
}

#[async_trait]
impl Producer for NatsProducer {
    fn name(&self) -> &str {
        NATS
    }

    async fn publish(&self, record: &Record) -> Result<(), ProducerError> {
        self.queue.submit(record).await
    }

    async fn close(&self, deadline: Duration) -> Result<(), ProducerError> {
        self.queue.close(deadline).await
    }
}

pub(crate) fn subject_for(namespace: &str, record: &Record) -> String {
    format!(
        "{namespace}.{}.{}",
        record.identity.device_id(),
        wire_topic_name(&record.type_tag)
    )
}

async fn run_worker(
    client: async_nats::Client,
    mut rx: mpsc::Receiver<Record>,
    ack: ReliableAckHandle,
    namespace: String,
    depth: Arc<AtomicUsize>,
) {
    while let Some(record) = rx.recv().await {
        depth.fetch_sub(1, Ordering::AcqRel);
        let subject = subject_for(&namespace, &record);
        match client.publish(subject, record.payload.clone()).await {
            Ok(()) => ack.signal(&record),
            Err(err) => report_error(NATS, "publish", &err),
        }
    }
    // Push whatever the client buffered before the connection drops.
    if let Err(err) = client.flush().await {
        report_error(NATS, "flush", &err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fleetline_pipeline::VehicleIdentity;
    use fleetline_wire::Envelope;

    fn record(type_tag: &str) -> Record {
        let identity = VehicleIdentity::from_device_id("5YJ3E1EA1NF123456").expect("identity");
        let envelope = Envelope {
            txid: Bytes::from_static(b"\x01"),
            sender_id: Bytes::copy_from_slice(identity.sender_id().as_bytes()),
            message_topic: Bytes::copy_from_slice(type_tag.as_bytes()),
            payload: Bytes::from_static(b"blob"),
        };
        Record::from_envelope(&envelope, &identity).expect("record")
    }

    #[test]
    fn telemetry_subject_ends_in_data() {
        assert_eq!(
            subject_for("tesla_telemetry", &record("V")),
            "tesla_telemetry.5YJ3E1EA1NF123456.data"
        );
    }

    #[test]
    fn other_tags_use_the_tag_verbatim() {
        assert_eq!(
            subject_for("tesla_telemetry", &record("alerts")),
            "tesla_telemetry.5YJ3E1EA1NF123456.alerts"
        );
    }
}
