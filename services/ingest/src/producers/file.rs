// Local JSON-lines sink, one line per record, for development setups and
// integration tests. Acceptance is signalled after the line has been
// flushed to the file.
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use fleetline_pipeline::{Producer, ProducerError, Record, ReliableAckHandle, report_error};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use crate::config::FileSection;

use super::{AdapterOptions, FILE, PublishQueue};

pub struct FileProducer {
    queue: PublishQueue,
}

impl FileProducer {
    pub async fn open(
        section: &FileSection,
        options: &AdapterOptions,
        ack: ReliableAckHandle,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&section.path)
            .await
            .with_context(|| format!("open record sink: {}", section.path.display()))?;
        let (tx, rx) = PublishQueue::channel(options.queue_depth);
        let depth = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(run_worker(
            BufWriter::new(file),
            rx,
            ack,
            Arc::clone(&depth),
        ));
        Ok(Self {
            queue: PublishQueue::new(FILE, tx, depth, options.publish_timeout, worker),
        })
    }
}

#[async_trait]
impl Producer for FileProducer {
    fn name(&self) -> &str {
        FILE
    }

    async fn publish(&self, record: &Record) -> Result<(), ProducerError> {
        self.queue.submit(record).await
    }

    async fn close(&self, deadline: Duration) -> Result<(), ProducerError> {
        self.queue.close(deadline).await
    }
}

async fn run_worker(
    mut writer: BufWriter<File>,
    mut rx: mpsc::Receiver<Record>,
    ack: ReliableAckHandle,
    depth: Arc<AtomicUsize>,
) {
    while let Some(record) = rx.recv().await {
        depth.fetch_sub(1, Ordering::AcqRel);
        match write_record(&mut writer, &record).await {
            Ok(()) => ack.signal(&record),
            Err(err) => report_error(FILE, "write", &err),
        }
    }
    if let Err(err) = writer.flush().await {
        report_error(FILE, "flush", &err);
    }
    if let Err(err) = writer.get_ref().sync_all().await {
        report_error(FILE, "sync", &err);
    }
}

async fn write_record(writer: &mut BufWriter<File>, record: &Record) -> Result<()> {
    let line = render_line(record);
    writer.write_all(line.to_string().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

fn render_line(record: &Record) -> serde_json::Value {
    // Payloads already decoded to JSON upstream are embedded as JSON;
    // anything else is base64.
    let payload = match serde_json::from_slice::<serde_json::Value>(&record.payload) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(BASE64.encode(&record.payload)),
    };
    serde_json::json!({
        "received_at_ms": epoch_millis(record),
        "device_id": record.identity.device_id(),
        "sender_id": record.identity.sender_id(),
        "type_tag": record.type_tag,
        "txid": record.txid_hex(),
        "schema_version": record.schema_version,
        "size_bytes": record.size_bytes,
        "payload": payload,
    })
}

fn epoch_millis(record: &Record) -> i64 {
    record
        .received_at
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fleetline_pipeline::{AckCoordinator, AckConfig, VehicleIdentity};
    use fleetline_wire::Envelope;

    fn record(payload: &'static [u8]) -> Record {
        let identity = VehicleIdentity::from_device_id("d1").expect("identity");
        let envelope = Envelope {
            txid: Bytes::from_static(b"\x2a"),
            sender_id: Bytes::copy_from_slice(identity.sender_id().as_bytes()),
            message_topic: Bytes::from_static(b"V"),
            payload: Bytes::from_static(payload),
        };
        Record::from_envelope(&envelope, &identity).expect("record")
    }

    #[tokio::test]
    async fn records_land_as_json_lines_and_signal_acks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.jsonl");
        let section = FileSection { path: path.clone() };
        let options = AdapterOptions {
            namespace: "test".to_string(),
            queue_depth: 16,
            publish_timeout: Duration::from_millis(100),
        };
        let config = AckConfig::default();
        let (ack_tx, mut ack_rx) = AckCoordinator::channel(&config);
        let ack = ReliableAckHandle::new(FILE, vec!["V".to_string()], ack_tx);

        let producer = FileProducer::open(&section, &options, ack).await.expect("open");
        producer.publish(&record(b"blob")).await.expect("publish");
        producer
            .close(Duration::from_secs(2))
            .await
            .expect("close");

        let contents = std::fs::read_to_string(&path).expect("read sink");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(value["device_id"], "d1");
        assert_eq!(value["type_tag"], "V");
        assert_eq!(value["txid"], "2a");
        assert_eq!(value["payload"], BASE64.encode(b"blob"));

        let signal = ack_rx.try_recv().expect("ack signal");
        assert_eq!(signal.backend, FILE);
        assert_eq!(signal.txid, Bytes::from_static(b"\x2a"));
    }

    #[tokio::test]
    async fn publishes_after_close_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let section = FileSection {
            path: dir.path().join("records.jsonl"),
        };
        let options = AdapterOptions {
            namespace: "test".to_string(),
            queue_depth: 16,
            publish_timeout: Duration::from_millis(100),
        };
        let producer = FileProducer::open(&section, &options, ReliableAckHandle::disabled(FILE))
            .await
            .expect("open");
        producer
            .close(Duration::from_secs(2))
            .await
            .expect("close");
        let err = producer
            .publish(&record(b"late"))
            .await
            .expect_err("closed");
        assert!(matches!(err, ProducerError::Closed { .. }));
    }
}
