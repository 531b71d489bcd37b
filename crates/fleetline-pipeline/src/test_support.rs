// Shared test doubles for pipeline unit tests.
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::identity::VehicleIdentity;
use crate::producer::{Producer, ProducerError, Result};
use crate::record::Record;

/// Producer double that records everything it is given, optionally failing
/// every publish.
pub struct RecordingProducer {
    name: String,
    fail: bool,
    seen: Mutex<Vec<Record>>,
    closed: Mutex<bool>,
}

impl RecordingProducer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            seen: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            seen: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        })
    }

    pub fn seen_txids(&self) -> Vec<Bytes> {
        self.seen
            .lock()
            .expect("seen lock")
            .iter()
            .map(|record| record.txid.clone())
            .collect()
    }

    pub fn seen_tags(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("seen lock")
            .iter()
            .map(|record| record.type_tag.clone())
            .collect()
    }
}

#[async_trait]
impl Producer for RecordingProducer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, record: &Record) -> Result<()> {
        if *self.closed.lock().expect("closed lock") {
            return Err(ProducerError::Closed {
                backend: self.name.clone(),
            });
        }
        if self.fail {
            return Err(ProducerError::Backend {
                backend: self.name.clone(),
                source: anyhow::anyhow!("simulated backend failure"),
            });
        }
        self.seen.lock().expect("seen lock").push(record.clone());
        Ok(())
    }

    async fn close(&self, _deadline: Duration) -> Result<()> {
        *self.closed.lock().expect("closed lock") = true;
        Ok(())
    }
}

/// A vehicle-origin record with the given txid, ready for routing.
pub fn vehicle_record(device_id: &str, type_tag: &str, txid: &[u8]) -> Record {
    let identity = VehicleIdentity::from_device_id(device_id).expect("identity");
    let envelope = fleetline_wire::Envelope {
        txid: Bytes::copy_from_slice(txid),
        sender_id: Bytes::copy_from_slice(identity.sender_id().as_bytes()),
        message_topic: Bytes::copy_from_slice(type_tag.as_bytes()),
        payload: Bytes::from_static(b"payload"),
    };
    Record::from_envelope(&envelope, &identity).expect("record")
}
