// The in-memory unit of work flowing from a connection's read loop to the
// configured producers.
use bytes::Bytes;
use fleetline_proto::{ConnectivityStatus, SCHEMA_VERSION, VehicleConnectivity};
use fleetline_wire::Envelope;
use prost::Message;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::identity::VehicleIdentity;

pub type Result<T> = std::result::Result<T, RecordError>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("envelope sender {envelope:?} does not match connection identity {connection}")]
    IdentityMismatch {
        envelope: String,
        connection: String,
    },
    #[error("message topic is not valid UTF-8")]
    TopicNotUtf8,
    #[error("empty message topic")]
    EmptyTopic,
}

/// Where a record came from. Synthetic records (connectivity events) take
/// the same routing path as vehicle records but never enter the ack path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Vehicle,
    Synthetic,
}

#[derive(Clone, Debug)]
pub struct Record {
    pub origin: Origin,
    /// Opaque correlation id, unique within the originating connection.
    pub txid: Bytes,
    pub type_tag: String,
    pub identity: VehicleIdentity,
    /// Monotonic receive stamp, used for in-flight expiry.
    pub received_at_mono: Instant,
    /// Wall-clock receive stamp, used for downstream metadata.
    pub received_at: SystemTime,
    pub schema_version: u32,
    pub payload: Bytes,
    pub size_bytes: usize,
}

impl Record {
    /// Build a record from a decoded envelope, validating the envelope
    /// identity against the handshake identity and stamping metadata.
    pub fn from_envelope(envelope: &Envelope, identity: &VehicleIdentity) -> Result<Self> {
        if envelope.sender_id.as_ref() != identity.sender_id().as_bytes() {
            return Err(RecordError::IdentityMismatch {
                envelope: String::from_utf8_lossy(&envelope.sender_id).into_owned(),
                connection: identity.sender_id().to_string(),
            });
        }
        let type_tag = envelope
            .topic_str()
            .ok_or(RecordError::TopicNotUtf8)?
            .to_string();
        if type_tag.is_empty() {
            return Err(RecordError::EmptyTopic);
        }
        Ok(Self {
            origin: Origin::Vehicle,
            txid: envelope.txid.clone(),
            type_tag,
            identity: identity.clone(),
            received_at_mono: Instant::now(),
            received_at: SystemTime::now(),
            schema_version: SCHEMA_VERSION,
            size_bytes: envelope.payload.len(),
            payload: envelope.payload.clone(),
        })
    }

    /// Synthesize a connectivity event for a connection open or close.
    pub fn connectivity(
        identity: &VehicleIdentity,
        connection_id: &str,
        status: ConnectivityStatus,
        network_interface: &str,
    ) -> Self {
        let created_at = epoch_millis(SystemTime::now());
        let event = VehicleConnectivity {
            vin: identity.device_id().to_string(),
            connection_id: connection_id.to_string(),
            status: status as i32,
            created_at,
            network_interface: network_interface.to_string(),
        };
        let payload = Bytes::from(event.encode_to_vec());
        Self {
            origin: Origin::Synthetic,
            txid: Bytes::new(),
            type_tag: fleetline_wire::TOPIC_CONNECTIVITY.to_string(),
            identity: identity.clone(),
            received_at_mono: Instant::now(),
            received_at: SystemTime::now(),
            schema_version: SCHEMA_VERSION,
            size_bytes: payload.len(),
            payload,
        }
    }

    /// Replace the payload with its decoded JSON rendering. Returns false
    /// and leaves the raw payload in place when decoding fails; decoded
    /// output is a convenience, not a contract.
    pub fn decode_payload_to_json(&mut self) -> bool {
        match fleetline_proto::decode_to_json(&self.type_tag, &self.payload) {
            Ok(value) => {
                let rendered = value.to_string();
                self.size_bytes = rendered.len();
                self.payload = Bytes::from(rendered);
                true
            }
            Err(err) => {
                tracing::debug!(
                    type_tag = %self.type_tag,
                    error = %err,
                    "payload decode failed, forwarding raw bytes"
                );
                metrics::counter!(
                    "fleetline_records_decode_fallback_total",
                    "record_type" => self.type_tag.clone()
                )
                .increment(1);
                false
            }
        }
    }

    /// Acknowledgement envelope for this record.
    pub fn ack_envelope(&self) -> Envelope {
        Envelope::ack(
            self.txid.clone(),
            Bytes::copy_from_slice(self.identity.sender_id().as_bytes()),
            &self.type_tag,
        )
    }

    /// Hex rendering of the txid for logging.
    pub fn txid_hex(&self) -> String {
        self.txid.iter().map(|b| format!("{b:02x}")).collect()
    }
}

pub(crate) fn epoch_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetline_wire::TOPIC_VEHICLE_DATA;

    fn identity() -> VehicleIdentity {
        VehicleIdentity::from_device_id("d1").expect("identity")
    }

    fn envelope(sender: &str) -> Envelope {
        Envelope {
            txid: Bytes::from_static(b"\x01"),
            sender_id: Bytes::copy_from_slice(sender.as_bytes()),
            message_topic: Bytes::from_static(b"V"),
            payload: Bytes::from_static(b"blob"),
        }
    }

    #[test]
    fn from_envelope_stamps_metadata() {
        let record =
            Record::from_envelope(&envelope("vehicle_device.d1"), &identity()).expect("record");
        assert_eq!(record.origin, Origin::Vehicle);
        assert_eq!(record.type_tag, TOPIC_VEHICLE_DATA);
        assert_eq!(record.size_bytes, 4);
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert_eq!(record.txid_hex(), "01");
    }

    #[test]
    fn from_envelope_rejects_identity_mismatch() {
        let err = Record::from_envelope(&envelope("vehicle_device.d2"), &identity())
            .expect_err("mismatch");
        assert!(matches!(err, RecordError::IdentityMismatch { .. }));
    }

    #[test]
    fn from_envelope_rejects_empty_topic() {
        let mut env = envelope("vehicle_device.d1");
        env.message_topic = Bytes::new();
        let err = Record::from_envelope(&env, &identity()).expect_err("empty topic");
        assert_eq!(err, RecordError::EmptyTopic);
    }

    #[test]
    fn connectivity_event_is_synthetic_and_decodable() {
        let record = Record::connectivity(
            &identity(),
            "conn-7",
            ConnectivityStatus::Connected,
            "quic",
        );
        assert_eq!(record.origin, Origin::Synthetic);
        assert!(record.txid.is_empty());
        let event = VehicleConnectivity::decode(record.payload.as_ref()).expect("decode");
        assert_eq!(event.vin, "d1");
        assert_eq!(event.status(), ConnectivityStatus::Connected);
        assert_eq!(event.network_interface, "quic");
    }

    #[test]
    fn decode_payload_to_json_replaces_payload() {
        let mut record = Record::connectivity(
            &identity(),
            "conn-7",
            ConnectivityStatus::Disconnected,
            "quic",
        );
        assert!(record.decode_payload_to_json());
        let value: serde_json::Value = serde_json::from_slice(&record.payload).expect("json");
        assert_eq!(value["vin"], "d1");
        assert_eq!(record.size_bytes, record.payload.len());
    }

    #[test]
    fn decode_payload_to_json_falls_back_on_garbage() {
        let mut record =
            Record::from_envelope(&envelope("vehicle_device.d1"), &identity()).expect("record");
        assert!(!record.decode_payload_to_json());
        assert_eq!(record.payload, Bytes::from_static(b"blob"));
    }
}
