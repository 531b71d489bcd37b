// Envelope framing shared with the vehicle firmware. The byte layout is
// frozen: a u32 big-endian frame length followed by four length-prefixed
// fields (txid, sender id, message topic, payload) in that order.
use bytes::{Buf, Bytes, BytesMut};

/// High-volume vehicle telemetry tag.
pub const TOPIC_VEHICLE_DATA: &str = "V";
pub const TOPIC_ALERTS: &str = "alerts";
pub const TOPIC_ERRORS: &str = "errors";
pub const TOPIC_CONNECTIVITY: &str = "connectivity";
/// Reserved topic for server-to-vehicle acknowledgement frames.
pub const TOPIC_ACK: &str = "ack";

/// Outer frame length prefix, bytes.
pub const LEN_PREFIX: usize = 4;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("frame of {0} bytes exceeds the configured maximum")]
    FrameTooLarge(usize),
    #[error("incomplete frame")]
    Incomplete,
    #[error("field length {field_len} overruns remaining body of {remaining} bytes")]
    FieldOverrun { field_len: usize, remaining: usize },
    #[error("{0} trailing bytes after final field")]
    TrailingBytes(usize),
}

/// Name a record topic is published under on downstream backends.
///
/// `V` maps to `data`; every other tag is used verbatim. Existing fleet
/// subscribers depend on this mapping, so it must never change.
pub fn wire_topic_name(type_tag: &str) -> &str {
    if type_tag == TOPIC_VEHICLE_DATA {
        "data"
    } else {
        type_tag
    }
}

/// One framed message, in either direction.
///
/// ```
/// use bytes::Bytes;
/// use fleetline_wire::Envelope;
///
/// let envelope = Envelope {
///     txid: Bytes::from_static(b"\x01"),
///     sender_id: Bytes::from_static(b"vehicle_device.d1"),
///     message_topic: Bytes::from_static(b"V"),
///     payload: Bytes::from_static(b"blob"),
/// };
/// let decoded = Envelope::decode(envelope.encode()).expect("decode");
/// assert_eq!(decoded, envelope);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub txid: Bytes,
    pub sender_id: Bytes,
    pub message_topic: Bytes,
    pub payload: Bytes,
}

impl Envelope {
    /// Acknowledgement frame for a received record. Carries the record's
    /// txid and its type tag as the payload, under the reserved ack topic.
    pub fn ack(txid: Bytes, sender_id: Bytes, type_tag: &str) -> Self {
        Self {
            txid,
            sender_id,
            message_topic: Bytes::from_static(TOPIC_ACK.as_bytes()),
            payload: Bytes::copy_from_slice(type_tag.as_bytes()),
        }
    }

    /// Message topic as UTF-8, if it is valid UTF-8.
    pub fn topic_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.message_topic).ok()
    }

    /// Encoded size of the body, excluding the outer length prefix.
    pub fn body_len(&self) -> usize {
        4 * LEN_PREFIX
            + self.txid.len()
            + self.sender_id.len()
            + self.message_topic.len()
            + self.payload.len()
    }

    /// Encode the full frame including the outer length prefix.
    pub fn encode(&self) -> Bytes {
        let body_len = self.body_len();
        let mut buf = BytesMut::with_capacity(LEN_PREFIX + body_len);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        for field in [
            &self.txid,
            &self.sender_id,
            &self.message_topic,
            &self.payload,
        ] {
            buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
            buf.extend_from_slice(field);
        }
        buf.freeze()
    }

    /// Decode a full frame (outer length prefix included).
    pub fn decode(mut input: Bytes) -> Result<Self> {
        if input.len() < LEN_PREFIX {
            return Err(Error::Incomplete);
        }
        let body_len = input.get_u32() as usize;
        if input.len() < body_len {
            return Err(Error::Incomplete);
        }
        Self::decode_body(input.slice(0..body_len))
    }

    /// Decode a frame body (outer length prefix already consumed).
    pub fn decode_body(mut body: Bytes) -> Result<Self> {
        let txid = take_field(&mut body)?;
        let sender_id = take_field(&mut body)?;
        let message_topic = take_field(&mut body)?;
        let payload = take_field(&mut body)?;
        if !body.is_empty() {
            return Err(Error::TrailingBytes(body.len()));
        }
        Ok(Self {
            txid,
            sender_id,
            message_topic,
            payload,
        })
    }
}

fn take_field(body: &mut Bytes) -> Result<Bytes> {
    if body.len() < LEN_PREFIX {
        return Err(Error::Incomplete);
    }
    let len = body.get_u32() as usize;
    if body.len() < len {
        return Err(Error::FieldOverrun {
            field_len: len,
            remaining: body.len(),
        });
    }
    Ok(body.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            txid: Bytes::from_static(b"\x00\x01"),
            sender_id: Bytes::from_static(b"vehicle_device.d1"),
            message_topic: Bytes::from_static(b"V"),
            payload: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn round_trip() {
        let envelope = sample();
        let decoded = Envelope::decode(envelope.encode()).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn ack_frame_carries_txid_and_tag() {
        let ack = Envelope::ack(
            Bytes::from_static(b"\x00\x01"),
            Bytes::from_static(b"vehicle_device.d1"),
            TOPIC_VEHICLE_DATA,
        );
        assert_eq!(ack.topic_str(), Some(TOPIC_ACK));
        assert_eq!(ack.txid, Bytes::from_static(b"\x00\x01"));
        assert_eq!(ack.payload, Bytes::from_static(b"V"));
    }

    #[test]
    fn wire_topic_substitutes_data_for_vehicle_telemetry() {
        assert_eq!(wire_topic_name(TOPIC_VEHICLE_DATA), "data");
        assert_eq!(wire_topic_name(TOPIC_ALERTS), "alerts");
        assert_eq!(wire_topic_name("custom"), "custom");
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let mut encoded = BytesMut::from(&sample().encode()[..]);
        encoded.truncate(encoded.len() - 3);
        let err = Envelope::decode(encoded.freeze()).expect_err("truncated");
        assert_eq!(err, Error::Incomplete);
    }

    #[test]
    fn decode_rejects_field_overrun() {
        // Body declares a txid longer than the remaining bytes.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(b"shrt");
        let err = Envelope::decode(buf.freeze()).expect_err("overrun");
        assert_eq!(
            err,
            Error::FieldOverrun {
                field_len: 100,
                remaining: 4
            }
        );
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let envelope = sample();
        let body_len = envelope.body_len() + 2;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        let encoded = envelope.encode();
        buf.extend_from_slice(&encoded[LEN_PREFIX..]);
        buf.extend_from_slice(b"xx");
        let err = Envelope::decode(buf.freeze()).expect_err("trailing");
        assert_eq!(err, Error::TrailingBytes(2));
    }

    #[test]
    fn empty_fields_are_legal() {
        let envelope = Envelope {
            txid: Bytes::new(),
            sender_id: Bytes::new(),
            message_topic: Bytes::new(),
            payload: Bytes::new(),
        };
        let decoded = Envelope::decode(envelope.encode()).expect("decode");
        assert_eq!(decoded, envelope);
    }
}
