// Payload schemas carried inside vehicle envelopes. The pipeline treats
// payloads as opaque bytes; these types exist for the optional decoded-JSON
// output and for the synthesized connectivity events.
//
// Field numbers are frozen: the vehicle firmware encodes these messages and
// existing downstream consumers decode them.
use prost::Message;
use serde::Serialize;

/// Schema version stamped on every record.
pub const SCHEMA_VERSION: u32 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown payload schema for type tag {0:?}")]
    UnknownTypeTag(String),
    #[error("payload decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("json render failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct Datum {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// High-volume telemetry snapshot, topic `V`.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleData {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(message, repeated, tag = "2")]
    pub data: Vec<Datum>,
    /// Unix epoch milliseconds at capture time.
    #[prost(int64, tag = "3")]
    pub created_at: i64,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct Alert {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub started_at: i64,
    #[prost(string, repeated, tag = "3")]
    pub audiences: Vec<String>,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleAlerts {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(message, repeated, tag = "2")]
    pub alerts: Vec<Alert>,
    #[prost(int64, tag = "3")]
    pub created_at: i64,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleError {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, string", tag = "2")]
    pub tags: std::collections::HashMap<String, String>,
    #[prost(string, tag = "3")]
    pub body: String,
    #[prost(int64, tag = "4")]
    pub created_at: i64,
}

#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleErrors {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(message, repeated, tag = "2")]
    pub errors: Vec<VehicleError>,
    #[prost(int64, tag = "3")]
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration, Serialize)]
#[repr(i32)]
pub enum ConnectivityStatus {
    Unknown = 0,
    Connected = 1,
    Disconnected = 2,
}

/// Connection lifecycle event. Synthesized server-side on every vehicle
/// connect and disconnect, never sent by the firmware itself.
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct VehicleConnectivity {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(string, tag = "2")]
    pub connection_id: String,
    #[prost(enumeration = "ConnectivityStatus", tag = "3")]
    pub status: i32,
    #[prost(int64, tag = "4")]
    pub created_at: i64,
    #[prost(string, tag = "5")]
    pub network_interface: String,
}

/// Decode a payload for its type tag and render it as JSON.
///
/// Only used when decoded-record output is enabled; the pipeline proper
/// never inspects payload bytes.
pub fn decode_to_json(type_tag: &str, payload: &[u8]) -> Result<serde_json::Value> {
    let value = match type_tag {
        "V" => serde_json::to_value(VehicleData::decode(payload)?)?,
        "alerts" => serde_json::to_value(VehicleAlerts::decode(payload)?)?,
        "errors" => serde_json::to_value(VehicleErrors::decode(payload)?)?,
        "connectivity" => serde_json::to_value(VehicleConnectivity::decode(payload)?)?,
        other => return Err(Error::UnknownTypeTag(other.to_string())),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vehicle_data_round_trip() {
        let message = VehicleData {
            vin: "5YJ3E1EA1NF123456".to_string(),
            data: vec![Datum {
                key: "Odometer".to_string(),
                value: "42".to_string(),
            }],
            created_at: 1_700_000_000_000,
        };
        let encoded = message.encode_to_vec();
        let decoded = VehicleData::decode(encoded.as_slice()).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn decode_to_json_renders_fields() {
        let message = VehicleAlerts {
            vin: "5YJ3E1EA1NF123456".to_string(),
            alerts: vec![Alert {
                name: "TirePressure".to_string(),
                started_at: 1_700_000_000_000,
                audiences: vec!["service".to_string()],
            }],
            created_at: 1_700_000_000_100,
        };
        let json = decode_to_json("alerts", &message.encode_to_vec()).expect("json");
        assert_eq!(json["vin"], "5YJ3E1EA1NF123456");
        assert_eq!(json["alerts"][0]["name"], "TirePressure");
    }

    #[test]
    fn decode_to_json_rejects_unknown_tag() {
        let err = decode_to_json("mystery", b"").expect_err("unknown tag");
        assert!(matches!(err, Error::UnknownTypeTag(_)));
    }

    #[test]
    fn connectivity_status_falls_back_to_unknown() {
        let mut event = VehicleConnectivity {
            vin: "v".to_string(),
            connection_id: "c".to_string(),
            status: ConnectivityStatus::Connected as i32,
            created_at: 0,
            network_interface: "quic".to_string(),
        };
        assert_eq!(event.status(), ConnectivityStatus::Connected);
        event.status = 99;
        assert_eq!(event.status(), ConnectivityStatus::Unknown);
    }
}
