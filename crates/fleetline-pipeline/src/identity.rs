// Vehicle identity as extracted from the transport handshake.
use std::fmt;

/// Prefix carried by every envelope-level sender id.
pub const SENDER_ID_PREFIX: &str = "vehicle_device.";

pub type Result<T> = std::result::Result<T, IdentityError>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("empty device id")]
    EmptyDeviceId,
    #[error("malformed sender id {0:?}")]
    MalformedSenderId(String),
}

/// The `(device_id, sender_id)` pair naming one vehicle.
///
/// Immutable for the life of a connection; any envelope whose sender id
/// disagrees with the handshake identity terminates the connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VehicleIdentity {
    device_id: String,
    sender_id: String,
}

impl VehicleIdentity {
    /// Build from a device id extracted out of the peer certificate.
    pub fn from_device_id(device_id: &str) -> Result<Self> {
        if device_id.is_empty() {
            return Err(IdentityError::EmptyDeviceId);
        }
        Ok(Self {
            device_id: device_id.to_string(),
            sender_id: format!("{SENDER_ID_PREFIX}{device_id}"),
        })
    }

    /// Parse a prefixed envelope-level sender id.
    pub fn parse_sender_id(sender_id: &str) -> Result<Self> {
        let device_id = sender_id
            .strip_prefix(SENDER_ID_PREFIX)
            .ok_or_else(|| IdentityError::MalformedSenderId(sender_id.to_string()))?;
        if device_id.is_empty() {
            return Err(IdentityError::MalformedSenderId(sender_id.to_string()));
        }
        Self::from_device_id(device_id)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }
}

impl fmt::Display for VehicleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sender_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_device_id_builds_prefixed_sender() {
        let identity = VehicleIdentity::from_device_id("5YJ3E1EA1NF123456").expect("identity");
        assert_eq!(identity.device_id(), "5YJ3E1EA1NF123456");
        assert_eq!(identity.sender_id(), "vehicle_device.5YJ3E1EA1NF123456");
    }

    #[test]
    fn empty_device_id_is_rejected() {
        assert_eq!(
            VehicleIdentity::from_device_id(""),
            Err(IdentityError::EmptyDeviceId)
        );
    }

    #[test]
    fn parse_sender_id_round_trips() {
        let identity = VehicleIdentity::parse_sender_id("vehicle_device.d1").expect("identity");
        assert_eq!(identity.device_id(), "d1");
    }

    #[test]
    fn parse_sender_id_rejects_foreign_prefix() {
        assert!(matches!(
            VehicleIdentity::parse_sender_id("app.d1"),
            Err(IdentityError::MalformedSenderId(_))
        ));
        assert!(matches!(
            VehicleIdentity::parse_sender_id("vehicle_device."),
            Err(IdentityError::MalformedSenderId(_))
        ));
    }
}
