// Vehicle identity extraction from the peer's client certificate. The TLS
// layer has already verified the chain against the fleet CA; this module
// only pulls the device id out of the leaf.
use fleetline_pipeline::VehicleIdentity;
use fleetline_transport::QuicConnection;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::config::IdentitySource;

/// Extract the handshake identity, or `None` when the peer certificate is
/// missing the configured field. Callers close the connection without a
/// peer-visible diagnostic.
pub fn extract_identity(
    connection: &QuicConnection,
    source: IdentitySource,
) -> Option<VehicleIdentity> {
    let certs = connection.peer_certificates()?;
    // The leaf (end-entity) certificate is first in the chain.
    let leaf = certs.first()?;
    let device_id = device_id_from_der(leaf.as_ref(), source)?;
    VehicleIdentity::from_device_id(&device_id).ok()
}

pub(crate) fn device_id_from_der(der: &[u8], source: IdentitySource) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|err| tracing::warn!(error = %err, "unparseable peer certificate"))
        .ok()?;
    match source {
        IdentitySource::CommonName => cert
            .subject()
            .iter_common_name()
            .next()?
            .as_str()
            .ok()
            .filter(|cn| !cn.is_empty())
            .map(str::to_string),
        IdentitySource::SanUri => {
            let san = cert.subject_alternative_name().ok().flatten()?;
            san.value.general_names.iter().find_map(|name| match name {
                // Device ids ride in the final path segment of the URI.
                GeneralName::URI(uri) => uri
                    .rsplit('/')
                    .next()
                    .filter(|segment| !segment.is_empty())
                    .map(str::to_string),
                _ => None,
            })
        }
    }
}
