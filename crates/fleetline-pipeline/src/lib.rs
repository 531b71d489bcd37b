// The ingestion pipeline: everything between a decoded envelope and the
// configured downstream producers. Transport and backend clients live in
// their own crates; this one owns identity, routing, rate limiting, the
// connection registry, and reliable-ack coordination.
pub mod ack;
pub mod connection;
pub mod identity;
pub mod limiter;
pub mod producer;
pub mod record;
pub mod registry;
pub mod router;

#[cfg(test)]
pub(crate) mod test_support;

pub use ack::{AckConfig, AckCoordinator, AckSignal, ReliableAckHandle};
pub use connection::{AckEnqueueError, ConnState, ConnectionHandle};
pub use identity::{IdentityError, SENDER_ID_PREFIX, VehicleIdentity};
pub use limiter::{RateLimitConfig, RateLimiter};
pub use producer::{Producer, ProducerError, report_error};
pub use record::{Origin, Record, RecordError};
pub use registry::ConnectionRegistry;
pub use router::{RouteTable, RouterError};
