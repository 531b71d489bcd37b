// Fleet telemetry ingestion service. Vehicles hold one mutually
// authenticated QUIC connection each and stream framed records; the
// pipeline validates, rate-limits, fans out to the configured backends,
// and returns acks for records a designated backend has durably accepted.
pub mod config;
pub mod observability;
pub mod producers;
pub mod server;
pub mod tls;
pub mod transport;
