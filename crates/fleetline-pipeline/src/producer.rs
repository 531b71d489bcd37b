// The uniform contract every downstream backend adapter implements. The
// pipeline only ever sees this trait; backend clients, reconnect policy,
// and internal queueing live behind it.
use async_trait::async_trait;
use std::time::Duration;

use crate::record::Record;

pub type Result<T> = std::result::Result<T, ProducerError>;

#[derive(thiserror::Error, Debug)]
pub enum ProducerError {
    /// The adapter's bounded queue is full; the record was not accepted.
    #[error("{backend}: publish queue full")]
    QueueFull { backend: String },
    /// The publish hand-off did not complete within the configured bound.
    #[error("{backend}: publish timed out")]
    Timeout { backend: String },
    /// The producer has been closed; no further publishes are accepted.
    #[error("{backend}: producer closed")]
    Closed { backend: String },
    #[error("{backend}: {source}")]
    Backend {
        backend: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ProducerError {
    pub fn backend(&self) -> &str {
        match self {
            Self::QueueFull { backend }
            | Self::Timeout { backend }
            | Self::Closed { backend }
            | Self::Backend { backend, .. } => backend,
        }
    }
}

/// A single downstream backend.
///
/// `publish` has submit semantics: the router hands the record off and
/// moves on. Delivery confirmation, when the backend supports it, flows
/// back through the adapter's `ReliableAckHandle` instead of the return
/// value. Implementations must keep `publish` within the configured bound
/// (backpressure belongs in their own bounded queues) and must not accept
/// records after `close` has returned.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Stable backend name used in config maps and metric labels.
    fn name(&self) -> &str;

    async fn publish(&self, record: &Record) -> Result<()>;

    /// Drain internal queues within `deadline`. Records still unconfirmed
    /// at the deadline must be surfaced through `report_error`, never
    /// dropped silently.
    async fn close(&self, deadline: Duration) -> Result<()>;
}

/// Uniform error reporting hook for backend adapters.
pub fn report_error(backend: &str, context: &str, err: &dyn std::fmt::Display) {
    tracing::error!(backend, context, error = %err, "producer error");
    metrics::counter!(
        "fleetline_producer_errors_total",
        "backend" => backend.to_string(),
        "context" => context.to_string()
    )
    .increment(1);
}
