// Reliable-ack coordination. Backend adapters signal durable acceptance
// through a `ReliableAckHandle`; a single coordinator task correlates the
// signal with the originating connection's in-flight table and enqueues the
// ack frame onto that connection's outbound queue.
//
// The coordinator decouples "backend committed" from every connection's
// read loop: adapters fire and forget, the read loop never waits on a
// backend, and a closed connection simply swallows its pending acks.
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::connection::AckEnqueueError;
use crate::record::{Origin, Record};
use crate::registry::ConnectionRegistry;
use crate::router::RouteTable;

/// Durable-acceptance signal from one backend for one record.
#[derive(Debug, Clone)]
pub struct AckSignal {
    pub device_id: String,
    pub txid: Bytes,
    pub type_tag: String,
    pub backend: String,
}

/// Handed to each backend adapter at construction. The adapter calls
/// `signal` from its delivery callback; only tags the backend is the
/// registered ack source for are forwarded.
#[derive(Clone)]
pub struct ReliableAckHandle {
    backend: String,
    ack_source_tags: Arc<HashSet<String>>,
    tx: mpsc::Sender<AckSignal>,
}

impl ReliableAckHandle {
    pub fn new(backend: &str, ack_source_tags: Vec<String>, tx: mpsc::Sender<AckSignal>) -> Self {
        Self {
            backend: backend.to_string(),
            ack_source_tags: Arc::new(ack_source_tags.into_iter().collect()),
            tx,
        }
    }

    /// A handle that forwards nothing, for backends that are nobody's ack
    /// source.
    pub fn disabled(backend: &str) -> Self {
        let (tx, _) = mpsc::channel(1);
        Self::new(backend, Vec::new(), tx)
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Forward a durable-acceptance signal for `record`, if its tag is one
    /// this backend acks. Never blocks the adapter's delivery path.
    pub fn signal(&self, record: &Record) {
        if record.origin != Origin::Vehicle || !self.ack_source_tags.contains(&record.type_tag) {
            return;
        }
        let signal = AckSignal {
            device_id: record.identity.device_id().to_string(),
            txid: record.txid.clone(),
            type_tag: record.type_tag.clone(),
            backend: self.backend.clone(),
        };
        if self.tx.try_send(signal).is_err() {
            metrics::counter!(
                "fleetline_acks_dropped_total",
                "reason" => "coordinator_backlog"
            )
            .increment(1);
            tracing::warn!(backend = %self.backend, "ack coordinator backlog, signal dropped");
        }
    }
}

#[derive(Debug, Clone)]
pub struct AckConfig {
    /// In-flight entries expire after this long without a backend signal.
    pub inflight_ttl: Duration,
    pub sweep_interval: Duration,
    /// Capacity of the signal channel shared by all adapters.
    pub channel_capacity: usize,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            inflight_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            channel_capacity: 4096,
        }
    }
}

pub struct AckCoordinator {
    registry: Arc<ConnectionRegistry>,
    routes: Arc<RouteTable>,
    rx: mpsc::Receiver<AckSignal>,
    config: AckConfig,
}

impl AckCoordinator {
    /// The signal channel adapters publish into. Created ahead of the
    /// coordinator so producer construction can precede the route table.
    pub fn channel(config: &AckConfig) -> (mpsc::Sender<AckSignal>, mpsc::Receiver<AckSignal>) {
        mpsc::channel(config.channel_capacity.max(1))
    }

    pub fn new(
        registry: Arc<ConnectionRegistry>,
        routes: Arc<RouteTable>,
        rx: mpsc::Receiver<AckSignal>,
        config: AckConfig,
    ) -> Self {
        Self {
            registry,
            routes,
            rx,
            config,
        }
    }

    /// Drive signals and expiry until shutdown flips or every sender is
    /// gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                signal = self.rx.recv() => {
                    match signal {
                        Some(signal) => self.handle_signal(signal),
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_expired();
                }
            }
        }
    }

    fn handle_signal(&self, signal: AckSignal) {
        let Some(conn) = self.registry.lookup(&signal.device_id) else {
            metrics::counter!(
                "fleetline_acks_dropped_total",
                "reason" => "connection_closed"
            )
            .increment(1);
            return;
        };
        let designated = self.routes.ack_source(&signal.type_tag) == Some(signal.backend.as_str());
        if !designated {
            // Not the designated source: bookkeeping only, no ack frame.
            conn.note_delivery(&signal.txid, &signal.type_tag, &signal.backend);
            return;
        }
        let Some(_entry) = conn.take_inflight(&signal.txid, &signal.type_tag) else {
            metrics::counter!(
                "fleetline_acks_dropped_total",
                "reason" => "orphan"
            )
            .increment(1);
            return;
        };
        let ack = fleetline_wire::Envelope::ack(
            signal.txid,
            Bytes::copy_from_slice(conn.identity().sender_id().as_bytes()),
            &signal.type_tag,
        );
        match conn.enqueue_ack(ack) {
            Ok(()) => {
                metrics::counter!(
                    "fleetline_acks_enqueued_total",
                    "record_type" => signal.type_tag.clone()
                )
                .increment(1);
            }
            Err(AckEnqueueError::Full) => {
                metrics::counter!(
                    "fleetline_acks_dropped_total",
                    "reason" => "queue_full"
                )
                .increment(1);
            }
            Err(AckEnqueueError::Closed) => {
                metrics::counter!(
                    "fleetline_acks_dropped_total",
                    "reason" => "connection_closed"
                )
                .increment(1);
            }
        }
    }

    fn sweep_expired(&self) {
        let ttl = self.config.inflight_ttl;
        let mut expired = 0;
        for conn in self.registry.handles() {
            expired += conn.expire_inflight(ttl);
        }
        if expired > 0 {
            metrics::counter!(
                "fleetline_acks_dropped_total",
                "reason" => "expired"
            )
            .increment(expired as u64);
            tracing::debug!(expired, "expired in-flight ack entries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::identity::VehicleIdentity;
    use crate::producer::Producer;
    use crate::test_support::{RecordingProducer, vehicle_record};
    use fleetline_wire::TOPIC_ACK;
    use std::collections::HashMap;

    fn routes(ack_backend: &str) -> Arc<RouteTable> {
        let a = RecordingProducer::new("a");
        let b = RecordingProducer::new("b");
        let mut producers: HashMap<String, Arc<dyn Producer>> = HashMap::new();
        producers.insert("a".into(), a as Arc<dyn Producer>);
        producers.insert("b".into(), b as Arc<dyn Producer>);
        let records = HashMap::from([("V".to_string(), vec!["a".to_string(), "b".to_string()])]);
        let acks = HashMap::from([("V".to_string(), ack_backend.to_string())]);
        Arc::new(RouteTable::build(&records, &acks, &producers).expect("table"))
    }

    fn coordinator(
        ack_backend: &str,
    ) -> (
        AckCoordinator,
        Arc<ConnectionRegistry>,
        Arc<ConnectionHandle>,
        tokio::sync::mpsc::Receiver<fleetline_wire::Envelope>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new());
        let identity = VehicleIdentity::from_device_id("d1").expect("identity");
        let (conn, ack_rx) =
            ConnectionHandle::new(identity, "127.0.0.1:4000".parse().unwrap(), 1, 8);
        conn.mark_open();
        registry.register(Arc::clone(&conn));
        let config = AckConfig::default();
        let (_tx, rx) = AckCoordinator::channel(&config);
        let coordinator =
            AckCoordinator::new(Arc::clone(&registry), routes(ack_backend), rx, config);
        (coordinator, registry, conn, ack_rx)
    }

    fn signal(backend: &str) -> AckSignal {
        AckSignal {
            device_id: "d1".to_string(),
            txid: Bytes::from_static(b"\x01"),
            type_tag: "V".to_string(),
            backend: backend.to_string(),
        }
    }

    #[tokio::test]
    async fn designated_signal_enqueues_exactly_one_ack() {
        let (coordinator, _registry, conn, mut ack_rx) = coordinator("a");
        let record = vehicle_record("d1", "V", b"\x01");
        conn.track_inflight(&record);

        coordinator.handle_signal(signal("a"));
        let ack = ack_rx.try_recv().expect("ack frame");
        assert_eq!(ack.topic_str(), Some(TOPIC_ACK));
        assert_eq!(ack.txid, record.txid);
        assert_eq!(ack.payload.as_ref(), b"V");

        // The second backend's acceptance must not produce another ack.
        coordinator.handle_signal(signal("b"));
        assert!(ack_rx.try_recv().is_err());
        assert_eq!(conn.inflight_len(), 0);
    }

    #[tokio::test]
    async fn non_designated_signal_only_records_delivery() {
        let (coordinator, _registry, conn, mut ack_rx) = coordinator("a");
        let record = vehicle_record("d1", "V", b"\x01");
        conn.track_inflight(&record);

        coordinator.handle_signal(signal("b"));
        assert!(ack_rx.try_recv().is_err());
        let entry = conn.take_inflight(&record.txid, "V").expect("entry");
        assert_eq!(entry.delivered, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn orphan_signal_is_dropped() {
        let (coordinator, _registry, _conn, mut ack_rx) = coordinator("a");
        // No in-flight entry was ever tracked for this txid.
        coordinator.handle_signal(signal("a"));
        assert!(ack_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn signal_for_unknown_connection_is_dropped() {
        let (coordinator, registry, conn, mut ack_rx) = coordinator("a");
        let record = vehicle_record("d1", "V", b"\x01");
        conn.track_inflight(&record);
        registry.unregister(&conn);

        coordinator.handle_signal(signal("a"));
        assert!(ack_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handle_filters_by_origin_and_tag() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ReliableAckHandle::new("a", vec!["V".to_string()], tx);

        handle.signal(&vehicle_record("d1", "alerts", b"\x01"));
        assert!(rx.try_recv().is_err());

        let identity = VehicleIdentity::from_device_id("d1").expect("identity");
        let synthetic = crate::record::Record::connectivity(
            &identity,
            "c1",
            fleetline_proto::ConnectivityStatus::Connected,
            "quic",
        );
        handle.signal(&synthetic);
        assert!(rx.try_recv().is_err());

        handle.signal(&vehicle_record("d1", "V", b"\x02"));
        let forwarded = rx.try_recv().expect("signal");
        assert_eq!(forwarded.backend, "a");
        assert_eq!(forwarded.type_tag, "V");
    }

    #[tokio::test]
    async fn sweep_expires_stale_entries() {
        let registry = Arc::new(ConnectionRegistry::new());
        let identity = VehicleIdentity::from_device_id("d1").expect("identity");
        let (conn, _ack_rx) =
            ConnectionHandle::new(identity, "127.0.0.1:4000".parse().unwrap(), 1, 8);
        conn.mark_open();
        registry.register(Arc::clone(&conn));
        let config = AckConfig {
            inflight_ttl: Duration::from_nanos(0),
            ..AckConfig::default()
        };
        let (_tx, rx) = AckCoordinator::channel(&config);
        let coordinator = AckCoordinator::new(Arc::clone(&registry), routes("a"), rx, config);

        conn.track_inflight(&vehicle_record("d1", "V", b"\x01"));
        coordinator.sweep_expired();
        assert_eq!(conn.inflight_len(), 0);
    }
}
