// Per-connection state shared between the read loop, the writer loop, and
// the ack coordinator. The handle is the only cross-task view of a live
// connection; the transport streams themselves stay owned by the
// connection's own tasks.
use bytes::Bytes;
use fleetline_wire::Envelope;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};

use crate::identity::VehicleIdentity;
use crate::record::{Origin, Record, epoch_millis};

/// Connection lifecycle. Transitions only move forward; `Closed` is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Handshaking,
    Open,
    Draining,
    Closed,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AckEnqueueError {
    #[error("ack queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug)]
pub struct InflightEntry {
    pub enqueued_at: Instant,
    /// Backends that reported durable acceptance so far. Only the
    /// designated ack source triggers the ack frame.
    pub delivered: Vec<String>,
}

type InflightKey = (Bytes, String);

pub struct ConnectionHandle {
    identity: VehicleIdentity,
    remote_addr: SocketAddr,
    id: u64,
    opened_at: Instant,
    state_tx: watch::Sender<ConnState>,
    ack_tx: mpsc::Sender<Envelope>,
    ack_depth: AtomicUsize,
    inflight: Mutex<HashMap<InflightKey, InflightEntry>>,
    last_rx_ms: AtomicU64,
    last_tx_ms: AtomicU64,
}

impl ConnectionHandle {
    /// Build a handle plus the receiving half of its bounded ack queue.
    /// The caller hands the receiver to the connection's writer loop.
    pub fn new(
        identity: VehicleIdentity,
        remote_addr: SocketAddr,
        id: u64,
        ack_queue_capacity: usize,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<Envelope>) {
        let (ack_tx, ack_rx) = mpsc::channel(ack_queue_capacity.max(1));
        let (state_tx, _) = watch::channel(ConnState::Handshaking);
        let handle = std::sync::Arc::new(Self {
            identity,
            remote_addr,
            id,
            opened_at: Instant::now(),
            state_tx,
            ack_tx,
            ack_depth: AtomicUsize::new(0),
            inflight: Mutex::new(HashMap::new()),
            last_rx_ms: AtomicU64::new(0),
            last_tx_ms: AtomicU64::new(0),
        });
        (handle, ack_rx)
    }

    pub fn identity(&self) -> &VehicleIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    /// Watch for lifecycle transitions; the read loop uses this to stop
    /// pulling frames once the connection starts draining.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    pub fn mark_open(&self) {
        self.advance(ConnState::Open);
    }

    /// Refuse new reads, keep flushing queued acks.
    pub fn begin_drain(&self) {
        self.advance(ConnState::Draining);
    }

    pub fn mark_closed(&self) {
        self.advance(ConnState::Closed);
    }

    // States only move forward so a late drain request cannot resurrect a
    // closed connection.
    fn advance(&self, next: ConnState) {
        self.state_tx.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    pub fn note_rx(&self) {
        self.last_rx_ms
            .store(epoch_millis(SystemTime::now()) as u64, Ordering::Relaxed);
    }

    pub fn note_tx(&self) {
        self.last_tx_ms
            .store(epoch_millis(SystemTime::now()) as u64, Ordering::Relaxed);
    }

    /// Register an ack-eligible record in the in-flight table. Synthetic
    /// records are never tracked.
    pub fn track_inflight(&self, record: &Record) {
        if record.origin != Origin::Vehicle {
            return;
        }
        let mut inflight = self.inflight.lock().expect("inflight lock");
        inflight.insert(
            (record.txid.clone(), record.type_tag.clone()),
            InflightEntry {
                enqueued_at: record.received_at_mono,
                delivered: Vec::new(),
            },
        );
    }

    /// Remove and return the in-flight entry for an ack-ready record.
    pub fn take_inflight(&self, txid: &Bytes, type_tag: &str) -> Option<InflightEntry> {
        let mut inflight = self.inflight.lock().expect("inflight lock");
        inflight.remove(&(txid.clone(), type_tag.to_string()))
    }

    /// Note a non-designated backend's delivery. Returns false when the
    /// entry is unknown (already acked or expired).
    pub fn note_delivery(&self, txid: &Bytes, type_tag: &str, backend: &str) -> bool {
        let mut inflight = self.inflight.lock().expect("inflight lock");
        match inflight.get_mut(&(txid.clone(), type_tag.to_string())) {
            Some(entry) => {
                if !entry.delivered.iter().any(|b| b == backend) {
                    entry.delivered.push(backend.to_string());
                }
                true
            }
            None => false,
        }
    }

    /// Drop in-flight entries older than `ttl`, returning how many expired.
    pub fn expire_inflight(&self, ttl: Duration) -> usize {
        let mut inflight = self.inflight.lock().expect("inflight lock");
        let before = inflight.len();
        inflight.retain(|_, entry| entry.enqueued_at.elapsed() < ttl);
        before - inflight.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().expect("inflight lock").len()
    }

    /// Enqueue an ack frame for the writer loop. Never blocks: a full
    /// queue is an error the caller counts and drops.
    pub fn enqueue_ack(&self, envelope: Envelope) -> Result<(), AckEnqueueError> {
        if self.state() == ConnState::Closed {
            return Err(AckEnqueueError::Closed);
        }
        match self.ack_tx.try_send(envelope) {
            Ok(()) => {
                self.ack_depth.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(AckEnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AckEnqueueError::Closed),
        }
    }

    /// Writer loop bookkeeping: one queued ack has been written out.
    pub fn ack_written(&self) {
        self.ack_depth.fetch_sub(1, Ordering::AcqRel);
        self.note_tx();
    }

    pub fn ack_depth(&self) -> usize {
        self.ack_depth.load(Ordering::Acquire)
    }

    /// True once every queued ack has been flushed and nothing is pending
    /// a backend confirmation. Drain logic polls this against a deadline.
    pub fn drained(&self) -> bool {
        self.ack_depth() == 0 && self.inflight_len() == 0
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("device_id", &self.identity.device_id())
            .field("remote_addr", &self.remote_addr)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
