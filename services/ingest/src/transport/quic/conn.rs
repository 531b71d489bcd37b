// Per-connection lifecycle: identity handshake, registry registration,
// the envelope read loop, and the drain/close sequence.
//
// Three tasks cooperate per connection:
//   - this handler runs the read loop (envelope -> record -> router);
//   - a writer task drains the bounded ack queue (writer.rs);
//   - the process-wide ack coordinator feeds that queue.
// Cancellation is cooperative through the connection state watch plus a
// local cancel flag shared with the writer.
use bytes::BytesMut;
use fleetline_pipeline::{ConnState, ConnectionHandle, Record, RecordError};
use fleetline_proto::ConnectivityStatus;
use fleetline_transport::QuicConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::server::ServerState;

use super::handshake;
use super::source::EnvelopeSource;
use super::writer::run_writer_loop;

const NETWORK_INTERFACE: &str = "quic";

#[derive(Debug, PartialEq, Eq)]
pub(super) enum ReadOutcome {
    /// The vehicle finished its stream cleanly.
    PeerClosed,
    /// Replacement or local teardown flipped the connection state.
    Draining,
    /// Process shutdown.
    Shutdown,
    /// Transport error or malformed envelope.
    EnvelopeError,
    /// Envelope identity disagreed with the handshake identity.
    IdentityMismatch,
}

pub(crate) async fn handle_connection(state: Arc<ServerState>, connection: QuicConnection) {
    let Some(identity) =
        handshake::extract_identity(&connection, state.config.tls.identity_source)
    else {
        metrics::counter!(
            "fleetline_connections_total",
            "result" => "identity_missing"
        )
        .increment(1);
        tracing::warn!(
            remote_addr = %connection.remote_addr(),
            "no extractable identity in peer certificate"
        );
        // No diagnostic to the peer.
        connection.close(b"");
        return;
    };

    let (handle, ack_rx) = ConnectionHandle::new(
        identity.clone(),
        connection.remote_addr(),
        connection.id().0,
        state.config.connection.ack_queue_capacity,
    );
    if let Some(displaced) = state.registry.register(Arc::clone(&handle)) {
        metrics::counter!(
            "fleetline_connections_total",
            "result" => "replaced"
        )
        .increment(1);
        tracing::info!(
            device_id = %displaced.device_id(),
            "existing connection displaced by newer handshake"
        );
        displaced.begin_drain();
    }

    // The vehicle opens the single duplex stream once its side is up.
    let (send, recv) = match connection.accept_bi().await {
        Ok(streams) => streams,
        Err(err) => {
            tracing::info!(
                device_id = %identity.device_id(),
                error = %err,
                "connection closed before stream open"
            );
            handle.mark_closed();
            state.registry.unregister(&handle);
            return;
        }
    };

    handle.mark_open();
    metrics::counter!(
        "fleetline_connections_total",
        "result" => "accepted"
    )
    .increment(1);
    tracing::info!(
        device_id = %identity.device_id(),
        remote_addr = %connection.remote_addr(),
        "vehicle connection open"
    );

    // Synthesized connectivity events ride the normal routing path but
    // never the ack path.
    let connection_id = Uuid::new_v4().to_string();
    state
        .routes
        .dispatch(&Record::connectivity(
            &identity,
            &connection_id,
            ConnectivityStatus::Connected,
            NETWORK_INTERFACE,
        ))
        .await;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let writer = tokio::spawn(run_writer_loop(
        send,
        ack_rx,
        Arc::clone(&handle),
        cancel_tx.clone(),
        cancel_rx,
    ));

    let mut recv = recv;
    let outcome = run_read_loop(&mut recv, &state, &handle).await;
    tracing::info!(
        device_id = %identity.device_id(),
        outcome = ?outcome,
        "read loop finished"
    );

    // Drain: reads have stopped; give queued acks a bounded window to
    // flush before the writer is cancelled.
    handle.begin_drain();
    if !wait_drained(&handle, state.config.drain_timeout()).await {
        metrics::counter!("fleetline_connections_drain_forced_total").increment(1);
        tracing::warn!(
            device_id = %identity.device_id(),
            pending_acks = handle.ack_depth(),
            inflight = handle.inflight_len(),
            "drain deadline exceeded, forcing close"
        );
    }
    let _ = cancel_tx.send(true);
    handle.mark_closed();
    state.registry.unregister(&handle);
    state
        .routes
        .dispatch(&Record::connectivity(
            &identity,
            &connection_id,
            ConnectivityStatus::Disconnected,
            NETWORK_INTERFACE,
        ))
        .await;
    let _ = writer.await;
    connection.close(b"");
}

pub(super) async fn run_read_loop<S: EnvelopeSource + ?Sized>(
    source: &mut S,
    state: &ServerState,
    handle: &Arc<ConnectionHandle>,
) -> ReadOutcome {
    let mut state_rx = handle.subscribe_state();
    let mut shutdown_rx = state.shutdown.clone();
    let mut scratch = BytesMut::new();
    let max_frame_bytes = state.config.connection.max_frame_bytes;
    loop {
        if *shutdown_rx.borrow() {
            return ReadOutcome::Shutdown;
        }
        if handle.state() > ConnState::Open {
            return ReadOutcome::Draining;
        }
        let envelope = tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() || handle.state() > ConnState::Open {
                    return ReadOutcome::Draining;
                }
                continue;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return ReadOutcome::Shutdown;
                }
                continue;
            }
            envelope = source.next_envelope(max_frame_bytes, &mut scratch) => envelope,
        };
        let envelope = match envelope {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return ReadOutcome::PeerClosed,
            Err(err) => {
                metrics::counter!(
                    "fleetline_records_dropped_total",
                    "reason" => "envelope_parse"
                )
                .increment(1);
                tracing::warn!(
                    device_id = %handle.device_id(),
                    error = %err,
                    "envelope read failed"
                );
                return ReadOutcome::EnvelopeError;
            }
        };
        handle.note_rx();
        let mut record = match Record::from_envelope(&envelope, handle.identity()) {
            Ok(record) => record,
            Err(err @ RecordError::IdentityMismatch { .. }) => {
                metrics::counter!(
                    "fleetline_connections_terminated_total",
                    "reason" => "identity_mismatch"
                )
                .increment(1);
                tracing::warn!(device_id = %handle.device_id(), error = %err, "terminating");
                return ReadOutcome::IdentityMismatch;
            }
            Err(err) => {
                metrics::counter!(
                    "fleetline_records_dropped_total",
                    "reason" => "envelope_parse"
                )
                .increment(1);
                tracing::warn!(device_id = %handle.device_id(), error = %err, "terminating");
                return ReadOutcome::EnvelopeError;
            }
        };
        metrics::counter!(
            "fleetline_records_received_total",
            "record_type" => record.type_tag.clone()
        )
        .increment(1);
        // Rate-limit denials are silent: drop the record, keep reading.
        if !state.limiter.try_admit(record.identity.device_id()) {
            continue;
        }
        if state.config.transmit_decoded_records {
            record.decode_payload_to_json();
        }
        // Track before dispatch: the designated backend may confirm
        // acceptance before dispatch returns.
        if state.routes.is_ack_eligible(&record) {
            handle.track_inflight(&record);
        }
        state.routes.dispatch(&record).await;
    }
}

async fn wait_drained(handle: &Arc<ConnectionHandle>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if handle.drained() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.drained()
}
