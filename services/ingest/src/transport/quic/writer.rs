// Single-writer ack drain. A dedicated task owns the send stream and is
// the only code that ever writes to it; the read loop and the ack
// coordinator communicate with it exclusively through the bounded ack
// queue. A write failure cancels the whole connection cooperatively.
use fleetline_pipeline::ConnectionHandle;
use fleetline_wire::Envelope;
use quinn::SendStream;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::codec::write_envelope;

pub(super) async fn run_writer_loop(
    mut send: SendStream,
    mut ack_rx: mpsc::Receiver<Envelope>,
    handle: Arc<ConnectionHandle>,
    cancel_tx: watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            outgoing = ack_rx.recv() => {
                let Some(envelope) = outgoing else { break };
                let result = write_envelope(&mut send, &envelope).await;
                // Dequeued either way; depth must not leak on write errors.
                handle.ack_written();
                match result {
                    Ok(()) => {
                        metrics::counter!("fleetline_acks_written_total").increment(1);
                    }
                    Err(err) => {
                        tracing::info!(
                            device_id = %handle.device_id(),
                            error = %err,
                            "ack stream closed"
                        );
                        let _ = cancel_tx.send(true);
                        break;
                    }
                }
            }
        }
    }
    let _ = send.finish();
}
