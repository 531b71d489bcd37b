// QUIC listener: accepts mutually-authenticated vehicle connections and
// hands each one to its own handler task.
mod codec;
mod conn;
mod handshake;
mod source;
mod writer;

use anyhow::Result;
use fleetline_transport::QuicServer;
use std::sync::Arc;

use crate::server::ServerState;

pub async fn serve(server: Arc<QuicServer>, state: Arc<ServerState>) -> Result<()> {
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
            accepted = server.accept() => {
                let connection = match accepted {
                    Ok(Some(connection)) => connection,
                    // Endpoint closed; shutdown is underway.
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        metrics::counter!(
                            "fleetline_connections_total",
                            "result" => "handshake_rejected"
                        )
                        .increment(1);
                        tracing::info!(error = %err, "handshake rejected");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    conn::handle_connection(state, connection).await;
                });
            }
        }
    }
}
