// TCP accept loop for consumer connections.
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::protocol;
use crate::server::ServerState;

pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> Result<()> {
    loop {
        let (socket, remote) = listener.accept().await.context("accept tcp connection")?;
        if let Err(err) = socket.set_nodelay(true) {
            tracing::debug!(error = %err, %remote, "set_nodelay failed");
        }
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = protocol::run_connection(state, socket, remote).await {
                tracing::warn!(error = %err, %remote, "tcp connection handler failed");
            }
        });
    }
}
