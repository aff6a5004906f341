// courierd entry point.
use anyhow::{Context, Result};
use courierd::{config, observability, server::ServerState, tcp};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability()?;
    let config = config::BrokerConfig::from_env_or_yaml()?;

    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics server exited");
        }
    });

    let state = Arc::new(ServerState::from_config(&config).context("build client context")?);
    let listener = TcpListener::bind(config.tcp_bind)
        .await
        .with_context(|| format!("bind tcp listener on {}", config.tcp_bind))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        tls = state.context.tls.is_some(),
        "tcp listener started"
    );

    let accept_task = tokio::spawn(async move {
        if let Err(err) = tcp::serve(listener, state).await {
            tracing::warn!(error = %err, "tcp accept loop exited");
        }
    });

    shutdown.await;
    accept_task.abort();
    tracing::info!("courierd stopped");
    Ok(())
}
