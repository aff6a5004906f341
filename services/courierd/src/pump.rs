// Outbound half of a connection: heartbeats, periodic flushes and readiness checks.
use courier_broker::{Client, PumpEvents};
use courier_transport::RawIo;
use courier_wire::{FrameType, HEARTBEAT};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};

/// Run until the client exits. Write failures end the connection.
pub async fn run<S: RawIo>(client: Arc<Client<S>>, mut events: PumpEvents) {
    let timings = client.timings().await;
    let mut heartbeat = ticker(timings.heartbeat_interval);
    let mut flusher = ticker(timings.output_buffer_timeout);

    loop {
        tokio::select! {
            _ = client.exited() => break,
            Some(event) = events.identify.recv() => {
                tracing::debug!(
                    client_id = %client.id(),
                    heartbeat_ms = event.heartbeat_interval.as_millis() as u64,
                    flush_ms = event.output_buffer_timeout.as_millis() as u64,
                    "pump timings updated"
                );
                heartbeat = ticker(event.heartbeat_interval);
                flusher = ticker(event.output_buffer_timeout);
            }
            Some(channel) = events.subscribe.recv() => {
                if let Some(channel) = channel.upgrade() {
                    tracing::debug!(client_id = %client.id(), channel = %channel.name(), "pump attached");
                }
            }
            _ = client.readiness_changed() => {
                // No message source is attached; readiness is only tracked.
                let ready = client.is_ready_for_messages();
                tracing::trace!(client_id = %client.id(), ready, "readiness changed");
            }
            _ = tick(&mut heartbeat) => {
                let sent = match client.write_frame(FrameType::Response, HEARTBEAT).await {
                    Ok(()) => client.flush().await,
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    tracing::warn!(client_id = %client.id(), error = %err, "heartbeat failed");
                    client.exit();
                    break;
                }
            }
            _ = tick(&mut flusher) => {
                if let Err(err) = client.flush().await {
                    tracing::warn!(client_id = %client.id(), error = %err, "flush failed");
                    client.exit();
                    break;
                }
            }
        }
    }
    tracing::debug!(client_id = %client.id(), "pump exited");
}

// A zero period disables the ticker.
fn ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_period_disables_ticker() {
        assert!(ticker(Duration::ZERO).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_first_fires_after_one_period() {
        let start = Instant::now();
        let mut heartbeat = ticker(Duration::from_secs(5));
        tick(&mut heartbeat).await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_ticker_never_fires() {
        let mut disabled = None;
        let fired = tokio::time::timeout(Duration::from_secs(3600), tick(&mut disabled)).await;
        assert!(fired.is_err());
    }
}
