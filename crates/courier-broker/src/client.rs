// Connection state shared by the command reader and the delivery pump.
use courier_common::SessionLimits;
use courier_common::ids::ClientId;
use courier_transport::{
    AtomicLayers, InboundCodec, Layer, LayeredReader, LayeredWriter, OutboundCodec, RawIo,
    TlsAcceptor, TransportConfig, TransportLayers,
};
use courier_wire::{ClientStats, FrameType, PROTOCOL_VERSION, frame_header};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, watch};

use crate::channel::Channel;
use crate::counters::FlowCounters;
use crate::events::{EventReceiver, EventRelay, relay};
use crate::identify::IdentifyEvent;
use crate::readiness::ReadinessLog;
use crate::{ClientError, ClientState, Result, session};

/// Upper bound on a single flush to the client.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Broker-wide collaborators shared by every connection.
#[derive(Clone)]
pub struct ClientContext {
    pub limits: SessionLimits,
    pub tls: Option<TlsAcceptor>,
    pub transport: TransportConfig,
    pub readiness_log: Arc<dyn ReadinessLog>,
}

/// Receivers the delivery pump selects over.
#[derive(Debug)]
pub struct PumpEvents {
    pub identify: EventReceiver<IdentifyEvent>,
    pub subscribe: EventReceiver<Weak<dyn Channel>>,
}

/// A new connection split into its shared state, the reader owned by the command task,
/// and the event receivers owned by the pump.
pub struct ClientParts<S> {
    pub client: Arc<Client<S>>,
    pub reader: LayeredReader<S>,
    pub events: PumpEvents,
}

// Fields that change together and must be observed together.
pub(crate) struct ClientInner<S> {
    pub(crate) short_id: String,
    pub(crate) long_id: String,
    pub(crate) user_agent: String,
    pub(crate) output_buffer_size: usize,
    pub(crate) output_buffer_timeout: Duration,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) msg_timeout: Duration,
    pub(crate) writer: LayeredWriter<S>,
}

pub struct Client<S> {
    id: ClientId,
    remote: SocketAddr,
    connected_at: SystemTime,
    pub(crate) context: Arc<ClientContext>,
    pub(crate) inner: RwLock<ClientInner<S>>,
    counters: FlowCounters,
    pub(crate) sample_rate: AtomicI32,
    layers: AtomicLayers,
    state: AtomicI32,
    channel: parking_lot::RwLock<Option<Weak<dyn Channel>>>,
    pub(crate) identify_events: EventRelay<IdentifyEvent>,
    subscribe_events: EventRelay<Weak<dyn Channel>>,
    exit: watch::Sender<bool>,
}

impl<S: RawIo> Client<S> {
    pub fn new(
        id: ClientId,
        remote: SocketAddr,
        io: S,
        context: Arc<ClientContext>,
    ) -> ClientParts<S> {
        let limits = &context.limits;
        let (reader, writer) = courier_transport::layered(
            io,
            context.transport.read_buffer_size,
            limits.output_buffer_size,
        );
        let identifier = remote.ip().to_string();
        let inner = ClientInner {
            short_id: identifier.clone(),
            long_id: identifier,
            user_agent: String::new(),
            output_buffer_size: limits.output_buffer_size,
            output_buffer_timeout: limits.output_buffer_timeout,
            heartbeat_interval: limits.default_heartbeat_interval(),
            msg_timeout: limits.msg_timeout,
            writer,
        };
        let (identify_events, identify_rx) = relay();
        let (subscribe_events, subscribe_rx) = relay();
        let (exit, _) = watch::channel(false);
        let client = Arc::new(Self {
            id,
            remote,
            connected_at: SystemTime::now(),
            context,
            inner: RwLock::new(inner),
            counters: FlowCounters::new(),
            sample_rate: AtomicI32::new(0),
            layers: AtomicLayers::default(),
            state: AtomicI32::new(ClientState::Init as i32),
            channel: parking_lot::RwLock::new(None),
            identify_events,
            subscribe_events,
            exit,
        });
        ClientParts {
            client,
            reader,
            events: PumpEvents {
                identify: identify_rx,
                subscribe: subscribe_rx,
            },
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn counters(&self) -> &FlowCounters {
        &self.counters
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_i32(self.state.load(Ordering::Acquire))
    }

    pub fn layers(&self) -> TransportLayers {
        self.layers.load()
    }

    pub fn sample_rate(&self) -> i32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    // Move from one of `from` to `to`; Closing never moves.
    pub(crate) fn transition(
        &self,
        operation: &'static str,
        from: &[ClientState],
        to: ClientState,
    ) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = ClientState::from_i32(current);
            if state == ClientState::Closing || !from.contains(&state) {
                return Err(ClientError::InvalidState { operation, state });
            }
            match self.state.compare_exchange(
                current,
                to as i32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn set_ready_count(&self, count: i64) {
        self.counters.set_ready_count(count);
    }

    pub fn sending_message(&self) {
        self.counters.sending_message();
    }

    pub fn finished_message(&self) {
        self.counters.finished_message();
    }

    pub fn timed_out_message(&self) {
        self.counters.timed_out_message();
    }

    pub fn requeued_message(&self) {
        self.counters.requeued_message();
    }

    pub fn empty(&self) {
        self.counters.empty();
    }

    /// Whether the pump may send another message right now.
    pub fn is_ready_for_messages(&self) -> bool {
        let channel = self.channel.read().as_ref().and_then(Weak::upgrade);
        match channel {
            Some(channel) if !channel.is_paused() => {}
            _ => return false,
        }
        let readiness = self.counters.readiness();
        self.context
            .readiness_log
            .record(self.id, self.remote, &readiness);
        readiness.allows_delivery()
    }

    /// Resolves when readiness should be re-evaluated.
    pub async fn readiness_changed(&self) {
        self.counters.changed().await;
    }

    /// Attach to `channel` without owning it and tell the pump about it.
    pub fn subscribe<C: Channel + 'static>(&self, channel: &Arc<C>) -> Result<()> {
        self.transition(
            "subscribe",
            &[ClientState::Init, ClientState::Waiting],
            ClientState::Subscribed,
        )?;
        let weak = Arc::downgrade(channel);
        let weak: Weak<dyn Channel> = weak;
        *self.channel.write() = Some(weak.clone());
        self.subscribe_events.publish(weak);
        tracing::info!(client_id = %self.id, channel = %channel.name(), "client subscribed");
        Ok(())
    }

    /// Stop delivery and mark the connection as closing. Repeated calls are harmless.
    pub fn start_close(&self) {
        self.counters.set_ready_count(0);
        let previous = self.state.swap(ClientState::Closing as i32, Ordering::AcqRel);
        if previous != ClientState::Closing as i32 {
            tracing::debug!(client_id = %self.id, "client closing");
        }
    }

    pub fn pause(&self) {
        self.counters.wake();
    }

    pub fn unpause(&self) {
        self.counters.wake();
    }

    /// Signal both connection tasks to stop.
    pub fn exit(&self) {
        self.exit.send_replace(true);
    }

    pub async fn exited(&self) {
        let mut rx = self.exit.subscribe();
        // The sender lives in `self`, so this only returns once `exit` was called.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Current timing settings, in the same shape the pump receives after identify.
    pub async fn timings(&self) -> IdentifyEvent {
        let inner = self.inner.read().await;
        IdentifyEvent {
            output_buffer_timeout: inner.output_buffer_timeout,
            heartbeat_interval: inner.heartbeat_interval,
            sample_rate: self.sample_rate(),
            msg_timeout: inner.msg_timeout,
        }
    }

    pub async fn output_buffer_size(&self) -> usize {
        self.inner.read().await.output_buffer_size
    }

    pub async fn set_heartbeat_interval(&self, millis: i64) -> Result<()> {
        let interval = session::heartbeat_interval(millis, self.context.limits.max_heartbeat_interval)?;
        if let Some(interval) = interval {
            self.inner.write().await.heartbeat_interval = interval;
        }
        Ok(())
    }

    /// Flush what is buffered at the old size, then continue with a buffer of the new size.
    pub async fn set_output_buffer_size(&self, bytes: i64) -> Result<()> {
        let Some(size) =
            session::output_buffer_size(bytes, self.context.limits.max_output_buffer_size)?
        else {
            return Ok(());
        };
        let mut inner = self.inner.write().await;
        self.with_flush_deadline(inner.writer.resize(size)).await?;
        inner.output_buffer_size = size;
        Ok(())
    }

    pub async fn set_output_buffer_timeout(&self, millis: i64) -> Result<()> {
        let timeout =
            session::output_buffer_timeout(millis, self.context.limits.max_output_buffer_timeout)?;
        if let Some(timeout) = timeout {
            self.inner.write().await.output_buffer_timeout = timeout;
        }
        Ok(())
    }

    pub fn set_sample_rate(&self, rate: i32) -> Result<()> {
        let rate = session::sample_rate(rate)?;
        self.sample_rate.store(rate, Ordering::Release);
        Ok(())
    }

    pub async fn set_msg_timeout(&self, millis: i64) -> Result<()> {
        let timeout = session::msg_timeout(millis, self.context.limits.max_msg_timeout)?;
        if let Some(timeout) = timeout {
            self.inner.write().await.msg_timeout = timeout;
        }
        Ok(())
    }

    pub async fn upgrade_tls(&self, reader: &mut LayeredReader<S>) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.upgrade_locked(&mut inner, reader, Layer::Tls, 0).await
    }

    pub async fn upgrade_deflate(&self, reader: &mut LayeredReader<S>, level: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.upgrade_locked(&mut inner, reader, Layer::Deflate, level)
            .await
    }

    pub async fn upgrade_snappy(&self, reader: &mut LayeredReader<S>) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.upgrade_locked(&mut inner, reader, Layer::Snappy, 0)
            .await
    }

    // `level` only applies to deflate.
    pub(crate) async fn upgrade_locked(
        &self,
        inner: &mut ClientInner<S>,
        reader: &mut LayeredReader<S>,
        layer: Layer,
        level: u32,
    ) -> Result<()> {
        let next = match layer {
            Layer::Tls => {
                let acceptor = self
                    .context
                    .tls
                    .as_ref()
                    .ok_or(ClientError::TlsNotConfigured)?;
                let next = self.layers.load().with(Layer::Tls)?;
                courier_transport::upgrade_tls(reader, &mut inner.writer, acceptor).await?;
                next
            }
            Layer::Deflate => {
                let next = self.layers.load().with(Layer::Deflate)?;
                courier_transport::upgrade_codec(
                    reader,
                    &mut inner.writer,
                    InboundCodec::deflate(),
                    OutboundCodec::deflate(level),
                )
                .await?;
                next
            }
            Layer::Snappy => {
                let next = self.layers.load().with(Layer::Snappy)?;
                courier_transport::upgrade_codec(
                    reader,
                    &mut inner.writer,
                    InboundCodec::snappy(self.context.transport.snappy_verify_checksum),
                    OutboundCodec::snappy(),
                )
                .await?;
                next
            }
        };
        self.upgraded(layer, next);
        Ok(())
    }

    fn upgraded(&self, layer: Layer, layers: TransportLayers) {
        self.layers.store(layers);
        metrics::counter!("courier_client_upgrade_total", "layer" => layer.to_string())
            .increment(1);
        tracing::info!(client_id = %self.id, %layers, "transport upgraded");
    }

    /// Buffer one frame for the client. Call [`Client::flush`] to push it out.
    pub async fn write_frame(&self, frame_type: FrameType, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().await;
        write_frame_locked(&mut inner, frame_type, payload).await
    }

    pub async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.with_flush_deadline(inner.writer.flush()).await
    }

    pub(crate) async fn with_flush_deadline(
        &self,
        flush: impl Future<Output = std::io::Result<()>>,
    ) -> Result<()> {
        match tokio::time::timeout(FLUSH_TIMEOUT, flush).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                metrics::counter!("courier_client_flush_timeouts_total").increment(1);
                tracing::warn!(client_id = %self.id, "flush timed out");
                Err(ClientError::FlushTimeout(FLUSH_TIMEOUT))
            }
        }
    }

    /// Monitoring snapshot. Numeric fields are loaded independently of each other.
    pub async fn stats(&self) -> ClientStats {
        let (name, user_agent) = {
            let inner = self.inner.read().await;
            (inner.short_id.clone(), inner.user_agent.clone())
        };
        let layers = self.layers.load();
        let connect_ts = self
            .connected_at
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();
        ClientStats {
            version: PROTOCOL_VERSION.to_string(),
            remote_address: self.remote.to_string(),
            name,
            user_agent,
            state: self.state() as i32,
            ready_count: self.counters.ready_count(),
            in_flight_count: self.counters.in_flight_count(),
            message_count: self.counters.message_count(),
            finish_count: self.counters.finish_count(),
            requeue_count: self.counters.requeue_count(),
            connect_ts,
            sample_rate: self.sample_rate(),
            tls: layers.tls(),
            deflate: layers.deflate(),
            snappy: layers.snappy(),
        }
    }
}

pub(crate) async fn write_frame_locked<S: RawIo>(
    inner: &mut ClientInner<S>,
    frame_type: FrameType,
    payload: &[u8],
) -> Result<()> {
    let header = frame_header(frame_type, payload.len())?;
    inner.writer.write_all(&header).await?;
    inner.writer.write_all(payload).await?;
    Ok(())
}
