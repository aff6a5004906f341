// IDENTIFY handling: session parameters, then the feature set granted to the client.
use courier_common::SessionLimits;
use courier_transport::{Layer, LayeredReader, RawIo};
use courier_wire::{FrameType, IdentifyRequest, IdentifyResponse, OK};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::client::{Client, ClientInner, write_frame_locked};
use crate::{ClientError, ClientState, Result};

/// Deflate level used when the client asks for deflate without a positive level.
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// Timing and sampling settings handed to the delivery pump after identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyEvent {
    pub output_buffer_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub sample_rate: i32,
    pub msg_timeout: Duration,
}

/// Transport features granted for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiation {
    pub tls: bool,
    pub deflate: Option<u32>,
    pub snappy: bool,
}

/// Decide which requested features are granted.
///
/// ```
/// use courier_broker::negotiate_features;
/// use courier_common::SessionLimits;
/// use courier_wire::IdentifyRequest;
///
/// let request = IdentifyRequest { deflate: true, deflate_level: 9, tls_v1: true, ..Default::default() };
/// let granted = negotiate_features(&request, &SessionLimits::default(), false).unwrap();
/// assert_eq!(granted.deflate, Some(6));
/// assert!(!granted.tls);
/// ```
pub fn negotiate_features(
    request: &IdentifyRequest,
    limits: &SessionLimits,
    tls_available: bool,
) -> Result<Negotiation> {
    if request.deflate && request.snappy {
        return Err(ClientError::Validation {
            field: "compression",
            value: "deflate+snappy".into(),
        });
    }
    let deflate = request.deflate.then(|| {
        let level = u32::try_from(request.deflate_level)
            .ok()
            .filter(|level| *level > 0)
            .unwrap_or(DEFAULT_DEFLATE_LEVEL);
        level.min(limits.max_deflate_level)
    });
    Ok(Negotiation {
        tls: request.tls_v1 && tls_available,
        deflate,
        snappy: request.snappy,
    })
}

impl<S: RawIo> Client<S> {
    /// Apply a client's identify request.
    ///
    /// Fields are applied in order and the first invalid one aborts the call; fields
    /// applied before it stay applied. On success the new timings are published to the
    /// pump and the client moves to `Waiting`.
    pub async fn identify(&self, request: &IdentifyRequest) -> Result<IdentifyEvent> {
        let state = self.state();
        if state != ClientState::Init {
            return Err(ClientError::InvalidState {
                operation: "identify",
                state,
            });
        }
        let result = self.apply_identify(request).await;
        let outcome = if result.is_ok() { "ok" } else { "rejected" };
        metrics::counter!("courier_client_identify_total", "result" => outcome).increment(1);
        let event = result?;
        self.transition("identify", &[ClientState::Init], ClientState::Waiting)?;
        tracing::info!(
            client_id = %self.id(),
            user_agent = %request.user_agent,
            heartbeat_ms = event.heartbeat_interval.as_millis() as u64,
            sample_rate = event.sample_rate,
            "client identified"
        );
        Ok(event)
    }

    async fn apply_identify(&self, request: &IdentifyRequest) -> Result<IdentifyEvent> {
        {
            let mut inner = self.inner.write().await;
            inner.short_id.clone_from(&request.short_id);
            inner.long_id.clone_from(&request.long_id);
            inner.user_agent.clone_from(&request.user_agent);
        }
        self.set_heartbeat_interval(request.heartbeat_interval)
            .await?;
        self.set_output_buffer_size(request.output_buffer_size)
            .await?;
        self.set_output_buffer_timeout(request.output_buffer_timeout)
            .await?;
        self.set_sample_rate(request.sample_rate)?;
        self.set_msg_timeout(request.msg_timeout).await?;

        let event = self.timings().await;
        self.identify_events.publish(event);
        Ok(event)
    }

    /// Reply body for a client that asked for feature negotiation.
    pub async fn identify_response(&self, granted: &Negotiation) -> IdentifyResponse {
        let limits = &self.context.limits;
        let inner = self.inner.read().await;
        IdentifyResponse {
            max_rdy_count: limits.max_rdy_count,
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_msg_timeout: limits.max_msg_timeout.as_millis() as u64,
            msg_timeout: inner.msg_timeout.as_millis() as u64,
            tls_v1: granted.tls,
            deflate: granted.deflate.is_some(),
            deflate_level: granted.deflate.unwrap_or_default(),
            max_deflate_level: limits.max_deflate_level,
            snappy: granted.snappy,
            sample_rate: self.sample_rate(),
            output_buffer_size: inner.output_buffer_size,
            output_buffer_timeout: inner.output_buffer_timeout.as_millis() as u64,
        }
    }

    /// Send the identify reply, then apply the granted layers in order, confirming each with
    /// `OK` through the new layer.
    ///
    /// The connection lock is held from the reply until the last confirmation, so no other
    /// frame (a heartbeat, say) can be written between the reply and the layer it announces.
    pub async fn finish_negotiation(
        &self,
        reader: &mut LayeredReader<S>,
        reply: &[u8],
        granted: &Negotiation,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.respond_locked(&mut inner, reply).await?;
        if granted.tls {
            self.upgrade_locked(&mut inner, reader, Layer::Tls, 0).await?;
            self.respond_locked(&mut inner, OK).await?;
        }
        if let Some(level) = granted.deflate {
            self.upgrade_locked(&mut inner, reader, Layer::Deflate, level)
                .await?;
            self.respond_locked(&mut inner, OK).await?;
        }
        if granted.snappy {
            self.upgrade_locked(&mut inner, reader, Layer::Snappy, 0)
                .await?;
            self.respond_locked(&mut inner, OK).await?;
        }
        Ok(())
    }

    async fn respond_locked(&self, inner: &mut ClientInner<S>, payload: &[u8]) -> Result<()> {
        write_frame_locked(inner, FrameType::Response, payload).await?;
        self.with_flush_deadline(inner.writer.flush()).await
    }

    pub async fn identity(&self) -> (String, String, String) {
        let inner = self.inner.read().await;
        (
            inner.short_id.clone(),
            inner.long_id.clone(),
            inner.user_agent.clone(),
        )
    }
}
