use bytes::Bytes;
use courier_broker::{
    ChannelHandle, Client, ClientContext, ClientError, ClientParts, ClientState, FLUSH_TIMEOUT,
    Negotiation, NoReadinessLog, TracingReadinessLog,
};
use courier_common::SessionLimits;
use courier_common::ids::ClientId;
use courier_transport::{
    InboundCodec, Layer, TlsAcceptor, TransportConfig, TransportLayers, UpgradeError,
    acceptor_from_pem,
};
use courier_wire::{FrameType, HEARTBEAT, IdentifyRequest, OK};
use futures::StreamExt;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream, duplex};
use tokio_rustls::TlsConnector;
use tokio_util::codec::FramedRead;

fn context(tls: Option<TlsAcceptor>) -> Arc<ClientContext> {
    Arc::new(ClientContext {
        limits: SessionLimits {
            client_timeout: Duration::from_secs(30),
            ..SessionLimits::default()
        },
        tls,
        transport: TransportConfig::default(),
        readiness_log: Arc::new(NoReadinessLog),
    })
}

fn connect(context: Arc<ClientContext>, buffer: usize) -> (ClientParts<DuplexStream>, DuplexStream) {
    let (server, peer) = duplex(buffer);
    let remote = "127.0.0.1:41500".parse().expect("addr");
    (Client::new(ClientId::new(1), remote, server, context), peer)
}

fn encoded_frame(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    courier_wire::Frame::new(frame_type, Bytes::copy_from_slice(payload))
        .expect("frame")
        .encode()
        .to_vec()
}

#[tokio::test]
async fn identify_applies_settings_and_publishes_once() {
    let (parts, mut peer) = connect(context(None), 64 * 1024);
    let ClientParts {
        client, mut events, ..
    } = parts;

    let defaults = client.timings().await;
    assert_eq!(defaults.heartbeat_interval, Duration::from_secs(15));
    assert_eq!(defaults.output_buffer_timeout, Duration::from_millis(250));
    assert_eq!(client.output_buffer_size().await, 16 * 1024);

    // Buffered before the resize; must reach the peer exactly once.
    client
        .write_frame(FrameType::Response, OK)
        .await
        .expect("write");

    let request = IdentifyRequest {
        short_id: "worker".into(),
        long_id: "worker.example".into(),
        heartbeat_interval: 5000,
        output_buffer_size: 256,
        sample_rate: 50,
        ..Default::default()
    };
    let event = client.identify(&request).await.expect("identify");
    assert_eq!(event.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(event.sample_rate, 50);
    assert_eq!(event.output_buffer_timeout, Duration::from_millis(250));
    assert_eq!(client.output_buffer_size().await, 256);
    assert_eq!(client.state(), ClientState::Waiting);

    let expected = encoded_frame(FrameType::Response, OK);
    let mut flushed = vec![0u8; expected.len()];
    peer.read_exact(&mut flushed).await.expect("flushed frame");
    assert_eq!(flushed, expected);

    // Other state changes before the pump reads do not duplicate the event.
    client.set_ready_count(3);
    let channel = Arc::new(ChannelHandle::new("archive"));
    client.subscribe(&channel).expect("subscribe");
    assert_eq!(events.identify.try_recv(), Some(event));
    assert_eq!(events.identify.try_recv(), None);
}

#[tokio::test]
async fn rejected_identify_keeps_earlier_fields() {
    let (parts, _peer) = connect(context(None), 1024);
    let ClientParts {
        client, mut events, ..
    } = parts;

    let request = IdentifyRequest {
        user_agent: "courier-test/1.0".into(),
        heartbeat_interval: 5000,
        output_buffer_size: 10,
        sample_rate: 20,
        ..Default::default()
    };
    let err = client.identify(&request).await.expect_err("invalid buffer");
    assert!(matches!(
        err,
        ClientError::Validation { field: "output_buffer_size", ref value } if value == "10"
    ));
    assert!(!err.is_fatal());

    let timings = client.timings().await;
    assert_eq!(timings.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(timings.sample_rate, 0);
    assert_eq!(client.output_buffer_size().await, 16 * 1024);
    assert_eq!(client.identity().await.2, "courier-test/1.0");
    assert_eq!(client.state(), ClientState::Init);
    assert_eq!(events.identify.try_recv(), None);
}

#[tokio::test]
async fn identify_sentinels_disable_timers() {
    let (parts, _peer) = connect(context(None), 1024);
    let request = IdentifyRequest {
        heartbeat_interval: -1,
        output_buffer_timeout: -1,
        output_buffer_size: -1,
        msg_timeout: 0,
        ..Default::default()
    };
    let event = parts.client.identify(&request).await.expect("identify");
    assert_eq!(event.heartbeat_interval, Duration::ZERO);
    assert_eq!(event.output_buffer_timeout, Duration::ZERO);
    assert_eq!(event.msg_timeout, Duration::from_secs(60));
    assert_eq!(parts.client.output_buffer_size().await, 1);

    let err = parts
        .client
        .identify(&request)
        .await
        .expect_err("second identify");
    assert!(matches!(
        err,
        ClientError::InvalidState {
            operation: "identify",
            state: ClientState::Waiting
        }
    ));
}

#[tokio::test]
async fn readiness_follows_channel_and_counters() {
    let (parts, _peer) = connect(context(None), 1024);
    let client = parts.client;
    client.set_ready_count(10);
    assert!(!client.is_ready_for_messages(), "no channel yet");

    let channel = Arc::new(ChannelHandle::new("archive"));
    client.subscribe(&channel).expect("subscribe");
    assert_eq!(client.state(), ClientState::Subscribed);
    assert!(client.is_ready_for_messages());

    channel.set_paused(true);
    client.pause();
    assert!(!client.is_ready_for_messages());
    channel.set_paused(false);
    client.unpause();
    tokio::time::timeout(Duration::from_millis(100), client.readiness_changed())
        .await
        .expect("wakeup");
    assert!(client.is_ready_for_messages());

    for _ in 0..10 {
        client.sending_message();
    }
    assert!(!client.is_ready_for_messages());
    client.finished_message();
    assert_eq!(client.counters().in_flight_count(), 9);
    assert!(!client.is_ready_for_messages());

    drop(channel);
    client.set_ready_count(100);
    assert!(!client.is_ready_for_messages(), "channel dropped");
}

#[tokio::test]
async fn zero_ready_count_is_never_ready() {
    let (parts, _peer) = connect(context(None), 1024);
    let client = parts.client;
    let channel = Arc::new(ChannelHandle::new("archive"));
    client.subscribe(&channel).expect("subscribe");

    client.set_ready_count(0);
    assert!(!client.is_ready_for_messages());
    client.set_ready_count(3);
    assert!(client.is_ready_for_messages());
    client.set_ready_count(0);
    assert!(!client.is_ready_for_messages());
    assert_eq!(client.counters().in_flight_count(), 0);
}

#[tokio::test]
async fn closing_is_terminal() {
    let (parts, _peer) = connect(context(None), 1024);
    let client = parts.client;
    client.set_ready_count(5);
    client.start_close();
    client.start_close();
    assert_eq!(client.state(), ClientState::Closing);
    assert_eq!(client.counters().ready_count(), 0);

    let channel = Arc::new(ChannelHandle::new("archive"));
    let err = client.subscribe(&channel).expect_err("closing");
    assert!(matches!(
        err,
        ClientError::InvalidState {
            state: ClientState::Closing,
            ..
        }
    ));
    let err = client
        .identify(&IdentifyRequest::default())
        .await
        .expect_err("closing");
    assert!(matches!(err, ClientError::InvalidState { .. }));
}

#[tokio::test]
async fn exit_releases_waiters() {
    let (parts, _peer) = connect(context(None), 1024);
    let client = parts.client;
    let waiter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.exited().await })
    };
    client.exit();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("exit observed")
        .expect("join");
}

#[tokio::test]
async fn stats_snapshot_reports_identity_and_counters() {
    let ctx = Arc::new(ClientContext {
        readiness_log: Arc::new(TracingReadinessLog { verbose: true }),
        ..Arc::unwrap_or_clone(context(None))
    });
    let (parts, _peer) = connect(ctx, 1024);
    let client = parts.client;
    let request = IdentifyRequest {
        short_id: "worker".into(),
        user_agent: "courier-test/1.0".into(),
        sample_rate: 25,
        ..Default::default()
    };
    client.identify(&request).await.expect("identify");
    client.set_ready_count(4);
    client.sending_message();
    client.sending_message();
    client.requeued_message();
    let channel = Arc::new(ChannelHandle::new("archive"));
    client.subscribe(&channel).expect("subscribe");
    assert!(client.is_ready_for_messages());

    let stats = client.stats().await;
    assert_eq!(stats.version, "V2");
    assert_eq!(stats.remote_address, "127.0.0.1:41500");
    assert_eq!(stats.name, "worker");
    assert_eq!(stats.user_agent, "courier-test/1.0");
    assert_eq!(stats.state, ClientState::Subscribed as i32);
    assert_eq!(stats.ready_count, 2);
    assert_eq!(stats.in_flight_count, 1);
    assert_eq!(stats.message_count, 2);
    assert_eq!(stats.requeue_count, 1);
    assert_eq!(stats.finish_count, 0);
    assert_eq!(stats.sample_rate, 25);
    assert!(stats.connect_ts > 0);
    assert!(!stats.tls && !stats.deflate && !stats.snappy);
}

#[tokio::test]
async fn stalled_peer_surfaces_flush_timeout() {
    let (parts, _peer) = connect(context(None), 64);
    let client = parts.client;
    client
        .write_frame(FrameType::Message, &[7u8; 1024])
        .await
        .expect("buffered");
    let err = client.flush().await.expect_err("peer never reads");
    assert!(err.is_timeout());
    assert!(matches!(err, ClientError::FlushTimeout(d) if d == FLUSH_TIMEOUT));
}

#[tokio::test]
async fn upgrade_order_and_repeats_are_guarded() {
    let (parts, _peer) = connect(context(None), 1024);
    let ClientParts {
        client, mut reader, ..
    } = parts;

    let err = client.upgrade_tls(&mut reader).await.expect_err("no tls");
    assert!(matches!(err, ClientError::TlsNotConfigured));

    client.upgrade_snappy(&mut reader).await.expect("snappy");
    assert_eq!(client.layers(), TransportLayers::Snappy);

    let err = client.upgrade_snappy(&mut reader).await.expect_err("repeat");
    assert!(matches!(
        err,
        ClientError::Upgrade(UpgradeError::AlreadyNegotiated(Layer::Snappy))
    ));
    let err = client
        .upgrade_deflate(&mut reader, 6)
        .await
        .expect_err("second compression");
    assert!(err.is_fatal());
    assert_eq!(client.layers(), TransportLayers::Snappy);
    assert!(client.stats().await.snappy);
}

#[tokio::test]
async fn heartbeat_waits_for_the_negotiated_layer() {
    let (parts, mut peer) = connect(context(None), 64);
    let ClientParts {
        client, mut reader, ..
    } = parts;
    let reply = vec![b'x'; 200];

    let negotiate = {
        let client = Arc::clone(&client);
        let reply = reply.clone();
        tokio::spawn(async move {
            let granted = Negotiation {
                snappy: true,
                ..Negotiation::default()
            };
            client.finish_negotiation(&mut reader, &reply, &granted).await
        })
    };
    // The reply flush stalls on the small pipe; the heartbeat queues behind it.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let heartbeat = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client.write_frame(FrameType::Response, HEARTBEAT).await?;
            client.flush().await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let expected_reply = encoded_frame(FrameType::Response, &reply);
    let mut plain = vec![0u8; expected_reply.len()];
    peer.read_exact(&mut plain).await.expect("reply");
    assert_eq!(plain, expected_reply);

    let expected = [
        encoded_frame(FrameType::Response, OK),
        encoded_frame(FrameType::Response, HEARTBEAT),
    ]
    .concat();
    let mut framed = FramedRead::new(peer, InboundCodec::snappy(true));
    let mut decoded = Vec::new();
    while decoded.len() < expected.len() {
        let chunk = tokio::time::timeout(Duration::from_secs(1), framed.next())
            .await
            .expect("chunk in time")
            .expect("stream open")
            .expect("decode");
        decoded.extend_from_slice(&chunk);
    }
    assert_eq!(decoded, expected);
    negotiate.await.expect("join").expect("negotiate");
    heartbeat.await.expect("join").expect("heartbeat");
    assert_eq!(client.layers(), TransportLayers::Snappy);
}

struct TestCert {
    acceptor: TlsAcceptor,
    der: CertificateDer<'static>,
}

fn test_cert() -> TestCert {
    let key_pair = rcgen::KeyPair::generate().expect("key pair");
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .expect("params")
        .self_signed(&key_pair)
        .expect("self-signed cert");
    let acceptor = acceptor_from_pem(cert.pem().as_bytes(), key_pair.serialize_pem().as_bytes())
        .expect("acceptor");
    TestCert {
        acceptor,
        der: cert.der().clone(),
    }
}

fn connector(der: CertificateDer<'static>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(der).expect("add root");
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_root_certificates(roots)
            .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test]
async fn deflate_after_tls_compresses_inside_tls_records() {
    let cert = test_cert();
    let (parts, peer_io) = connect(context(Some(cert.acceptor.clone())), 64 * 1024);
    let ClientParts {
        client, mut reader, ..
    } = parts;

    let server = async {
        client.upgrade_tls(&mut reader).await.expect("tls");
        client.upgrade_deflate(&mut reader, 6).await.expect("deflate");
        client
            .write_frame(FrameType::Response, OK)
            .await
            .expect("write");
        client.flush().await.expect("flush");
    };
    let peer = async {
        let name = ServerName::try_from("localhost").expect("server name");
        let tls = connector(cert.der.clone())
            .connect(name, peer_io)
            .await
            .expect("client handshake");
        let mut inbound = FramedRead::new(tls, InboundCodec::deflate());
        let mut received = Vec::new();
        let expected = encoded_frame(FrameType::Response, OK);
        while received.len() < expected.len() {
            let chunk = inbound.next().await.expect("chunk").expect("inflate");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, expected);
    };
    tokio::join!(server, peer);

    assert_eq!(client.layers(), TransportLayers::TlsDeflate);
    let stats = client.stats().await;
    assert!(stats.tls && stats.deflate && !stats.snappy);

    let err = client.upgrade_tls(&mut reader).await.expect_err("repeat");
    assert!(matches!(
        err,
        ClientError::Upgrade(UpgradeError::AlreadyNegotiated(Layer::Tls))
    ));
}
