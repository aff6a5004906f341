// Command reader for one consumer connection.
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use courier_broker::{Client, ClientError, ClientParts, ClientState, negotiate_features};
use courier_transport::{LayeredReader, RawIo};
use courier_wire::{CLOSE_WAIT, Command, FrameType, IdentifyRequest, OK};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use crate::pump;
use crate::server::ServerState;

const E_INVALID: &str = "E_INVALID";
const E_BAD_BODY: &str = "E_BAD_BODY";
const E_BAD_PROTOCOL: &str = "E_BAD_PROTOCOL";

// Longest command line accepted before the body.
const MAX_LINE_BYTES: u64 = 1024;

enum Failure {
    // Reported to the client as an error frame.
    Reply {
        code: &'static str,
        message: String,
        fatal: bool,
    },
    // Ends the connection without a reply.
    Connection(ClientError),
}

impl Failure {
    fn reply(code: &'static str, message: impl Into<String>) -> Self {
        Self::Reply {
            code,
            message: message.into(),
            fatal: false,
        }
    }

    fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self::Reply {
            code,
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<ClientError> for Failure {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Validation { .. } => Self::reply(E_BAD_BODY, err.to_string()),
            ClientError::InvalidState { .. } | ClientError::Protocol(_) => {
                Self::reply(E_INVALID, err.to_string())
            }
            other => Self::Connection(other),
        }
    }
}

/// Serve one connection until the peer leaves, sends `CLS` and disconnects, or fails.
pub async fn run_connection<S: RawIo>(
    state: Arc<ServerState>,
    io: S,
    remote: SocketAddr,
) -> Result<()> {
    let id = state.ids.next_id();
    let ClientParts {
        client,
        mut reader,
        events,
    } = Client::new(id, remote, io, Arc::clone(&state.context));

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .await
        .context("read protocol magic")?;
    if let Err(err) = courier_wire::check_magic(&magic) {
        send_error(&client, E_BAD_PROTOCOL, &err.to_string()).await?;
        bail!("client {id} from {remote}: {err}");
    }

    metrics::counter!("courier_connections_total").increment(1);
    metrics::gauge!("courier_clients_connected").increment(1.0);
    tracing::info!(client_id = %id, %remote, "client connected");

    let pump = tokio::spawn(pump::run(Arc::clone(&client), events));
    let result = command_loop(&state, &client, &mut reader).await;

    client.start_close();
    client.exit();
    if let Err(err) = pump.await {
        tracing::warn!(client_id = %id, error = %err, "message pump panicked");
    }

    metrics::gauge!("courier_clients_connected").decrement(1.0);
    let stats = client.stats().await;
    tracing::info!(
        client_id = %id,
        %remote,
        ready = stats.ready_count,
        in_flight = stats.in_flight_count,
        finished = stats.finish_count,
        "client disconnected"
    );
    result
}

async fn command_loop<S: RawIo>(
    state: &ServerState,
    client: &Client<S>,
    reader: &mut LayeredReader<S>,
) -> Result<()> {
    let mut line = Vec::with_capacity(64);
    loop {
        line.clear();
        // Idle clients are dropped after two missed heartbeats.
        let idle = client.timings().await.heartbeat_interval * 2;
        let read = tokio::select! {
            read = read_line(reader, &mut line, idle) => read?,
            _ = client.exited() => return Ok(()),
        };
        if read == 0 {
            return Ok(());
        }
        if line.last() != Some(&b'\n') {
            send_error(client, E_INVALID, "command line too long").await?;
            return Ok(());
        }

        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(err @ courier_wire::Error::InvalidCommand(_)) => {
                send_error(client, E_INVALID, &err.to_string()).await?;
                return Ok(());
            }
            Err(err) => {
                send_error(client, E_INVALID, &err.to_string()).await?;
                continue;
            }
        };
        tracing::trace!(client_id = %client.id(), command = command.name(), "command");

        let name = command.name();
        match execute(state, client, reader, command).await {
            Ok(()) => {}
            Err(Failure::Reply {
                code,
                message,
                fatal,
            }) => {
                send_error(client, code, &format!("{name} {message}")).await?;
                if fatal {
                    return Ok(());
                }
            }
            Err(Failure::Connection(err)) => {
                return Err(err).with_context(|| format!("{name} failed"));
            }
        }
    }
}

async fn read_line<S: RawIo>(
    reader: &mut LayeredReader<S>,
    line: &mut Vec<u8>,
    idle: Duration,
) -> Result<usize> {
    let mut limited = (&mut *reader).take(MAX_LINE_BYTES);
    let read = limited.read_until(b'\n', line);
    if idle.is_zero() {
        return read.await.context("read command");
    }
    match tokio::time::timeout(idle, read).await {
        Ok(read) => read.context("read command"),
        Err(_) => bail!("client idle for {idle:?}"),
    }
}

async fn execute<S: RawIo>(
    state: &ServerState,
    client: &Client<S>,
    reader: &mut LayeredReader<S>,
    command: Command,
) -> std::result::Result<(), Failure> {
    match command {
        Command::Identify => identify(state, client, reader).await,
        Command::Subscribe { topic, channel } => {
            let channel = state.channels.get_or_create(&topic, &channel);
            client.subscribe(&channel)?;
            respond(client, OK).await
        }
        Command::Ready(count) => ready(client, count),
        Command::Nop => Ok(()),
        Command::Close => {
            let current = client.state();
            if current != ClientState::Subscribed {
                return Err(ClientError::InvalidState {
                    operation: "close",
                    state: current,
                }
                .into());
            }
            client.start_close();
            respond(client, CLOSE_WAIT).await
        }
    }
}

fn ready<S: RawIo>(client: &Client<S>, count: i64) -> std::result::Result<(), Failure> {
    match client.state() {
        // Late RDY updates from a closing consumer are expected.
        ClientState::Closing => return Ok(()),
        ClientState::Subscribed => {}
        other => {
            return Err(ClientError::InvalidState {
                operation: "ready",
                state: other,
            }
            .into());
        }
    }
    let max = client.context().limits.max_rdy_count;
    if !(0..=max).contains(&count) {
        return Err(Failure::reply(
            E_INVALID,
            format!("RDY count {count} out of range 0-{max}"),
        ));
    }
    client.set_ready_count(count);
    Ok(())
}

async fn identify<S: RawIo>(
    state: &ServerState,
    client: &Client<S>,
    reader: &mut LayeredReader<S>,
) -> std::result::Result<(), Failure> {
    let mut prefix = [0u8; 4];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|err| Failure::Connection(err.into()))?;
    // The body cannot be skipped safely once its length is rejected.
    let len = courier_wire::body_len(prefix, state.max_body_bytes)
        .map_err(|err| Failure::fatal(E_BAD_BODY, err.to_string()))?;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|err| Failure::Connection(err.into()))?;
    let request = IdentifyRequest::from_json(&body)
        .map_err(|_| Failure::reply(E_BAD_BODY, "failed to decode JSON body"))?;

    let granted = negotiate_features(
        &request,
        &client.context().limits,
        client.context().tls.is_some(),
    )?;
    client.identify(&request).await?;

    let reply = if request.feature_negotiation {
        let response = client.identify_response(&granted).await;
        response.to_json().map_err(ClientError::from)?
    } else {
        Bytes::from_static(OK)
    };
    client.finish_negotiation(reader, &reply, &granted).await?;
    Ok(())
}

async fn respond<S: RawIo>(client: &Client<S>, payload: &[u8]) -> std::result::Result<(), Failure> {
    client
        .write_frame(FrameType::Response, payload)
        .await
        .map_err(Failure::Connection)?;
    client.flush().await.map_err(Failure::Connection)
}

async fn send_error<S: RawIo>(client: &Client<S>, code: &str, message: &str) -> Result<()> {
    tracing::debug!(client_id = %client.id(), code, message, "client error");
    let payload = format!("{code} {message}");
    client
        .write_frame(FrameType::Error, payload.as_bytes())
        .await
        .context("write error frame")?;
    client.flush().await.context("flush error frame")
}
