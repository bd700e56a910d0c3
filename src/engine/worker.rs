//! Bridge worker: one task per admitted bridge. Connects outbound (with
//! random-start failover across each comma host list), pumps bytes both
//! ways, then hands the record back to the scheduler over the completion
//! channel.

use bytes::{Buf, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::engine::bridge::Bridge;
use crate::engine::{PUMP_DEADLINE_ERROR, PUMP_TICK_MS, READ_CHUNK_BYTES};

#[derive(Debug, Error)]
enum ConnectError {
    #[error("resolve() error:  {0}")]
    Resolve(String),

    #[error("connect() error:  {0}")]
    Connect(String),
}

pub(crate) async fn run(mut bridge: Bridge, config: Arc<Config>, done_tx: mpsc::Sender<Bridge>) {
    connect_outbound(&mut bridge, &config).await;
    if bridge.outgoing.is_some() {
        pump(&mut bridge, config.pump_deadline()).await;
    }
    // Dropping the handles closes both sockets; sending the record is the
    // last action that touches it.
    bridge.outgoing = None;
    bridge.incoming = None;
    if done_tx.send(bridge).await.is_err() {
        debug!("scheduler gone before bridge completion");
    }
}

/// Ordered list of comma host lists to try: the pinned server alone, or the
/// configured load balancer then service junction.
fn server_group(bridge: &Bridge) -> Vec<String> {
    if !bridge.server.is_empty() {
        return vec![bridge.server.clone()];
    }
    let mut group = Vec::new();
    if !bridge.load_balancer.is_empty() {
        group.push(bridge.load_balancer.clone());
    }
    if !bridge.service_junction.is_empty() {
        group.push(bridge.service_junction.clone());
    }
    group
}

fn split_hosts(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(String::from)
        .collect()
}

async fn connect_outbound(bridge: &mut Bridge, config: &Config) {
    let group = server_group(bridge);
    if group.is_empty() {
        bridge.set_error("no backend hosts configured");
        return;
    }

    let mut last_err: Option<ConnectError> = None;
    for entry in &group {
        let hosts = split_hosts(entry);
        if hosts.is_empty() {
            continue;
        }

        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut pick = rng.random_range(0..hosts.len());

        for _ in 0..hosts.len() {
            if pick == hosts.len() {
                pick = 0;
            }
            let host = &hosts[pick];
            match try_host(host, &bridge.port, config.connect_timeout()).await {
                Ok(stream) => {
                    debug!(host = %host, port = %bridge.port, "outbound connected");
                    bridge.outgoing = Some(stream);
                    bridge.server = host.clone();
                    bridge
                        .info
                        .insert("Server".to_string(), host.clone().into());
                    return;
                }
                Err(err) => {
                    debug!(host = %host, port = %bridge.port, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
            pick += 1;
        }
    }

    match last_err {
        Some(err) => bridge.set_error(err.to_string()),
        None => bridge.set_error("no backend hosts configured"),
    }
}

async fn try_host(
    host: &str,
    port: &str,
    connect_timeout: Duration,
) -> Result<TcpStream, ConnectError> {
    let port: u16 = port
        .parse()
        .map_err(|_| ConnectError::Resolve(format!("invalid port '{port}'")))?;
    let addrs = lookup_host((host, port))
        .await
        .map_err(|err| ConnectError::Resolve(err.to_string()))?;

    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => last_err = Some(ConnectError::Connect(err.to_string())),
            Err(_) => last_err = Some(ConnectError::Connect("timed out".to_string())),
        }
    }
    Err(last_err.unwrap_or_else(|| ConnectError::Resolve("no addresses".to_string())))
}

/// Two-buffer pump. Each direction has one growing buffer; a socket is
/// polled for writability only while its buffer holds bytes. That gating is
/// the flow-control mechanism: a stalled reader stops draining its buffer
/// and the opposite socket simply stops being written.
async fn pump(bridge: &mut Bridge, deadline: Duration) {
    let Some(incoming) = bridge.incoming.take() else {
        return;
    };
    let Some(outgoing) = bridge.outgoing.take() else {
        bridge.incoming = Some(incoming);
        return;
    };

    let started = Instant::now();
    let mut scratch = vec![0u8; READ_CHUNK_BYTES];

    loop {
        if started.elapsed() > deadline {
            bridge.set_error(PUMP_DEADLINE_ERROR);
            break;
        }

        // Writes come first so pending bytes are flushed before an EOF on
        // the other socket can end the pump with a buffered tail.
        let keep_going = tokio::select! {
            biased;
            ready = incoming.writable(), if !bridge.to_incoming.is_empty() => match ready {
                Ok(()) => write_side(&incoming, &mut bridge.to_incoming, &mut bridge.in_send, "incoming"),
                Err(err) => poll_failed(bridge, err),
            },
            ready = outgoing.writable(), if !bridge.to_outgoing.is_empty() => match ready {
                Ok(()) => write_side(&outgoing, &mut bridge.to_outgoing, &mut bridge.out_send, "outgoing"),
                Err(err) => poll_failed(bridge, err),
            },
            ready = incoming.readable() => match ready {
                Ok(()) => read_side(&incoming, &mut bridge.to_outgoing, &mut bridge.in_recv, &mut scratch, "incoming"),
                Err(err) => poll_failed(bridge, err),
            },
            ready = outgoing.readable() => match ready {
                Ok(()) => read_side(&outgoing, &mut bridge.to_incoming, &mut bridge.out_recv, &mut scratch, "outgoing"),
                Err(err) => poll_failed(bridge, err),
            },
            _ = tokio::time::sleep(Duration::from_millis(PUMP_TICK_MS)) => true,
        };

        if !keep_going {
            break;
        }
    }
    // Both halves drop here, closing the sockets.
}

fn read_side(
    stream: &TcpStream,
    buf: &mut BytesMut,
    recv: &mut u64,
    scratch: &mut [u8],
    side: &str,
) -> bool {
    match stream.try_read(scratch) {
        Ok(0) => false,
        Ok(n) => {
            buf.extend_from_slice(&scratch[..n]);
            *recv += n as u64;
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(err) => {
            warn!(side, error = %err, "read error");
            false
        }
    }
}

fn write_side(stream: &TcpStream, buf: &mut BytesMut, sent: &mut u64, side: &str) -> bool {
    match stream.try_write(buf) {
        Ok(0) => false,
        Ok(n) => {
            *sent += n as u64;
            buf.advance(n);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(err) => {
            warn!(side, error = %err, "write error");
            false
        }
    }
}

fn poll_failed(bridge: &mut Bridge, err: std::io::Error) -> bool {
    bridge.set_error(format!("poll() error:  {err}"));
    false
}
