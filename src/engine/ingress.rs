//! Per-connection ingress: read one request envelope, validate it, hand a
//! bridge record to the scheduler. Any failure closes the socket and drops
//! the request without accounting.

use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Config;
use crate::engine::bridge::Bridge;
use crate::engine::handoff::Handoff;
use crate::engine::request::{ParsedRequest, RequestError};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed before a full request line")]
    Eof,

    #[error(transparent)]
    Request(#[from] RequestError),
}

pub async fn handle(stream: TcpStream, config: Arc<Config>, handoff: Arc<Handoff>) {
    match admit(stream, &config).await {
        Ok(bridge) => handoff.push(bridge).await,
        // Dropping the stream on the error path closes the socket.
        Err(err) => debug!(error = %err, "request rejected"),
    }
}

async fn admit(stream: TcpStream, config: &Config) -> Result<Bridge, IngressError> {
    let peer_ip = stream.peer_addr()?.ip().to_string();

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(IngressError::Eof);
    }

    let request = ParsedRequest::parse(&line)?;

    // The client may pipeline payload bytes in the same segment as the
    // envelope; whatever the reader buffered past the newline belongs to
    // the backend and must survive the unwrap.
    let leftover = reader.buffer().to_vec();
    let stream = reader.into_inner();

    let mut bridge = Bridge::new(stream, request, peer_ip, config);
    if !leftover.is_empty() {
        bridge.to_outgoing.extend_from_slice(&leftover);
        bridge.in_recv += leftover.len() as u64;
    }
    debug!(
        service = %bridge.service,
        throttle = bridge.throttle,
        "bridge queued"
    );
    Ok(bridge)
}
