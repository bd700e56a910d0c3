//! The bridge record: one inbound/outbound socket pair and its accounting
//! state. The record is owned by exactly one component at a time (ingress,
//! hand-off, service queue, worker, reaper); ownership transfer over the
//! completion channel is what synchronizes worker and scheduler.

use bytes::BytesMut;
use serde_json::{Map, Value};
use std::time::Instant;
use tokio::net::TcpStream;

use crate::config::Config;
use crate::engine::request::ParsedRequest;

#[derive(Debug)]
pub struct Bridge {
    /// Accepted client socket; open until the worker exits.
    pub incoming: Option<TcpStream>,
    /// Backend socket; open only between a successful connect and worker exit.
    pub outgoing: Option<TcpStream>,

    pub service: String,
    pub throttle: usize,

    /// Pinned backend host, or the host the worker ends up connecting to.
    pub server: String,
    /// Kept as a string: resolution decides whether it names a real port.
    pub port: String,
    pub load_balancer: String,
    pub service_junction: String,

    /// Bytes read from outgoing, awaiting write to incoming.
    pub to_incoming: BytesMut,
    /// Bytes read from incoming, awaiting write to outgoing.
    pub to_outgoing: BytesMut,

    pub in_recv: u64,
    pub in_send: u64,
    pub out_recv: u64,
    pub out_send: u64,

    pub start_time: Instant,
    pub active_time: Option<Instant>,
    pub end_time: Option<Instant>,

    /// Flat mirror of the request, augmented with peer IP, load, transfer
    /// stats, durations and error; serialized to the accounting sink on reap.
    pub info: Map<String, Value>,
}

impl Bridge {
    pub fn new(
        incoming: TcpStream,
        request: ParsedRequest,
        peer_ip: String,
        config: &Config,
    ) -> Self {
        let (server, port, load_balancer, service_junction) = match request.server {
            Some((server, port)) => (server, port, String::new(), String::new()),
            None => (
                String::new(),
                config.junction_port.to_string(),
                config.load_balancer.clone(),
                config.service_junction.clone(),
            ),
        };

        let mut info = Map::new();
        for (key, value) in &request.fields {
            info.insert(key.clone(), Value::String(value.clone()));
        }
        info.insert("IP".to_string(), Value::String(peer_ip));

        Self {
            incoming: Some(incoming),
            outgoing: None,
            service: request.service,
            throttle: request.throttle,
            server,
            port,
            load_balancer,
            service_junction,
            to_incoming: BytesMut::new(),
            to_outgoing: BytesMut::new(),
            in_recv: 0,
            in_send: 0,
            out_recv: 0,
            out_send: 0,
            start_time: Instant::now(),
            active_time: None,
            end_time: None,
            info,
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.info
            .insert("Error".to_string(), Value::String(message.into()));
    }

    pub fn error(&self) -> Option<&str> {
        self.info.get("Error").and_then(Value::as_str)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn explicit_backend_skips_configured_lists() {
        let (bridge, _client) = testing::bridge_pair("svc", 2, "db1", "5432").await;
        assert_eq!(bridge.server, "db1");
        assert_eq!(bridge.port, "5432");
        assert!(bridge.load_balancer.is_empty());
        assert!(bridge.service_junction.is_empty());
        assert_eq!(bridge.info.get("IP"), Some(&json!("127.0.0.1")));
    }

    #[tokio::test]
    async fn absent_backend_copies_lists_and_junction_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let request =
            ParsedRequest::parse(r#"{"Service":"svc","Throttle":"1"}"#).unwrap();
        let config = Config {
            load_balancer: "lb1,lb2".to_string(),
            service_junction: "sj1".to_string(),
            ..Config::default()
        };
        let bridge = Bridge::new(accepted, request, "::1".to_string(), &config);

        assert!(bridge.server.is_empty());
        assert_eq!(bridge.port, "5864");
        assert_eq!(bridge.load_balancer, "lb1,lb2");
        assert_eq!(bridge.service_junction, "sj1");
    }
}
