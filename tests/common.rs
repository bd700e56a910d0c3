#![allow(dead_code)]

use concentrator::{AccountingSink, Config, Engine, MemorySink};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};

pub struct TestEngine {
    pub addr: SocketAddr,
    pub sink: Arc<MemorySink>,
    shutdown_tx: watch::Sender<()>,
    finished_rx: oneshot::Receiver<()>,
}

pub async fn start_engine(mut config: Config) -> TestEngine {
    config.listen_port = 0;
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(config, Arc::clone(&sink) as Arc<dyn AccountingSink>);
    let handle = engine.start().await.expect("engine start");
    let addr = handle.ready_rx.await.expect("engine ready");
    TestEngine {
        addr,
        sink,
        shutdown_tx: handle.shutdown_tx,
        finished_rx: handle.finished_rx,
    }
}

impl TestEngine {
    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(("::1", self.addr.port()))
            .await
            .expect("connect to engine")
    }

    /// Polls the sink until `n` records have landed.
    pub async fn wait_for_records(&self, n: usize, deadline: Duration) -> Vec<Map<String, Value>> {
        let start = std::time::Instant::now();
        loop {
            let records = self.sink.records();
            if records.len() >= n {
                return records;
            }
            if start.elapsed() > deadline {
                panic!(
                    "expected {n} accounting records, got {} within {deadline:?}",
                    records.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.finished_rx.await;
    }
}

/// Serializes a request envelope the way clients send it: one JSON object
/// terminated by a newline.
pub fn envelope(fields: &[(&str, &str)]) -> String {
    let mut object = Map::new();
    for (key, value) in fields {
        object.insert(key.to_string(), Value::String(value.to_string()));
    }
    format!("{}\n", Value::Object(object))
}

pub async fn send_envelope(stream: &mut TcpStream, fields: &[(&str, &str)]) {
    stream
        .write_all(envelope(fields).as_bytes())
        .await
        .expect("send envelope");
}

pub fn transfer(record: &Map<String, Value>, direction: &str, counter: &str) -> u64 {
    record["Transfer"][direction][counter]
        .as_u64()
        .expect("transfer counter")
}

pub fn record_error(record: &Map<String, Value>) -> Option<&str> {
    record.get("Error").and_then(Value::as_str)
}
