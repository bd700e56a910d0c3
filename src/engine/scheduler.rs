//! The scheduler: a single task that owns the service table. Each pass
//! drains the hand-off list, reaps completed bridges into accounting
//! records, promotes queued bridges while their throttle allows, and
//! garbage-collects services that have gone quiet.

use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::accounting::AccountingSink;
use crate::config::Config;
use crate::engine::bridge::Bridge;
use crate::engine::handoff::Handoff;
use crate::engine::worker;
use crate::engine::{COMPLETION_CHANNEL_DEPTH, SCHEDULER_TICK_MS};

#[derive(Default)]
struct ServiceState {
    queue: VecDeque<Bridge>,
    active: usize,
}

pub struct Scheduler {
    services: BTreeMap<String, ServiceState>,
    handoff: Arc<Handoff>,
    sink: Arc<dyn AccountingSink>,
    config: Arc<Config>,
    done_tx: mpsc::Sender<Bridge>,
    done_rx: mpsc::Receiver<Bridge>,
    stashed: Vec<Bridge>,
}

impl Scheduler {
    pub fn new(handoff: Arc<Handoff>, sink: Arc<dyn AccountingSink>, config: Arc<Config>) -> Self {
        let (done_tx, done_rx) = mpsc::channel(COMPLETION_CHANNEL_DEPTH);
        Self {
            services: BTreeMap::new(),
            handoff,
            sink,
            config,
            done_tx,
            done_rx,
            stashed: Vec::new(),
        }
    }

    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<()>) {
        info!("scheduler started");
        loop {
            if shutdown_rx.has_changed().unwrap_or(true) {
                break;
            }
            let updated = self.pass().await;
            if updated {
                continue;
            }
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = self.handoff.wait() => {}
                Some(bridge) = self.done_rx.recv() => self.stashed.push(bridge),
                _ = tokio::time::sleep(Duration::from_millis(SCHEDULER_TICK_MS)) => {}
            }
        }
        info!("scheduler stopped");
    }

    /// One scheduler pass; returns whether any bridge was promoted.
    async fn pass(&mut self) -> bool {
        for mut bridge in self.handoff.drain().await {
            bridge.info.insert("Load".to_string(), json!({}));
            bridge
                .info
                .insert("Transfer".to_string(), json!({"In": {}, "Out": {}}));
            self.services
                .entry(bridge.service.clone())
                .or_default()
                .queue
                .push_back(bridge);
        }

        let mut completed: HashMap<String, Vec<Bridge>> = HashMap::new();
        for bridge in self.stashed.drain(..) {
            completed.entry(bridge.service.clone()).or_default().push(bridge);
        }
        while let Ok(bridge) = self.done_rx.try_recv() {
            completed.entry(bridge.service.clone()).or_default().push(bridge);
        }

        let mut updated = false;
        let mut idle = Vec::new();
        for (name, svc) in self.services.iter_mut() {
            let queue_len = svc.queue.len();
            let active_before = svc.active;

            if let Some(done) = completed.remove(name) {
                for (reaped, mut bridge) in done.into_iter().enumerate() {
                    settle(&mut bridge, active_before, reaped, queue_len);
                    self.sink.emit(&bridge.info);
                    svc.active -= 1;
                }
            }

            for bridge in promote_from(&mut svc.queue, &mut svc.active) {
                debug!(service = %name, throttle = bridge.throttle, "bridge promoted");
                updated = true;
                tokio::spawn(worker::run(
                    bridge,
                    Arc::clone(&self.config),
                    self.done_tx.clone(),
                ));
            }

            if svc.active == 0 && svc.queue.is_empty() {
                idle.push(name.clone());
            }
        }

        for name in idle {
            debug!(service = %name, "service removed");
            self.services.remove(&name);
        }

        updated
    }
}

/// Scans the whole queue in FIFO order, admitting every bridge whose
/// throttle still has headroom. Deliberately does not stop at the first
/// refusal: a later bridge with a larger throttle may be admitted ahead of
/// a stuck earlier one.
fn promote_from(queue: &mut VecDeque<Bridge>, active: &mut usize) -> Vec<Bridge> {
    let mut promoted = Vec::new();
    let mut i = 0;
    while i < queue.len() {
        if *active < queue[i].throttle {
            let mut bridge = queue.remove(i).expect("index checked against len");
            bridge.active_time = Some(Instant::now());
            *active += 1;
            promoted.push(bridge);
        } else {
            i += 1;
        }
    }
    promoted
}

/// Fills in the accounting fields the reaper owes a completed bridge.
/// `active_before` counts actives at the start of the pass (the completed
/// ones included), `reaped` how many this pass already settled.
fn settle(bridge: &mut Bridge, active_before: usize, reaped: usize, queue_len: usize) {
    bridge.end_time = Some(Instant::now());

    bridge.info.insert(
        "Load".to_string(),
        json!({
            "Active": active_before - reaped - 1,
            "Queue": queue_len,
        }),
    );

    let active_at = bridge.active_time.unwrap_or(bridge.start_time);
    let end_at = bridge.end_time.unwrap_or(active_at);
    bridge.info.insert(
        "Duration (active)".to_string(),
        json!(end_at.duration_since(active_at).as_secs()),
    );
    bridge.info.insert(
        "Duration (queue)".to_string(),
        json!(active_at.duration_since(bridge.start_time).as_secs()),
    );

    bridge.info.insert(
        "Transfer".to_string(),
        json!({
            "In": {"Recv": bridge.in_recv, "Send": bridge.in_send},
            "Out": {"Recv": bridge.out_recv, "Send": bridge.out_send},
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::MemorySink;
    use crate::engine::bridge::testing::bridge_pair;
    use serde_json::Value;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn promotion_respects_throttle_in_fifo_order() {
        let mut queue = VecDeque::new();
        let mut clients = Vec::new();
        for i in 0..3 {
            let (bridge, client) = bridge_pair(&format!("b{i}"), 2, "h", "1").await;
            clients.push(client);
            queue.push_back(bridge);
        }
        let mut active = 0;

        let promoted = promote_from(&mut queue, &mut active);
        assert_eq!(promoted.len(), 2);
        assert_eq!(active, 2);
        assert_eq!(queue.len(), 1);
        assert!(promoted.iter().all(|b| b.active_time.is_some()));
        assert_eq!(promoted[0].service, "b0");
        assert_eq!(promoted[1].service, "b1");
    }

    #[tokio::test]
    async fn promotion_does_not_short_circuit_on_a_stuck_head() {
        let (small, _c1) = bridge_pair("small", 1, "h", "1").await;
        let (large, _c2) = bridge_pair("large", 3, "h", "1").await;

        let mut queue = VecDeque::from([small, large]);
        let mut active = 1;

        let promoted = promote_from(&mut queue, &mut active);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].service, "large");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].service, "small");
        assert_eq!(active, 2);
    }

    #[tokio::test]
    async fn settle_fills_load_transfer_and_durations() {
        let (mut bridge, _client) = bridge_pair("svc", 1, "h", "1").await;
        bridge.active_time = Some(bridge.start_time);
        bridge.in_recv = 5;
        bridge.in_send = 7;
        bridge.out_recv = 11;
        bridge.out_send = 13;

        settle(&mut bridge, 3, 1, 4);

        assert_eq!(bridge.info["Load"], json!({"Active": 1, "Queue": 4}));
        assert_eq!(
            bridge.info["Transfer"],
            json!({
                "In": {"Recv": 5, "Send": 7},
                "Out": {"Recv": 11, "Send": 13},
            })
        );
        assert!(bridge.info.contains_key("Duration (active)"));
        assert!(bridge.info.contains_key("Duration (queue)"));
    }

    #[tokio::test]
    async fn pass_accounts_once_and_collects_the_idle_service() {
        let handoff = Arc::new(Handoff::new());
        let sink = Arc::new(MemorySink::new());
        let config = Arc::new(Config::default());
        let mut scheduler = Scheduler::new(
            Arc::clone(&handoff),
            Arc::clone(&sink) as Arc<dyn AccountingSink>,
            config,
        );

        // A backend that refuses quickly: bind, get the port, then close.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (bridge, client) = bridge_pair("gc-me", 1, "127.0.0.1", &port.to_string()).await;
        drop(client);
        handoff.push(bridge).await;

        assert!(scheduler.pass().await, "bridge should be promoted");
        assert_eq!(scheduler.services.len(), 1);

        // The worker fails its connect and reports back; keep passing until
        // the record lands and the service is collected.
        let mut settled = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scheduler.pass().await;
            if sink.len() == 1 && scheduler.services.is_empty() {
                settled = true;
                break;
            }
        }
        assert!(settled, "expected one record and an empty service table");

        let record = &sink.records()[0];
        assert!(record
            .get("Error")
            .and_then(Value::as_str)
            .is_some_and(|e| !e.is_empty()));
        assert_eq!(record["Load"], json!({"Active": 0, "Queue": 0}));
    }
}
