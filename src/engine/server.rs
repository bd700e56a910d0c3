//! The engine value: listening socket, scheduler task, accept loop. All of
//! the shared state the daemon used to keep in globals lives here and is
//! passed to workers by shared reference.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};

use crate::accounting::AccountingSink;
use crate::config::Config;
use crate::engine::handoff::Handoff;
use crate::engine::ingress;
use crate::engine::scheduler::Scheduler;
use crate::error::EngineResult;

pub struct Engine {
    config: Config,
    sink: Arc<dyn AccountingSink>,
}

pub struct EngineHandle {
    pub shutdown_tx: watch::Sender<()>,
    pub ready_rx: oneshot::Receiver<SocketAddr>,
    pub finished_rx: oneshot::Receiver<()>,
}

impl Engine {
    pub fn new(config: Config, sink: Arc<dyn AccountingSink>) -> Self {
        Self { config, sink }
    }

    pub async fn start(&self) -> EngineResult<EngineHandle> {
        let listener = bind_listener(self.config.listen_port)?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        let config = Arc::new(self.config.clone());
        let handoff = Arc::new(Handoff::new());

        let scheduler = Scheduler::new(
            Arc::clone(&handoff),
            Arc::clone(&self.sink),
            Arc::clone(&config),
        );
        let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));
        let accept_task = tokio::spawn(accept_loop(listener, config, handoff, shutdown_rx));

        tokio::spawn(async move {
            let _ = accept_task.await;
            let _ = scheduler_task.await;
            let _ = finished_tx.send(());
        });

        let _ = ready_tx.send(addr);

        Ok(EngineHandle {
            shutdown_tx,
            ready_rx,
            finished_rx,
        })
    }
}

fn bind_listener(port: u16) -> EngineResult<TcpListener> {
    let socket = TcpSocket::new_v6()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)))?;
    let listener = socket.listen(libc::SOMAXCONN as u32)?;
    Ok(listener)
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<Config>,
    handoff: Arc<Handoff>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("acceptor shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "connection accepted");
                    tokio::spawn(ingress::handle(
                        stream,
                        Arc::clone(&config),
                        Arc::clone(&handoff),
                    ));
                }
                Err(err) if is_transient_accept_error(&err) => {
                    debug!(error = %err, "accept retried");
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}
