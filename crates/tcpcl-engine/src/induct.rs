//! Inbound duct: accept loop plus one session task per connection.
//!
//! Each connection lives in the connection table until its task ends. On
//! shutdown the accept loop stops, every connection is told to stop and
//! joined, and only then is the listening socket released.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::bundle::AcquisitionSink;
use crate::session::{Session, SessionParams};

/// Pending connections the kernel will queue.
const LISTEN_BACKLOG: i32 = 5;

/// A live inbound connection.
pub struct Connection {
    pub peer_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Connection id → connection.
pub type ConnectionTable = Arc<DashMap<u64, Connection>>;

pub fn new_connection_table() -> ConnectionTable {
    Arc::new(DashMap::new())
}

pub struct Induct {
    listener: TcpListener,
    params: SessionParams,
    sink: Arc<dyn AcquisitionSink>,
    connections: ConnectionTable,
    next_id: u64,
    shutdown: broadcast::Receiver<()>,
}

impl Induct {
    /// Bind the listening socket. Must be called inside a tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        params: SessionParams,
        sink: Arc<dyn AcquisitionSink>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = make_listener(addr)
            .with_context(|| format!("failed to create listener on {addr}"))?;
        let listener =
            TcpListener::from_std(listener).context("failed to convert to tokio TcpListener")?;
        Ok(Self {
            listener,
            params,
            sink,
            connections: new_connection_table(),
            next_id: 0,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared view of the live connections.
    pub fn connections(&self) -> ConnectionTable {
        self.connections.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        let local_addr = self.listener.local_addr()?;
        tracing::info!(%local_addr, framing = ?self.params.framing, "induct listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(%local_addr, "induct shutting down");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_connection(stream, peer_addr),
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
            }
        }

        close_all(&self.connections).await;
        drop(self.listener);
        tracing::info!(%local_addr, "induct stopped");
        Ok(())
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(%peer_addr, id, "accepted connection");

        let (stop, stop_rx) = watch::channel(false);
        self.connections.insert(
            id,
            Connection {
                peer_addr,
                stop,
                task: None,
            },
        );

        let connections = self.connections.clone();
        let params = self.params.clone();
        let sink = self.sink.clone();
        let task = tokio::spawn(async move {
            serve_connection(stream, peer_addr, params, sink, stop_rx).await;
            connections.remove(&id);
        });

        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.task = Some(task);
        }
    }
}

/// Stop every connection and wait for its task.
pub async fn close_all(connections: &ConnectionTable) {
    let ids: Vec<u64> = connections.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        let Some((_, mut conn)) = connections.remove(&id) else {
            continue;
        };
        let _ = conn.stop.send(true);
        if let Some(task) = conn.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(peer_addr = %conn.peer_addr, error = %e, "connection task failed");
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    params: SessionParams,
    sink: Arc<dyn AcquisitionSink>,
    mut stop: watch::Receiver<bool>,
) {
    let mut session = tokio::select! {
        _ = stop.changed() => return,
        established = Session::establish(stream, &params, sink) => match established {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "contact header exchange failed");
                return;
            }
        },
    };

    let info = session.info();
    tracing::info!(
        %peer_addr,
        peer_eid = info.peer.eid.as_deref().unwrap_or("-"),
        keepalive = info.keepalive,
        "inbound session established"
    );

    let outcome = tokio::select! {
        _ = stop.changed() => None,
        outcome = session.wait() => Some(outcome),
    };
    session.close().await;

    match outcome {
        None => tracing::debug!(%peer_addr, "inbound session stopped"),
        Some(Ok(reason)) => tracing::info!(%peer_addr, ?reason, "inbound session ended"),
        Some(Err(e)) => tracing::warn!(%peer_addr, error = %e, "inbound session failed"),
    }
}

fn make_listener(addr: SocketAddr) -> Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).context("bind()")?;
    socket.listen(LISTEN_BACKLOG).context("listen()")?;

    Ok(socket.into())
}
