//! Local SOCKS5 bridges for tunnel-only engines
//!
//! A bridge listens on an ephemeral loopback port, terminates SOCKS5 from the
//! client side and forwards each accepted connection through a
//! [`BridgeUpstream`]. [`BridgeRegistry`] keeps at most one bridge per proxy
//! URL.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    io,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{InstanceCache, Lookup},
    connect::{BoxedStream, ConnectError},
    relay::{dial_with_recover, free_port, relay},
    socks::{
        server::{accept_handshake, send_reply, BridgeReply},
        Destination, ReplyCode,
    },
};

const BIND_ATTEMPTS: usize = 3;

/// Where a bridge sends the connections it accepts
#[async_trait]
pub trait BridgeUpstream: Send + Sync {
    /// Opens a tunnel to `destination`
    async fn connect(&self, destination: &Destination) -> Result<BoxedStream, ConnectError>;
}

/// A running bridge
///
/// The accept loop stops on [`shutdown`](BridgeServer::shutdown) or when the
/// last handle is dropped; relays already in progress keep running.
#[derive(Debug)]
pub struct BridgeServer {
    url: String,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeServer {
    /// Binds a free loopback port and spawns the accept loop
    pub async fn start(
        url: &str,
        upstream: Arc<dyn BridgeUpstream>,
        reply: BridgeReply,
    ) -> io::Result<Arc<Self>> {
        let listener = bind_free_port().await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(accept_loop(listener, upstream, reply, shutdown.clone()));
        tracing::info!(url = %url, port = local_addr.port(), "bridge started");

        Ok(Arc::new(Self {
            url: url.to_owned(),
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stops accepting; safe to call any number of times
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(url = %self.url, port = self.port(), "bridge closing");
            self.shutdown.cancel();
        }
    }

    /// Waits for the accept loop to exit after [`shutdown`](Self::shutdown)
    pub async fn stopped(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(url = %self.url, error = %e, "bridge accept loop failed");
            }
        }
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn bind_free_port() -> io::Result<TcpListener> {
    let mut attempt = 1;
    loop {
        let port = free_port()?;
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                tracing::debug!(port, attempt, "bridge port taken, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    upstream: Arc<dyn BridgeUpstream>,
    reply: BridgeReply,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::trace!(peer = %peer, "bridge accepted connection");
                tokio::spawn(handle_conn(stream, upstream.clone(), reply));
            }
            Err(e) => tracing::warn!(error = %e, "bridge accept failed"),
        }
    }
    tracing::debug!("bridge accept loop stopped");
}

async fn handle_conn(mut client: TcpStream, upstream: Arc<dyn BridgeUpstream>, reply: BridgeReply) {
    let destination = match accept_handshake(&mut client).await {
        Ok(destination) => destination,
        Err(e) => {
            tracing::debug!(error = %e, "bridge handshake failed");
            return;
        }
    };

    if reply == BridgeReply::Eager {
        if let Err(e) = send_reply(&mut client, ReplyCode::Succeeded).await {
            tracing::debug!(error = %e, "bridge reply failed");
            return;
        }
    }

    let tunnel = match dial_with_recover(upstream.connect(&destination)).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            tracing::warn!(target = %destination, error = %e, "bridge upstream dial failed");
            if reply == BridgeReply::Deferred {
                if let Err(e) = send_reply(&mut client, failure_reply(&e)).await {
                    tracing::debug!(error = %e, "bridge failure reply not delivered");
                }
            }
            return;
        }
    };

    if reply == BridgeReply::Deferred {
        if let Err(e) = send_reply(&mut client, ReplyCode::Succeeded).await {
            tracing::debug!(error = %e, "bridge reply failed");
            return;
        }
    }

    tracing::debug!(target = %destination, "bridge relaying");
    match relay(client, tunnel).await {
        Ok(stats) => tracing::debug!(
            target = %destination,
            sent = stats.a_to_b,
            received = stats.b_to_a,
            "bridge relay finished"
        ),
        Err(e) => tracing::debug!(target = %destination, error = %e, "bridge relay ended"),
    }
}

fn failure_reply(err: &ConnectError) -> ReplyCode {
    match err {
        ConnectError::IO(io) => ReplyCode::from_io_error(io),
        ConnectError::Timeout(_) => ReplyCode::TtlExpired,
        ConnectError::DnsNameNotResolved => ReplyCode::HostUnreachable,
        _ => ReplyCode::ServerFailure,
    }
}

/// Running bridges keyed by the exact proxy URL they serve
#[derive(Default)]
pub struct BridgeRegistry {
    bridges: InstanceCache<Arc<BridgeServer>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bridge for `url`, running `start` only if none is cached.
    ///
    /// Concurrent calls for one URL share a single `start`. A bridge closed
    /// before its `start` finished is shut down and reported as
    /// [`ConnectError::ClosedWhileStarting`].
    pub async fn get_or_start<F, Fut, E>(&self, url: &str, start: F) -> Result<Arc<BridgeServer>, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Arc<BridgeServer>, E>>,
        E: From<ConnectError>,
    {
        match self.bridges.get_or_try_init(url, start).await? {
            Lookup::Ready(bridge) => Ok(bridge),
            Lookup::Closed { orphan } => {
                if let Some(bridge) = orphan {
                    bridge.shutdown();
                }
                Err(ConnectError::ClosedWhileStarting("bridge").into())
            }
        }
    }

    pub async fn get(&self, url: &str) -> Option<Arc<BridgeServer>> {
        self.bridges.get(url).await
    }

    /// Local SOCKS5 port of the bridge serving `url`
    pub async fn port(&self, url: &str) -> Option<u16> {
        self.get(url).await.map(|bridge| bridge.port())
    }

    /// Stops and forgets the bridge for `url`.
    ///
    /// Removal and shutdown happen under one lock, so no caller can obtain
    /// the bridge once it is closing. Unknown URLs are a no-op.
    pub async fn close(&self, url: &str) -> bool {
        self.bridges
            .remove_with(url, |bridge| bridge.shutdown())
            .await
            .is_some()
    }

    pub async fn close_all(&self) {
        for bridge in self.bridges.drain().await {
            bridge.shutdown();
        }
    }

    pub async fn len(&self) -> usize {
        self.bridges.len().await
    }
}
