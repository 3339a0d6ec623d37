//! HTTP/WS serving
//!
//! Both servers share one accept loop: plain TCP or TLS through
//! `tokio-rustls`, each connection served by hyper with upgrade support so
//! axum's WebSocket extractor works. A supervisor rebinds and restarts the
//! loop 5s after a panic; orderly shutdown drains with a short grace.

pub mod consumer;
pub mod producer;
pub mod session;

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Grace given to in-flight connections on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Delay before a panicked accept loop is restarted.
const SUPERVISOR_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Peer address of the connection, injected as a request extension.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// A bound, supervised HTTP listener.
pub struct HttpServer {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HttpServer {
    /// Bind `addr` and start serving `app`. Bind failures surface
    /// immediately — the process exits non-zero on a port conflict instead
    /// of limping along.
    pub async fn spawn(
        name: &'static str,
        addr: SocketAddr,
        app: Router,
        tls: Option<tokio_rustls::TlsAcceptor>,
    ) -> Result<Self, ServeError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServeError::Bind { addr, source })?;
        let local_addr = listener.local_addr().unwrap_or(addr);
        info!(server = name, %local_addr, tls = tls.is_some(), "listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(name, addr, listener, app, tls, shutdown_rx));

        Ok(Self {
            name,
            local_addr,
            shutdown: shutdown_tx,
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close remaining connections after the grace
    /// period.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().expect("server task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!(server = self.name, "stopped");
    }
}

/// Run the accept loop, restarting it after a delay when it panics. A
/// panicked loop lost its listener, so the supervisor rebinds.
async fn supervise(
    name: &'static str,
    addr: SocketAddr,
    listener: TcpListener,
    app: Router,
    tls: Option<tokio_rustls::TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut listener = Some(listener);
    loop {
        let bound = match listener.take() {
            Some(l) => l,
            None => match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(server = name, error = %err, "rebind failed, retrying");
                    tokio::time::sleep(SUPERVISOR_RESTART_DELAY).await;
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            },
        };

        let loop_task = tokio::spawn(accept_loop(
            bound,
            app.clone(),
            tls.clone(),
            shutdown.clone(),
        ));
        match loop_task.await {
            Ok(()) => return,
            Err(err) => {
                error!(server = name, error = %err, "accept loop died, restarting");
            }
        }

        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(SUPERVISOR_RESTART_DELAY).await;
        if *shutdown.borrow() {
            return;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    app: Router,
    tls: Option<tokio_rustls::TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        app.clone(),
                        tls.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    tls: Option<tokio_rustls::TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let service = TowerToHyperService::new(app.layer(axum::Extension(PeerAddr(peer))));
    let builder = ConnBuilder::new(TokioExecutor::new());

    let serve = async {
        let result = match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    builder
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                        .await
                }
                Err(err) => {
                    debug!(%peer, error = %err, "TLS handshake failed");
                    return;
                }
            },
            None => {
                builder
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .await
            }
        };
        if let Err(err) = result {
            debug!(%peer, error = %err, "connection error");
        }
    };

    tokio::select! {
        _ = serve => {}
        _ = async {
            let _ = shutdown.wait_for(|stop| *stop).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            debug!(%peer, "connection dropped at shutdown");
        }
    }
}
