//! HTTP server lifecycle: accept loop, background sweep, shutdown.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::Request;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ProxyConfig};
use crate::handler::DavProxy;

/// Where to listen and how often to sweep.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (port 0 picks a free port).
    pub bind: SocketAddr,
    /// Interval of the abandoned-upload sweep; `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl ServerConfig {
    pub fn from_proxy_config(config: &ProxyConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            bind: config.bind_addr()?,
            sweep_interval: config.sweep_interval(),
        })
    }
}

/// A running proxy.
pub struct ProxyServer {
    /// The actual bound address.
    pub addr: SocketAddr,
    proxy: Arc<DavProxy>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<JoinHandle<()>>,
    sweep_handle: Option<JoinHandle<()>>,
}

impl ProxyServer {
    /// Binds the listener and starts serving `proxy`.
    pub async fn start(proxy: Arc<DavProxy>, config: ServerConfig) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(config.bind).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Starting WebDAV proxy");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serving = Arc::clone(&proxy);
        let server_handle = tokio::spawn(async move {
            tokio::select! {
                () = run_server(listener, serving) => {
                    debug!("Server loop ended");
                }
                _ = shutdown_rx => {
                    info!("Received shutdown signal");
                }
            }
        });

        let sweep_handle = config.sweep_interval.map(|interval| {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick fires immediately.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    proxy.sweep().await;
                }
            })
        });

        Ok(Self {
            addr,
            proxy,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
            sweep_handle,
        })
    }

    /// Base URL clients connect to.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn proxy(&self) -> &Arc<DavProxy> {
        &self.proxy
    }

    /// Stops accepting connections and waits for the accept loop to end.
    pub async fn stop(mut self) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        info!("WebDAV proxy stopped");
    }

    fn stop_sync(&mut self) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

async fn run_server(listener: TcpListener, proxy: Arc<DavProxy>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let proxy = Arc::clone(&proxy);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let proxy = Arc::clone(&proxy);
                        async move { Ok::<_, Infallible>(proxy.handle(req).await) }
                    });

                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        warn!(peer = %peer_addr, error = %e, "HTTP connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
