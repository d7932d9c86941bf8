//! Proxy listener and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C (or when the future given to
//! [`Server::serve_with_shutdown`] resolves) the server:
//! 1. Stops accepting new connections.
//! 2. Asks every open connection to finish its in-flight requests and close.
//! 3. Waits up to the shutdown timeout for that to happen.
//!
//! Upgraded connections (WebSocket and the like) leave hyper's connection
//! tasks once the `101` is sent; their relays are tracked separately and
//! share the same deadline.
//!
//! Connections or relays still open after the timeout are aborted and
//! [`Error::ShutdownTimeout`] is returned, so a stuck client or a hung tap
//! cannot keep the process alive forever.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::router::Router;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

enum Listen {
    Addr(SocketAddr),
    Bound(TcpListener),
}

/// The proxy server.
pub struct Server {
    listen: Listen,
    shutdown_timeout: Duration,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// ```rust,no_run
    /// use wiretap::Server;
    /// let server = Server::bind("0.0.0.0:3000")?;
    /// # Ok::<(), wiretap::Error>(())
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let addr = addr.parse().map_err(|source| Error::InvalidAddress {
            addr: addr.to_owned(),
            source,
        })?;
        Ok(Self {
            listen: Listen::Addr(addr),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    /// Serves on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listen: Listen::Bound(listener),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// How long shutdown waits for open connections to drain.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Proxies connections through `router` until SIGTERM or Ctrl-C.
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Proxies connections through `router` until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, router: Router, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await?,
            Listen::Bound(listener) => listener,
        };
        let local = listener.local_addr()?;
        let router = Arc::new(router);

        info!(addr = %local, "wiretap listening");

        let (closing_tx, closing_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Checked first so a shutdown stops accepting even when more
                // connections are queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let mut closing = closing_rx.clone();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        let svc = service_fn(move |req| {
                            let router = Arc::clone(&router);
                            async move { Ok::<_, Infallible>(router.dispatch(req, peer).await) }
                        });

                        let builder = ConnBuilder::new(TokioExecutor::new());
                        let conn = builder.serve_connection_with_upgrades(io, svc);
                        tokio::pin!(conn);

                        let result = tokio::select! {
                            res = conn.as_mut() => res,
                            _ = closing.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.as_mut().await
                            }
                        };
                        if let Err(e) = result {
                            debug!(%peer, "connection error: {e}");
                        }
                    });
                }

                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        let _ = closing_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let drain = async { while tasks.join_next().await.is_some() {} };
        if tokio::time::timeout_at(deadline, drain).await.is_err() {
            warn!(remaining = tasks.len(), timeout = ?self.shutdown_timeout, "connections did not drain");
            tasks.abort_all();
            router.relays().take().abort_all();
            return Err(Error::ShutdownTimeout(self.shutdown_timeout));
        }

        // No connection is left to start new relays.
        let mut relays = router.relays().take();
        if !relays.is_empty() {
            info!(open = relays.len(), "waiting for upgraded connections to close");
        }
        let drain = async { while relays.join_next().await.is_some() {} };
        if tokio::time::timeout_at(deadline, drain).await.is_err() {
            warn!(remaining = relays.len(), timeout = ?self.shutdown_timeout, "upgraded connections did not close");
            relays.abort_all();
            return Err(Error::ShutdownTimeout(self.shutdown_timeout));
        }

        info!("wiretap stopped");
        Ok(())
    }
}

// ── Upgrade relays ────────────────────────────────────────────────────────────

/// Relay tasks of upgraded connections, owned by the router so the server
/// can wait for them on shutdown.
#[derive(Default)]
pub(crate) struct Relays(Mutex<JoinSet<()>>);

impl Relays {
    pub(crate) fn spawn<F>(&self, relay: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.0.lock();
        // Reap finished relays so the set stays as large as the open ones.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(relay);
    }

    fn take(&self) -> JoinSet<()> {
        std::mem::take(&mut *self.0.lock())
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or Ctrl-C the process receives.
/// On Windows only Ctrl-C is available.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}
