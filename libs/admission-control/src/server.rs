use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::{BoxError, Router};
use axum_server::Handle;
use axum_server::accept::DefaultAcceptor;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower::timeout::TimeoutLayer;
use tracing::{Instrument, Span, debug, error, info};

use crate::conn::DeadlineAcceptor;
use crate::error::TransportError;
use crate::middleware::with_request_logging;
use crate::tls::{load_tls_config, watch_tls_files};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Name the webhook Service is reached by, reported in logs.
    pub host: String,
    /// `None` serves plain HTTP.
    pub tls: Option<TlsPaths>,
    /// Applied to the TLS handshake, the first read on a connection,
    /// reading request headers, HTTP/2 keep-alive pings, stalled writes and
    /// processing a whole request.
    pub timeout: Duration,
    pub grace_period: Duration,
    /// Reload the certificate and key when they change on disk.
    pub watch_tls: bool,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            host: "localhost".to_owned(),
            tls: None,
            timeout: DEFAULT_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            watch_tls: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Configured,
    Listening,
    Draining,
    Stopped,
}

/// HTTPS server for admission handlers.
pub struct AdmissionServer {
    config: ServerConfig,
    tls: Option<RustlsConfig>,
    handle: Handle<SocketAddr>,
    state: Arc<watch::Sender<ServerState>>,
    started: AtomicBool,
    span: Span,
}

impl AdmissionServer {
    /// Load the TLS material and freeze the configuration. Failing to load
    /// the key pair is fatal for the process.
    pub fn new(config: ServerConfig, span: Span) -> Result<Self, TransportError> {
        let (state, _) = watch::channel(ServerState::Created);

        let tls = match &config.tls {
            Some(paths) => {
                let tls_config = load_tls_config(&paths.cert_path, &paths.key_path)?;
                Some(RustlsConfig::from_config(Arc::new(tls_config)))
            }
            None => None,
        };

        state.send_replace(ServerState::Configured);
        info!(
            parent: &span,
            addr = %config.addr,
            host = config.host.as_str(),
            tls = tls.is_some(),
            "server configured"
        );

        Ok(Self {
            config,
            tls,
            handle: Handle::new(),
            state: Arc::new(state),
            started: AtomicBool::new(false),
            span,
        })
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// The bound address, once the listener is up. `None` if binding failed.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;
            addr = self.handle.listening() => addr,
            _ = state.wait_for(|state| *state == ServerState::Stopped) => None,
        }
    }

    /// Serve `router` until `shutdown` is cancelled, then drain in-flight
    /// requests for at most the grace period before closing what is left.
    ///
    /// Returns once the server is stopped. Calling it again afterwards is a
    /// no-op.
    pub async fn run(&self, router: Router, shutdown: CancellationToken) -> Result<(), TransportError> {
        if *self.state.borrow() == ServerState::Stopped {
            debug!(parent: &self.span, "server already stopped");
            return Ok(());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyRunning);
        }

        let app = with_request_logging(with_request_timeout(router, self.config.timeout), self.span.clone());

        let mut tasks = vec![self.spawn_listening_notifier(), self.spawn_shutdown(shutdown)];
        if let (Some(rustls_config), Some(paths), true) =
            (&self.tls, &self.config.tls, self.config.watch_tls)
        {
            let span = self.span.clone();
            let watcher = watch_tls_files(paths.clone(), rustls_config.clone(), span.clone());
            tasks.push(tokio::spawn(
                async move {
                    if let Err(e) = watcher.await {
                        error!(error = %e, "certificate watcher stopped");
                    }
                }
                .instrument(span),
            ));
        }

        let timeout = self.config.timeout;
        let served = match &self.tls {
            Some(rustls_config) => {
                let tls = RustlsAcceptor::new(rustls_config.clone()).handshake_timeout(timeout);
                let mut server = axum_server::bind(self.config.addr)
                    .acceptor(DeadlineAcceptor::new(tls, timeout))
                    .handle(self.handle.clone());
                configure_http(server.http_builder(), timeout);
                server.serve(app.into_make_service()).await
            }
            None => {
                let mut server = axum_server::bind(self.config.addr)
                    .acceptor(DeadlineAcceptor::new(DefaultAcceptor::new(), timeout))
                    .handle(self.handle.clone());
                configure_http(server.http_builder(), timeout);
                server.serve(app.into_make_service()).await
            }
        };

        for task in tasks {
            task.abort();
        }
        self.state.send_replace(ServerState::Stopped);

        match served {
            Ok(()) => {
                info!(parent: &self.span, "server stopped");
                Ok(())
            }
            Err(e) => {
                error!(parent: &self.span, error = %e, "server stopped on error");
                Err(TransportError::Serve(self.config.addr.to_string(), e))
            }
        }
    }

    fn spawn_listening_notifier(&self) -> JoinHandle<()> {
        let handle = self.handle.clone();
        let state = self.state.clone();
        let host = self.config.host.clone();
        let tls = self.tls.is_some();

        tokio::spawn(
            async move {
                let Some(addr) = handle.listening().await else {
                    return;
                };
                if mark_listening(&state) {
                    info!(%addr, host = host.as_str(), tls, "server listening");
                }
            }
            .instrument(self.span.clone()),
        )
    }

    fn spawn_shutdown(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let handle = self.handle.clone();
        let state = self.state.clone();
        let grace_period = self.config.grace_period;

        tokio::spawn(
            async move {
                shutdown.cancelled().await;
                handle.graceful_shutdown(Some(grace_period));
                state.send_replace(ServerState::Draining);
                info!(
                    grace_period_secs = grace_period.as_secs_f64(),
                    connections = handle.connection_count(),
                    "draining connections"
                );
            }
            .instrument(self.span.clone()),
        )
    }
}

/// Move from `Configured` to `Listening`. A shutdown that started before the
/// bind completed keeps its state.
fn mark_listening(state: &watch::Sender<ServerState>) -> bool {
    state.send_if_modified(|state| match state {
        ServerState::Configured => {
            *state = ServerState::Listening;
            true
        }
        _ => false,
    })
}

/// Bound header reads on HTTP/1 and idle connections on HTTP/2.
fn configure_http(builder: &mut Builder<TokioExecutor>, timeout: Duration) {
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeout);
    builder
        .http2()
        .timer(TokioTimer::new())
        .keep_alive_interval(timeout)
        .keep_alive_timeout(timeout);
}

/// Answer 408 for requests that take longer than `timeout` end to end.
fn with_request_timeout(router: Router, timeout: Duration) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(|_: BoxError| async {
                StatusCode::REQUEST_TIMEOUT
            }))
            .layer(TimeoutLayer::new(timeout)),
    )
}
