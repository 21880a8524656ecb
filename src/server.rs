//! HTTP server setup and lifecycle.
//!
//! Startup order is strict, each step gated on the previous one:
//! telemetry bootstrap → instruments → listener bind → serve.
//! Shutdown: trigger → stop accepting → drain (bounded, then force-close)
//! → telemetry flush.

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::Service;

use crate::config::{Config, ConfigError};
use crate::observability::http::HttpInstrumentation;
use crate::observability::metrics::{InstrumentError, SpeedtestInstruments};
use crate::observability::spans::OtelSpanFactory;
use crate::observability::telemetry::{init_telemetry, TelemetryError, TelemetryHandle};
use crate::service::{create_router, AppState};
use crate::shutdown::{wait_for_shutdown, Phase, ShutdownOutcome};

/// Pause after a failed `accept` so a full file table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// A bound listener plus the router it will serve.
pub struct WebhookServer {
    listener: TcpListener,
    router: Router,
    grace: Duration,
    phase: watch::Sender<Phase>,
}

impl std::fmt::Debug for WebhookServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("grace", &self.grace)
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}

impl WebhookServer {
    /// Bind the webhook listener.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to listen on; port 0 picks an ephemeral port
    /// * `router` - Application router served on every connection
    /// * `grace` - How long in-flight requests may run after shutdown is requested
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] when the address is unavailable (port in use,
    /// no such interface). Failing here is fatal to startup.
    pub async fn bind(
        addr: SocketAddr,
        router: Router,
        grace: Duration,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let (phase, _) = watch::channel(Phase::Running);
        Ok(Self {
            listener,
            router,
            grace,
            phase,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Observe Running → Draining → Stopped transitions.
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Serve until `shutdown_rx` fires, then drain for at most the grace period.
    ///
    /// Each connection runs on its own task. On shutdown the listener is
    /// closed and every connection is asked to finish its current request.
    /// Connections still open when the grace period expires are aborted, so
    /// no request completes after this returns.
    ///
    /// # Returns
    ///
    /// [`ShutdownOutcome::Graceful`] when every connection closed in time,
    /// [`ShutdownOutcome::TimedOut`] when some had to be aborted.
    pub async fn run(
        self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<ShutdownOutcome, ServerError> {
        let Self {
            listener,
            router,
            grace,
            phase,
        } = self;

        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Webhook server listening");

        let mut connections = JoinSet::new();
        let shutdown = wait_for_shutdown(shutdown_rx.clone());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tracing::trace!(remote = %remote, "Accepted connection");
                        connections.spawn(serve_connection(
                            stream,
                            router.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_connection_exit(joined);
                }
            }
        }

        drop(listener);
        phase.send_replace(Phase::Draining);
        tracing::info!(
            grace = ?grace,
            open_connections = connections.len(),
            "Shutdown signal received, draining in-flight requests"
        );

        let drain = async {
            while let Some(joined) = connections.join_next().await {
                log_connection_exit(joined);
            }
        };
        let outcome = match tokio::time::timeout(grace, drain).await {
            Ok(()) => ShutdownOutcome::Graceful,
            Err(_) => {
                tracing::warn!(
                    grace = ?grace,
                    open_connections = connections.len(),
                    "Grace period expired, closing open connections"
                );
                connections.abort_all();
                while connections.join_next().await.is_some() {}
                ShutdownOutcome::TimedOut
            }
        };

        phase.send_replace(Phase::Stopped);
        tracing::info!(outcome = ?outcome, "Server stopped");
        Ok(outcome)
    }
}

/// Serve HTTP/1.1 on one connection until the peer closes it or shutdown
/// has been requested and the current request is answered.
async fn serve_connection(stream: TcpStream, router: Router, shutdown_rx: watch::Receiver<bool>) {
    let service = service_fn(move |request: hyper::Request<Incoming>| router.clone().call(request));
    let connection = http1::Builder::new()
        .timer(TokioTimer::new())
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        () = wait_for_shutdown(shutdown_rx) => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        // Peers hanging up mid-request are routine.
        if !e.is_incomplete_message() {
            tracing::debug!(error = %e, "Connection error");
        }
    }
}

fn log_connection_exit(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Connection task panicked");
        }
    }
}

/// Errors that stop the service from starting or finishing cleanly.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("failed to create instruments: {0}")]
    Instruments(#[from] InstrumentError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Build the router from the telemetry handle's providers.
pub fn build_app(config: &Config, telemetry: &TelemetryHandle) -> Result<Router, InstrumentError> {
    let meter = telemetry.meter();
    let instruments = SpeedtestInstruments::from_meter(&meter)?;
    let spans = Arc::new(OtelSpanFactory::new(telemetry.tracer()));
    let http = HttpInstrumentation::new(telemetry.tracer(), &meter);

    let state = AppState::new(instruments, spans, config.max_body_bytes);
    Ok(create_router(state, http))
}

async fn serve(
    config: &Config,
    telemetry: &TelemetryHandle,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<ShutdownOutcome, StartupError> {
    let router = build_app(config, telemetry)?;
    let server = WebhookServer::bind(config.listen_addr()?, router, config.shutdown_grace()).await?;
    Ok(server.run(shutdown_rx).await?)
}

/// Combine the serve result with the telemetry flush result.
///
/// A flush failure is never dropped, even when serving also failed.
pub fn exit_result(
    served: Result<ShutdownOutcome, StartupError>,
    flushed: Result<(), TelemetryError>,
) -> anyhow::Result<ShutdownOutcome> {
    match (served, flushed) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Err(serve_err), Ok(())) => Err(serve_err.into()),
        (Ok(_), Err(flush_err)) => Err(flush_err.into()),
        (Err(serve_err), Err(flush_err)) => Err(anyhow::Error::new(serve_err)
            .context(format!("telemetry flush also failed: {flush_err}"))),
    }
}

/// Run the webhook service until `shutdown_rx` fires.
///
/// Startup runs config validation, telemetry bootstrap, instrument creation
/// and the listener bind in that order, each gated on the previous one.
/// Telemetry is flushed on every path once it has been bootstrapped,
/// including startup failures after bootstrap.
///
/// # Arguments
///
/// * `config` - Parsed process configuration
/// * `shutdown_rx` - Trigger that starts the drain when it flips to `true`
///
/// # Returns
///
/// How the drain ended, or the startup, serve and flush errors joined together.
pub async fn run_server(
    config: Config,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<ShutdownOutcome> {
    config.validate()?;
    let telemetry = init_telemetry(&config.telemetry()?)?;

    let served = serve(&config, &telemetry, shutdown_rx).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "Webhook server failed");
    }

    let flushed = telemetry.shutdown(config.telemetry_flush_timeout()).await;
    if let Err(e) = &flushed {
        tracing::error!(error = %e, "Telemetry shutdown failed");
    }

    exit_result(served, flushed)
}
