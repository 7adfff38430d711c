//! webtermd - the browser shell daemon.
//!
//! Serves the control plane and per-tab streaming WebSockets, owns the
//! session registry, and reaps idle sessions. Shells run as the invoking
//! OS user; a startup token standing in for the external credential layer
//! is printed once at boot.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webterm::api::auth::{TicketStore, TokenStore};
use webterm::api::{self, AppState};
use webterm::config::{self, ServerConfig};
use webterm::session::SessionRegistry;
use webterm::shutdown::ShutdownCoordinator;
use webterm::tls;

/// How often the idle-session reaper runs.
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How long shutdown waits for streaming clients to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "webtermd", version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file (default: ~/.webterm/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Fixed auth token for the invoking user (generated when omitted)
    #[arg(long, env = "WEBTERM_TOKEN")]
    token: Option<String>,
}

#[derive(Error, Debug)]
enum ServerError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Tls(#[from] tls::TlsError),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webterm=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match args.config.clone().or_else(ServerConfig::default_path) {
        Some(path) => ServerConfig::load(&path)?.unwrap_or_default(),
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    tracing::info!("webtermd starting");

    // Stand-in for the external credential layer: one token for the
    // invoking OS user, printed once.
    let tokens = Arc::new(TokenStore::new(config.token_ttl()));
    let user = std::env::var("USER").unwrap_or_else(|_| "operator".to_string());
    let token = match &args.token {
        Some(fixed) => {
            tokens.register(fixed, &user);
            fixed.clone()
        }
        None => tokens.issue(&user),
    };
    eprintln!("webtermd: auth token for {user}: {token}");

    let registry = SessionRegistry::with_max_sessions(config.max_sessions);
    let shutdown = ShutdownCoordinator::new();

    spawn_idle_reaper(registry.clone(), config.idle_timeout());

    let state = AppState {
        sessions: registry.clone(),
        shutdown: shutdown.clone(),
        tokens,
        tickets: Arc::new(TicketStore::new()),
    };
    let app = api::router(state);

    let listener = TcpListener::bind(config.bind)
        .await
        .map_err(|e| ServerError::Bind(config.bind, e))?;

    // Ctrl+C: signal streams to close, drain sessions, then stop accepting.
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    {
        let shutdown = shutdown.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("shutdown signal received");
            let active = shutdown.active_count();
            if active > 0 {
                tracing::info!(active, "signaling clients to disconnect");
                shutdown.shutdown();
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, shutdown.wait_for_all_closed()).await;
            }
            registry.drain();
            let _ = stop_tx.send(());
        });
    }

    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let acceptor = tls::load_tls_config(cert, key)?;
            tracing::info!(addr = %config.bind, "HTTPS server listening");
            serve_tls(listener, acceptor, app, stop_rx)
                .await
                .map_err(ServerError::Serve)?;
        }
        _ => {
            tracing::info!(addr = %config.bind, "HTTP server listening (no TLS configured)");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop_rx.await;
                })
                .await
                .map_err(ServerError::Serve)?;
        }
    }

    tracing::info!("webtermd exiting");
    Ok(())
}

fn spawn_idle_reaper(registry: SessionRegistry, idle_timeout: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            let reaped = registry.reap_idle(idle_timeout);
            if reaped > 0 {
                tracing::info!(reaped, "idle sessions reaped");
            }
        }
    });
}

/// Manual accept loop: TLS handshake per connection, then the axum router
/// served over hyper with upgrade support (WebSockets ride on upgrades).
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: axum::Router,
    mut stop_rx: tokio::sync::oneshot::Receiver<()>,
) -> std::io::Result<()> {
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder;
    use hyper_util::service::TowerToHyperService;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(?e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::debug!(%peer, ?e, "tls handshake failed");
                            return;
                        }
                    };
                    let service = TowerToHyperService::new(app);
                    if let Err(e) = Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
                        .await
                    {
                        tracing::debug!(%peer, ?e, "connection error");
                    }
                });
            }
        }
    }
    Ok(())
}
