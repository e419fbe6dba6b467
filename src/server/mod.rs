mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::GatewayState;

use crate::proxy;
use crate::routing::RouteTarget;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Whether this listener is dedicated to raw TCP forwarding rather than
/// HTTP. A gateway port either speaks HTTP end to end (file proxy / upstream
/// proxy, selected per request by the router) or is handed wholesale to a
/// single `tcp_proxy` route — the two are not mixed on one port. If the
/// routing table holds exactly one route and it is a `tcp_proxy`, that
/// route claims the whole listener.
fn tcp_proxy_route(state: &GatewayState) -> Option<Arc<crate::config::TcpProxyConfig>> {
    let table = state.routing.load();
    let routes = table.all_routes();
    if routes.len() == 1 {
        if let RouteTarget::TcpProxy(cfg) = &routes[0].target {
            return Some(cfg.clone());
        }
    }
    None
}

/// Run the main proxy acceptor with graceful shutdown support.
///
/// Implements the acceptor/dispatcher sequence: resolve the peer address,
/// apply the blacklist filter, take one rate-limiter token, optionally
/// terminate TLS, then dispatch to either the raw TCP proxy or the HTTP
/// service stack (file proxy / upstream proxy, chosen per request by the
/// router). When `shutdown` is notified the server stops accepting new
/// connections and waits up to `DRAIN_TIMEOUT` for in-flight work to finish.
pub async fn run_proxy_server(listen: &str, state: GatewayState, shutdown: Arc<Notify>) -> Result<()> {
    const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "server: proxy listening");

    let tcp_route = tcp_proxy_route(&state);
    let tls_acceptor = proxy::tls::build_acceptor(&state.config.load().server.ssl)?;
    if tcp_route.is_some() && tls_acceptor.is_some() {
        warn!("server: tls is configured on a tcp_proxy-only listener; raw forwarding does not terminate tls");
    }

    // Track in-flight connections so we can drain them on shutdown.
    let in_flight = Arc::new(tokio::sync::Semaphore::new(0));
    // Atomic counter for reading active connection count (metrics crate gauges are write-only).
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("gateway_connections_total", "status" => "accepted").increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("gateway_connections_total", "status" => "error").increment(1);
                metrics::counter!("gateway_errors_total", "kind" => "accept", "source" => "proxy").increment(1);
                continue;
            }
        };

        if !state.blacklist.accept(&peer_addr.ip().to_string()).await {
            metrics::counter!("gateway_blacklist_rejected_total").increment(1);
            debug!(peer = %peer_addr, "server: proxy: connection rejected by blacklist");
            continue;
        }

        if !state.rate_limiter.try_acquire() {
            debug!(peer = %peer_addr, "server: proxy: connection rejected, no rate-limiter token");
            continue;
        }

        metrics::gauge!("gateway_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let tls_acceptor = tls_acceptor.clone();
        let tcp_route = tcp_route.clone();
        // Add a permit for this connection — the drain loop waits on these.
        in_flight.add_permits(1);
        let in_flight = in_flight.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            if let Some(cfg) = tcp_route {
                proxy::tcp_proxy::proxy(stream, &cfg).await;
            } else {
                serve_http_connection(stream, peer_addr, state, tls_acceptor).await;
            }

            metrics::gauge!("gateway_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
            // Consume one permit — signal that this connection is done.
            let _ = in_flight.acquire().await;
        });
    }

    // Drain phase: wait for all in-flight connections to finish (or timeout).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: proxy: waiting for {} active connections to drain", active);
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                warn!(
                    "server: proxy: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}

/// Optionally performs the TLS handshake, then serves HTTP/1.1 and h2c over
/// the (possibly wrapped) stream until the peer disconnects.
async fn serve_http_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: GatewayState,
    tls_acceptor: Option<TlsAcceptor>,
) {
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { proxy::handle_request(req, state, peer_addr).await }
    });

    let result = match tls_acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                auto::Builder::new(TokioExecutor::new())
                    .http1()
                    .keep_alive(true)
                    .http2()
                    .keep_alive_interval(Some(Duration::from_secs(20)))
                    .serve_connection_with_upgrades(TokioIo::new(tls_stream), svc)
                    .await
            }
            Err(e) => {
                if !proxy::tls::is_benign_handshake_error(&e) {
                    warn!(peer = %peer_addr, error = %e, "server: proxy: tls handshake failed");
                    metrics::counter!("gateway_errors_total", "kind" => "tls_handshake", "source" => "proxy").increment(1);
                }
                return;
            }
        },
        None => {
            auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)))
                .serve_connection_with_upgrades(TokioIo::new(stream), svc)
                .await
        }
    };

    if let Err(e) = result {
        if !e.to_string().contains("connection closed") {
            error!(peer = %peer_addr, error = %e, "server: proxy: connection error");
            metrics::counter!("gateway_errors_total", "kind" => "connection", "source" => "proxy").increment(1);
        }
    }
}

/// Run a simple admin server for health/readiness checks, metrics, and config
/// introspection (§6). Plain HTTP only — this port is meant to sit behind an
/// internal network boundary, not the public listener.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "server: admin listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
