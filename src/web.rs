//! HTTP side doors: the diagnostics endpoint and the debug file server.
//! Neither is on the pipeline's path.

use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::error::{MirrorError, Result};
use crate::metrics::Metrics;

/// A server running in the background until its shutdown token fires.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

pub fn diagnostics_routes(
    metrics: Arc<Metrics>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let vars = warp::path!("debug" / "vars")
        .and(warp::get())
        .and(with_metrics(metrics.clone()))
        .map(|metrics: Arc<Metrics>| warp::reply::json(&metrics.snapshot()));

    let prometheus = warp::path!("metrics")
        .and(warp::get())
        .and(with_metrics(metrics))
        .map(render_prometheus);

    vars.or(prometheus)
}

fn with_metrics(
    metrics: Arc<Metrics>,
) -> impl Filter<Extract = (Arc<Metrics>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || metrics.clone())
}

fn render_prometheus(metrics: Arc<Metrics>) -> warp::reply::Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&metrics.gather_metrics(), &mut buffer) {
        Ok(()) => warp::reply::with_header(buffer, "content-type", encoder.format_type())
            .into_response(),
        Err(e) => warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
    }
}

/// Serve `root`, logging every request.
pub fn file_routes(root: PathBuf) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::fs::dir(root).with(warp::log::custom(|request| {
        info!(
            method = %request.method(),
            path = request.path(),
            status = request.status().as_u16(),
            elapsed_ms = request.elapsed().as_millis() as u64,
            "File server request"
        );
    }))
}

fn parse_address(address: &str) -> Result<SocketAddr> {
    address
        .parse()
        .map_err(|e| MirrorError::Server(format!("Invalid listen address '{address}': {e}")))
}

pub fn serve_diagnostics(
    address: &str,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<ServerHandle> {
    let addr = parse_address(address)?;
    let (local_addr, server) = warp::serve(diagnostics_routes(metrics))
        .try_bind_with_graceful_shutdown(addr, shutdown.cancelled_owned())
        .map_err(|e| MirrorError::Server(e.to_string()))?;

    info!(%local_addr, "Diagnostics endpoint listening");
    Ok(ServerHandle {
        local_addr,
        task: tokio::spawn(server),
    })
}

pub fn serve_files(
    address: &str,
    root: PathBuf,
    shutdown: CancellationToken,
) -> Result<ServerHandle> {
    let addr = parse_address(address)?;
    let (local_addr, server) = warp::serve(file_routes(root.clone()))
        .try_bind_with_graceful_shutdown(addr, shutdown.cancelled_owned())
        .map_err(|e| MirrorError::Server(e.to_string()))?;

    info!(%local_addr, root = %root.display(), "File server listening");
    Ok(ServerHandle {
        local_addr,
        task: tokio::spawn(server),
    })
}
