//! Local control endpoint.
//!
//! Background jobs report completion here, and the control loop hands
//! server configuration changes here. It runs on its own thread with a
//! single-threaded tokio runtime so the control loop stays synchronous.

use std::net::{SocketAddr, TcpListener};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod routes;
pub mod state;

pub use state::ControlState;

pub fn app(state: ControlState) -> Router {
    routes::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running control endpoint.
#[derive(Debug)]
pub struct ControlServer {
    pub addr: SocketAddr,
    pub handle: JoinHandle<()>,
}

/// Bind `listen` and serve the control endpoint on a background thread.
///
/// Binding happens before this returns, so a busy port is reported here.
pub fn spawn(listen: &str, state: ControlState) -> Result<ControlServer> {
    let listener =
        TcpListener::bind(listen).with_context(|| format!("bind control endpoint {listen}"))?;
    listener
        .set_nonblocking(true)
        .context("set control listener non-blocking")?;
    let addr = listener.local_addr().context("control listener address")?;
    info!(%addr, "control endpoint listening");

    let handle = thread::Builder::new()
        .name("control-endpoint".to_string())
        .spawn(move || {
            if let Err(err) = serve(listener, state) {
                error!("control endpoint stopped: {err:#}");
            }
        })
        .context("spawn control endpoint thread")?;
    Ok(ControlServer { addr, handle })
}

fn serve(listener: TcpListener, state: ControlState) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build control endpoint runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener).context("adopt control listener")?;
        axum::serve(listener, app(state))
            .await
            .context("serve control endpoint")
    })
}
