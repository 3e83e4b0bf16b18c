//! HTTP server loop and process lifecycle.
//!
//! [`serve`] is the main entry point: it starts every listenable endpoint,
//! then accepts connections until interrupted and hands each exchange to
//! the mux. Each connection is served on its own task; the handler behind
//! it is shared.
//!
//! # Examples
//!
//! ```rust,no_run
//! use fns::config::Config;
//! use fns::endpoint::Service;
//! use fns::endpoints::Endpoints;
//! use tokio::net::TcpListener;
//!
//! # async fn example(users: Service) -> Result<(), Box<dyn std::error::Error>> {
//! let endpoints = Endpoints::builder(Config::default()).deploy(users).build().await?;
//! let listener = TcpListener::bind(("0.0.0.0", 18080)).await?;
//! fns::serve(listener, endpoints).await;
//! # Ok(())
//! # }
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::{server::conn::http1, service::service_fn};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::endpoints::Endpoints;
use crate::handler::FnsHandler;
use crate::types::BoxError;

/// How long shutdown waits for the endpoint cohort.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Starts the server with the given listener and endpoints manager.
///
/// Runs until ctrl-c, then shuts the endpoints down bounded by a fixed
/// deadline.
pub async fn serve(listener: TcpListener, endpoints: Arc<Endpoints>) {
    if let Err(err) = run(listener, endpoints).await {
        error!(error = %err, "server terminated");
    }
}

async fn run(listener: TcpListener, endpoints: Arc<Endpoints>) -> Result<(), BoxError> {
    endpoints.listen().await?;

    let handler = Arc::new(FnsHandler::new(endpoints.clone()));
    info!(addr = %listener.local_addr()?, "FNS listening");

    loop {
        let (stream, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let io = hyper_util::rt::TokioIo::new(stream);
        let handler = handler.clone();

        // Serve each connection on its own task.
        tokio::spawn(async move {
            let svc = service_fn(move |mut req| {
                let handler = handler.clone();
                async move {
                    req.extensions_mut().insert(addr);
                    Ok::<_, Infallible>(handler.dispatch(req).await)
                }
            });

            let mut http = http1::Builder::new();
            http.keep_alive(true);
            if let Err(err) = http.serve_connection(io, svc).await {
                error!(error = %err, "error serving connection");
            }
        });
    }

    info!("FNS shutting down");
    endpoints.shutdown(SHUTDOWN_TIMEOUT).await;
    Ok(())
}
