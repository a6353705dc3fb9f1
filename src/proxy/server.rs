//! Proxy listener built on hyper
//!
//! Accepts client connections, authenticates each request and hands it to
//! the active engine as a [`Session`].

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{FerryError, Result};
use crate::proxy::engine::Engine;
use crate::proxy::middleware::ProxyAuth;
use crate::proxy::session::{error_response, ProxyResponse, Session};

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    engine: Arc<dyn Engine>,
    auth: ProxyAuth,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig, engine: Arc<dyn Engine>) -> Self {
        let auth = ProxyAuth::from_config(&config);
        Self {
            config,
            engine,
            auth,
        }
    }

    /// Bind the configured address and serve until `shutdown` flips to true
    #[instrument(skip(self, shutdown), fields(engine = self.engine.name()))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            FerryError::InvalidConfig(format!("cannot listen on {}: {}", addr, e))
        })?;

        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            "Proxy server listening on {} ({} engine)",
            listener.local_addr()?,
            self.engine.name()
        );

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let engine = self.engine.clone();
                            let auth = self.auth.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, client_addr, engine, auth).await
                                {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        engine: Arc<dyn Engine>,
        auth: ProxyAuth,
    ) -> Result<()> {
        let io = TokioIo::new(stream);
        let client_ip = client_addr.ip().to_string();

        let service = service_fn(move |req: Request<Incoming>| {
            let engine = engine.clone();
            let auth = auth.clone();
            let client_ip = client_ip.clone();

            async move {
                let response = dispatch(engine.as_ref(), &auth, req, client_ip).await;
                Ok::<_, Infallible>(response)
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await?;

        Ok(())
    }
}

/// Authenticate the request, then route it to the engine by method
async fn dispatch(
    engine: &dyn Engine,
    auth: &ProxyAuth,
    req: Request<Incoming>,
    client_ip: String,
) -> ProxyResponse {
    if let Err(e) = auth.validate(&req) {
        debug!(client = %client_ip, "{}", e);
        return auth.challenge_response();
    }

    let is_connect = req.method() == Method::CONNECT;
    let (session, response) = Session::new(req, client_ip);

    if is_connect {
        engine.connect(session).await;
    } else {
        engine.serve(session).await;
    }

    response.await.unwrap_or_else(|_| {
        error!("{} engine dropped a session without answering", engine.name());
        error_response(StatusCode::BAD_GATEWAY, "Session was not answered")
    })
}
