//! HTTP forwarding and CONNECT tunneling over an arbitrary dialer
//!
//! This is the "direct" engine when paired with [`TcpDialer`], and the
//! delegate that the SOCKS and SSH engines hand their sessions to.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderMap, HOST};
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tracing::{debug, info, instrument, warn};

use super::Engine;
use crate::error::{FerryError, Result};
use crate::proxy::relay;
use crate::proxy::session::{ProxyResponse, Session};
use crate::proxy::transport::{
    join_host_port, parse_authority, parse_target, BoxedConnection, Dialer, TcpDialer,
};

/// Timeouts applied by the direct engine
#[derive(Debug, Clone, Copy)]
pub struct DirectEngineConfig {
    /// Timeout for opening the outgoing connection
    pub connect_timeout: Duration,
    /// Timeout for the upstream request/response
    pub request_timeout: Duration,
}

impl Default for DirectEngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Serves sessions by dialing targets through its dialer
pub struct DirectEngine {
    dialer: Arc<dyn Dialer>,
    config: DirectEngineConfig,
}

impl DirectEngine {
    pub fn new(dialer: Arc<dyn Dialer>, config: DirectEngineConfig) -> Self {
        Self { dialer, config }
    }

    /// Direct engine dialing plain TCP
    pub fn tcp(config: DirectEngineConfig) -> Self {
        Self::new(Arc::new(TcpDialer), config)
    }

    /// Forward a plain HTTP request to its origin and collect the response
    #[instrument(skip(self, request), fields(method = %request.method(), uri = %request.uri()))]
    pub async fn forward<B>(&self, request: Request<B>) -> Result<ProxyResponse>
    where
        B: Body,
        B::Error: Display,
    {
        let (target_host, target_port) = parse_target(request.uri())?;

        let (parts, body) = request.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| FerryError::InvalidRequest(format!("Failed to read body: {}", e)))?
            .to_bytes();

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(path)
            .version(Version::HTTP_11);
        for (name, value) in &parts.headers {
            if !is_hop_by_hop_header(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                builder = builder.header(HOST, authority.as_str());
            }
        }
        let upstream_request = builder
            .body(Full::new(body))
            .map_err(|e| FerryError::InvalidRequest(format!("Failed to build request: {}", e)))?;

        let stream = self.open(&target_host, target_port).await?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FerryError::Http(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        let response = tokio::time::timeout(
            self.config.request_timeout,
            sender.send_request(upstream_request),
        )
        .await
        .map_err(|_| FerryError::Timeout)?
        .map_err(|e| FerryError::Http(format!("Request failed: {}", e)))?;

        let (mut parts, body) = response.into_parts();
        let body = tokio::time::timeout(self.config.request_timeout, body.collect())
            .await
            .map_err(|_| FerryError::Timeout)?
            .map_err(|e| FerryError::Http(format!("Failed to read response: {}", e)))?
            .to_bytes();
        strip_hop_by_hop_headers(&mut parts.headers);

        Ok(Response::from_parts(parts, Full::new(body)))
    }

    /// Dial the target under the connect timeout
    async fn open(&self, host: &str, port: u16) -> Result<BoxedConnection> {
        let address = join_host_port(host, port);
        tokio::time::timeout(self.config.connect_timeout, self.dialer.dial("tcp", &address))
            .await
            .map_err(|_| FerryError::Timeout)?
    }
}

#[async_trait]
impl Engine for DirectEngine {
    async fn serve(&self, session: Session) {
        let (request, client_ip, responder) = session.into_parts();

        match self.forward(request).await {
            Ok(response) => responder.send(response),
            Err(e) => {
                warn!(client = %client_ip, "HTTP request failed: {}", e);
                responder.error(e.status_code(), &e.to_string());
            }
        }
    }

    #[instrument(skip(self, session), fields(uri = %session.request().uri()))]
    async fn connect(&self, session: Session) {
        let (request, client_ip, responder) = session.into_parts();

        let authority = request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| request.uri().to_string());

        let (host, port) = match parse_authority(&authority) {
            Ok(target) => target,
            Err(e) => {
                responder.error(e.status_code(), &e.to_string());
                return;
            }
        };

        // Don't answer 200 until the target is reachable.
        let upstream = match self.open(&host, port).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(client = %client_ip, "CONNECT to {} failed: {}", authority, e);
                responder.error(
                    e.status_code(),
                    &format!("Failed to establish tunnel: {}", e),
                );
                return;
            }
        };

        info!("CONNECT tunnel established to {}", authority);

        let on_upgrade = hyper::upgrade::on(request);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    relay::splice(TokioIo::new(upgraded), upstream).await;
                }
                Err(e) => debug!("CONNECT upgrade failed: {}", e),
            }
        });

        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::OK;
        responder.send(response);
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let hop: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Dialer that records requests and serves a canned HTTP response
    struct CannedDialer {
        dialed: Mutex<Vec<(String, String)>>,
        received: Arc<Mutex<Vec<u8>>>,
        response: &'static [u8],
    }

    impl CannedDialer {
        fn new(response: &'static [u8]) -> Self {
            Self {
                dialed: Mutex::new(Vec::new()),
                received: Arc::new(Mutex::new(Vec::new())),
                response,
            }
        }
    }

    #[async_trait]
    impl Dialer for CannedDialer {
        async fn dial(&self, network: &str, address: &str) -> Result<BoxedConnection> {
            self.dialed
                .lock()
                .push((network.to_string(), address.to_string()));

            let (ours, mut theirs) = tokio::io::duplex(4096);
            let received = self.received.clone();
            let response = self.response;
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = theirs.read(&mut buf).await.unwrap();
                received.lock().extend_from_slice(&buf[..n]);
                theirs.write_all(response).await.unwrap();
            });
            Ok(Box::new(ours))
        }
    }

    struct FailingDialer;

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial(&self, _network: &str, address: &str) -> Result<BoxedConnection> {
            Err(FerryError::DialFailed(format!("{}: no route to host", address)))
        }
    }

    #[tokio::test]
    async fn test_forward_rewrites_request_for_origin() {
        let dialer = Arc::new(CannedDialer::new(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nKeep-Alive: timeout=5\r\n\r\nhello",
        ));
        let engine = DirectEngine::new(dialer.clone(), DirectEngineConfig::default());

        let request = Request::builder()
            .method("GET")
            .uri("http://example.com:8080/index.html?q=1")
            .header("Proxy-Authorization", "Basic dXNlcjpwYXNz")
            .header("Proxy-Connection", "keep-alive")
            .header("Accept", "text/html")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = engine.forward(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("keep-alive").is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        assert_eq!(
            dialer.dialed.lock().clone(),
            vec![("tcp".to_string(), "example.com:8080".to_string())]
        );

        let sent = String::from_utf8(dialer.received.lock().clone()).unwrap();
        assert!(sent.starts_with("GET /index.html?q=1 HTTP/1.1\r\n"));
        assert!(sent.to_lowercase().contains("host: example.com:8080\r\n"));
        assert!(sent.to_lowercase().contains("accept: text/html\r\n"));
        assert!(!sent.to_lowercase().contains("proxy-authorization"));
        assert!(!sent.to_lowercase().contains("proxy-connection"));
    }

    #[tokio::test]
    async fn test_forward_rejects_origin_form_request() {
        let engine = DirectEngine::new(
            Arc::new(CannedDialer::new(b"")),
            DirectEngineConfig::default(),
        );
        let request = Request::builder()
            .uri("/no-host")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = engine.forward(request).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_forward_passes_dial_errors_through() {
        let engine = DirectEngine::new(Arc::new(FailingDialer), DirectEngineConfig::default());
        let request = Request::builder()
            .uri("http://unreachable.example/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = engine.forward(request).await.unwrap_err();
        assert!(matches!(err, FerryError::DialFailed(ref m) if m.contains("no route to host")));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(is_hop_by_hop_header("Proxy-Connection"));
        assert!(!is_hop_by_hop_header("content-length"));
        assert!(!is_hop_by_hop_header("host"));
    }
}
