//! SOCKS5-backed engine
//!
//! Same HTTP mechanics as the direct engine, but every outgoing connection is
//! opened through an upstream SOCKS5 proxy. Hostnames are resolved by the
//! proxy, not locally.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use super::{DirectEngine, DirectEngineConfig, Engine};
use crate::config::SocksProxyConfig;
use crate::error::{FerryError, Result};
use crate::proxy::session::Session;
use crate::proxy::transport::{
    check_network, join_host_port, split_host_port, BoxedConnection, Dialer,
};

/// Dials targets through a SOCKS5 proxy
pub struct SocksDialer {
    proxy: SocksProxyConfig,
}

impl SocksDialer {
    pub fn new(proxy: SocksProxyConfig) -> Self {
        Self { proxy }
    }

    fn proxy_addr(&self) -> String {
        join_host_port(&self.proxy.host, self.proxy.port)
    }

    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<TcpStream> {
        let socket = TcpStream::connect(self.proxy_addr()).await?;

        let stream = match (&self.proxy.username, &self.proxy.password) {
            (Some(username), Some(password)) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    (host, port),
                    username,
                    password,
                )
                .await?
            }
            _ => Socks5Stream::connect_with_socket(socket, (host, port)).await?,
        };

        Ok(stream.into_inner())
    }
}

#[async_trait]
impl Dialer for SocksDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConnection> {
        check_network(network)?;
        let (host, port) = split_host_port(address)?;
        debug!("Dialing {} via SOCKS5 proxy {}", address, self.proxy_addr());

        let stream = self.connect(&host, port).await.map_err(|e| {
            FerryError::DialFailed(format!(
                "SOCKS5 connect failed ({} -> {}): {}",
                self.proxy_addr(),
                address,
                e
            ))
        })?;

        Ok(Box::new(stream))
    }
}

/// Engine that forwards every session through an upstream SOCKS5 proxy
pub struct SocksEngine {
    direct: DirectEngine,
}

impl SocksEngine {
    pub fn new(proxy: SocksProxyConfig, config: DirectEngineConfig) -> Self {
        Self {
            direct: DirectEngine::new(Arc::new(SocksDialer::new(proxy)), config),
        }
    }
}

#[async_trait]
impl Engine for SocksEngine {
    async fn serve(&self, session: Session) {
        self.direct.serve(session).await
    }

    async fn connect(&self, session: Session) {
        self.direct.connect(session).await
    }

    fn name(&self) -> &'static str {
        "socks"
    }
}
