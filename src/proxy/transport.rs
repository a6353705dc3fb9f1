//! Dial abstraction shared by every engine
//!
//! A [`Dialer`] turns a `(network, address)` pair into a byte stream. The
//! HTTP forwarding code only ever talks to this trait, so it does not care
//! whether the stream is a plain TCP socket, a SOCKS5 tunnel or an SSH
//! channel.

use async_trait::async_trait;
use hyper::Uri;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{FerryError, Result};

/// Byte stream returned by a dialer
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedConnection = Box<dyn ProxyConnection>;

/// Opens outgoing connections on behalf of a proxied session
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `address` (`host:port`) over `network` (`tcp`, `tcp4`, `tcp6`)
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConnection>;
}

/// Plain TCP dialer used by the direct engine
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConnection> {
        check_network(network)?;
        debug!("Dialing {} directly", address);

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| FerryError::DialFailed(format!("{}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);

        Ok(Box::new(stream))
    }
}

/// Only stream networks make sense for an HTTP proxy
pub fn check_network(network: &str) -> Result<()> {
    match network {
        "tcp" | "tcp4" | "tcp6" => Ok(()),
        other => Err(FerryError::DialFailed(format!(
            "unsupported network: {}",
            other
        ))),
    }
}

/// Parse host and port from an absolute-form request URI
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| FerryError::InvalidRequest("Missing host in URI".to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .to_string();

    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    Ok((host, port))
}

/// Parse host and port from a CONNECT authority; the port defaults to 443
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if authority.is_empty() {
        return Err(FerryError::InvalidRequest("Empty CONNECT authority".to_string()));
    }

    // Bracketed IPv6, with or without a port.
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| FerryError::InvalidRequest(format!("Invalid authority: {}", authority)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if tail.is_empty() => 443,
            None => {
                return Err(FerryError::InvalidRequest(format!(
                    "Invalid authority: {}",
                    authority
                )))
            }
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), parse_port(port)?)),
        _ => Ok((authority.to_string(), 443)),
    }
}

/// Split a `host:port` dial address, accepting bracketed IPv6 hosts
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let invalid =
        || FerryError::DialFailed(format!("Invalid address '{}': expected host:port", addr));

    let (host, port) = match addr.strip_prefix('[') {
        Some(rest) => rest.split_once("]:").ok_or_else(invalid)?,
        None => {
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            if host.contains(':') {
                return Err(invalid());
            }
            (host, port)
        }
    };
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;

    Ok((host.to_string(), port))
}

/// Join host and port into a dial address, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| FerryError::InvalidRequest(format!("Invalid port: {}", port)))
}
