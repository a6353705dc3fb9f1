//! Proxy engines
//!
//! An engine decides how outgoing connections are made. Every engine serves
//! plain HTTP requests and CONNECT tunnels; they differ only in the dialer
//! underneath:
//!
//! - `direct`: plain TCP
//! - `socks`: through an upstream SOCKS5 proxy
//! - `ssh`: through a self-healing SSH tunnel

mod direct;
mod socks;
pub mod tunnel;

pub use direct::{DirectEngine, DirectEngineConfig};
pub use socks::{SocksDialer, SocksEngine};
pub use tunnel::{TunnelEngine, TunnelOptions};

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{EngineConfig, ProxyServerConfig};
use crate::error::{FerryError, Result};
use crate::proxy::session::Session;

/// Engine types selectable at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineKind {
    #[default]
    Direct,
    Socks,
    Ssh,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Socks => "socks",
            Self::Ssh => "ssh",
        }
    }
}

impl FromStr for EngineKind {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "socks" | "socks5" | "s2h" => Ok(Self::Socks),
            "ssh" => Ok(Self::Ssh),
            other => Err(FerryError::InvalidConfig(format!(
                "engine should be \"direct\", \"socks\" or \"ssh\", got \"{}\"",
                other
            ))),
        }
    }
}

/// Serves proxied sessions
///
/// Neither operation returns anything: whatever happens to a session,
/// including failures, is answered on the session itself.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Forward a plain HTTP request
    async fn serve(&self, session: Session);

    /// Establish a CONNECT tunnel
    async fn connect(&self, session: Session);

    /// Get the engine name
    fn name(&self) -> &'static str;

    /// Release long-lived resources when the daemon stops
    async fn shutdown(&self) {}
}

/// Build the engine selected by configuration
///
/// For the ssh engine this performs the initial handshake; a failure there
/// aborts startup.
pub async fn create_engine(
    engine: &EngineConfig,
    proxy: &ProxyServerConfig,
) -> Result<Arc<dyn Engine>> {
    let direct = DirectEngineConfig {
        connect_timeout: proxy.connect_timeout(),
        request_timeout: proxy.request_timeout(),
    };

    match engine.kind {
        EngineKind::Direct => Ok(Arc::new(DirectEngine::tcp(direct))),
        EngineKind::Socks => Ok(Arc::new(SocksEngine::new(
            engine.socks_proxy.clone(),
            direct,
        ))),
        EngineKind::Ssh => {
            let remote = engine.remote.as_deref().ok_or_else(|| {
                FerryError::InvalidConfig("ssh engine requires a remote endpoint".into())
            })?;
            let options = TunnelOptions {
                handshake_timeout: Duration::from_secs(engine.handshake_timeout.max(1)),
                dial_timeout: Duration::from_secs(engine.dial_timeout.max(1)),
                max_reconnects: engine.max_reconnects,
                direct,
            };
            let engine =
                TunnelEngine::connect_ssh(remote, engine.ssh_key_path.clone(), options).await?;
            Ok(Arc::new(engine))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocksProxyConfig;

    fn engine_config(kind: EngineKind) -> EngineConfig {
        EngineConfig {
            kind,
            socks_proxy: SocksProxyConfig {
                host: "localhost".to_string(),
                port: 1080,
                username: None,
                password: None,
            },
            remote: None,
            ssh_key_path: None,
            handshake_timeout: 1,
            dial_timeout: 1,
            max_reconnects: 3,
        }
    }

    fn proxy_config() -> ProxyServerConfig {
        ProxyServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            connect_timeout: 1,
            request_timeout: 1,
            auth_enabled: false,
            auth_username: String::new(),
            auth_password: String::new(),
        }
    }

    #[test]
    fn test_engine_kind_from_str() {
        assert_eq!("direct".parse::<EngineKind>().unwrap(), EngineKind::Direct);
        assert_eq!("S2H".parse::<EngineKind>().unwrap(), EngineKind::Socks);
        assert_eq!("socks5".parse::<EngineKind>().unwrap(), EngineKind::Socks);
        assert_eq!(" ssh ".parse::<EngineKind>().unwrap(), EngineKind::Ssh);
        assert!(matches!(
            "gae".parse::<EngineKind>(),
            Err(FerryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_engine_kind_as_str() {
        assert_eq!(EngineKind::Direct.as_str(), "direct");
        assert_eq!(EngineKind::Socks.as_str(), "socks");
        assert_eq!(EngineKind::Ssh.as_str(), "ssh");
    }

    #[tokio::test]
    async fn test_create_engine_names() {
        let engine = create_engine(&engine_config(EngineKind::Direct), &proxy_config())
            .await
            .unwrap();
        assert_eq!(engine.name(), "direct");

        let engine = create_engine(&engine_config(EngineKind::Socks), &proxy_config())
            .await
            .unwrap();
        assert_eq!(engine.name(), "socks");
    }

    #[tokio::test]
    async fn test_create_ssh_engine_requires_remote() {
        let result = create_engine(&engine_config(EngineKind::Ssh), &proxy_config()).await;
        assert!(matches!(result, Err(FerryError::InvalidConfig(_))));
    }
}
