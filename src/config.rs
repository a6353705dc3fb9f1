use crate::error::{FerryError, Result};
use crate::proxy::engine::EngineKind;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy listener configuration
    pub proxy: ProxyServerConfig,
    /// Engine selection and engine-specific settings
    pub engine: EngineConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 18087)
    pub port: u16,
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Request timeout in seconds
    pub request_timeout: u64,
    /// Enable proxy authentication
    pub auth_enabled: bool,
    /// Authentication username
    pub auth_username: String,
    /// Authentication password
    pub auth_password: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Which engine dials outgoing connections
    pub kind: EngineKind,
    /// Upstream SOCKS5 proxy, used by the socks engine
    pub socks_proxy: SocksProxyConfig,
    /// SSH endpoint URL, required by the ssh engine
    pub remote: Option<String>,
    /// Private key to offer to the SSH server; `None` means `$HOME/.ssh/id_rsa`
    pub ssh_key_path: Option<PathBuf>,
    /// Handshake timeout in seconds
    pub handshake_timeout: u64,
    /// Per sub-dial timeout in seconds
    pub dial_timeout: u64,
    /// Reconnect rounds a single dial may drive before giving up
    pub max_reconnects: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let kind: EngineKind = get_env_or("FERRY_ENGINE", "direct").parse()?;

        let remote = env::var("FERRY_REMOTE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if kind == EngineKind::Ssh && remote.is_none() {
            return Err(FerryError::InvalidConfig(
                "FERRY_REMOTE is required when FERRY_ENGINE=ssh".into(),
            ));
        }

        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "18087").parse().map_err(|_| {
                    FerryError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "127.0.0.1"),
                connect_timeout: get_env_or("PROXY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: get_env_or("PROXY_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
                auth_enabled: get_env_or("PROXY_AUTH_ENABLED", "false")
                    .parse()
                    .unwrap_or(false),
                auth_username: get_env_or("PROXY_AUTH_USERNAME", ""),
                auth_password: get_env_or("PROXY_AUTH_PASSWORD", ""),
            },
            engine: EngineConfig {
                kind,
                socks_proxy: parse_socks_proxy(&get_env_or(
                    "FERRY_SOCKS_PROXY",
                    "socks5://localhost:1314",
                ))?,
                remote,
                ssh_key_path: env::var("FERRY_SSH_KEY")
                    .ok()
                    .filter(|v| !v.trim().is_empty())
                    .map(PathBuf::from),
                handshake_timeout: get_env_or("FERRY_HANDSHAKE_TIMEOUT", "15")
                    .parse()
                    .unwrap_or(15),
                dial_timeout: get_env_or("FERRY_DIAL_TIMEOUT", "10").parse().unwrap_or(10),
                max_reconnects: get_env_or("FERRY_MAX_RECONNECTS", "3").parse().unwrap_or(3),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy listen address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

impl ProxyServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

fn parse_socks_proxy(raw: &str) -> Result<SocksProxyConfig> {
    let url = Url::parse(raw.trim()).map_err(|e| {
        FerryError::InvalidConfig(format!("FERRY_SOCKS_PROXY must be a valid URL: {}", e))
    })?;

    match url.scheme().to_lowercase().as_str() {
        "socks5" | "socks5h" => {}
        other => {
            return Err(FerryError::InvalidConfig(format!(
                "FERRY_SOCKS_PROXY has unsupported scheme: {}",
                other
            )))
        }
    }

    let host = url.host_str().ok_or_else(|| {
        FerryError::InvalidConfig("FERRY_SOCKS_PROXY must include a host".into())
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let username = match url.username() {
        "" => None,
        user => Some(decode_userinfo(user)?),
    };

    // RFC 1929 has no notion of a user without a password.
    let password = match (&username, url.password()) {
        (None, _) => None,
        (Some(_), Some(p)) if !p.is_empty() => Some(decode_userinfo(p)?),
        (Some(_), _) => {
            return Err(FerryError::InvalidConfig(
                "FERRY_SOCKS_PROXY auth requires a non-empty password".into(),
            ))
        }
    };

    Ok(SocksProxyConfig {
        host: host.to_string(),
        port: url.port().unwrap_or(1080),
        username,
        password,
    })
}

fn decode_userinfo(component: &str) -> Result<String> {
    urlencoding::decode(component)
        .map(|c| c.into_owned())
        .map_err(|_| {
            FerryError::InvalidConfig("FERRY_SOCKS_PROXY has invalid percent-encoding".into())
        })
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
