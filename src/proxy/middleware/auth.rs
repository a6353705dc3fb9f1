//! Basic authentication for proxy clients

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Request, StatusCode};
use tracing::{debug, warn};

use crate::config::ProxyServerConfig;
use crate::error::{FerryError, Result};
use crate::proxy::session::{error_response, ProxyResponse};

const CHALLENGE: &str = "Basic realm=\"ferry\"";

/// Checks `Proxy-Authorization` against a single configured user
#[derive(Clone)]
pub struct ProxyAuth {
    enabled: bool,
    username: String,
    password: String,
}

impl ProxyAuth {
    pub fn new(enabled: bool, username: String, password: String) -> Self {
        Self {
            enabled,
            username,
            password,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, String::new(), String::new())
    }

    pub fn from_config(config: &ProxyServerConfig) -> Self {
        Self::new(
            config.auth_enabled,
            config.auth_username.clone(),
            config.auth_password.clone(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Validate the Proxy-Authorization header
    pub fn validate<T>(&self, req: &Request<T>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let header = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .ok_or(FerryError::AuthenticationFailed)?
            .to_str()
            .map_err(|_| FerryError::AuthenticationFailed)?;

        let Some(encoded) = header.strip_prefix("Basic ") else {
            warn!("Rejected proxy credentials: expected Basic scheme");
            return Err(FerryError::AuthenticationFailed);
        };

        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| FerryError::AuthenticationFailed)?;
        let credentials =
            String::from_utf8(decoded).map_err(|_| FerryError::AuthenticationFailed)?;
        let (user, pass) = credentials
            .split_once(':')
            .ok_or(FerryError::AuthenticationFailed)?;

        if user == self.username && pass == self.password {
            debug!(user, "Proxy client authenticated");
            Ok(())
        } else {
            warn!(user, "Rejected proxy credentials");
            Err(FerryError::AuthenticationFailed)
        }
    }

    /// 407 asking the client to authenticate
    pub fn challenge_response(&self) -> ProxyResponse {
        let mut response = error_response(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            "Proxy authentication required",
        );
        response
            .headers_mut()
            .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
        response
    }
}
