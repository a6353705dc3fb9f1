//! SSH transport for the tunnel engine
//!
//! One [`SshConnection`] is one authenticated SSH session; every sub-dial is
//! a `direct-tcpip` channel opened on it.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use tracing::{debug, info, instrument, warn};

use super::credentials::Credential;
use super::{TunnelConnection, TunnelConnector, TunnelTarget};
use crate::error::{FerryError, Result};
use crate::proxy::transport::{check_network, split_host_port, BoxedConnection};

/// Opens authenticated SSH sessions
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new(keepalive_interval: Duration) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Client-side session handler
///
/// Host keys are not verified; the fingerprint is logged so it can be
/// checked by hand.
pub struct SessionHandler {
    host: String,
}

impl client::Handler for SessionHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        info!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "Accepting SSH host key"
        );
        Ok(true)
    }
}

#[async_trait]
impl TunnelConnector for SshConnector {
    #[instrument(skip(self, target), fields(endpoint = %target.endpoint, user = %target.username))]
    async fn handshake(&self, target: &TunnelTarget) -> Result<Arc<dyn TunnelConnection>> {
        let address = target.endpoint.address();
        let handler = SessionHandler {
            host: address.clone(),
        };

        let mut handle = client::connect(
            self.config.clone(),
            (target.endpoint.host.as_str(), target.endpoint.port),
            handler,
        )
        .await
        .map_err(|e| FerryError::ConnectFailed(format!("ssh connect to {}: {}", address, e)))?;

        authenticate(&mut handle, &target.username, &target.credentials).await?;
        info!("SSH session established to {}", address);

        Ok(Arc::new(SshConnection { handle, address }))
    }
}

/// Try each credential in order until the server accepts one
async fn authenticate(
    handle: &mut client::Handle<SessionHandler>,
    username: &str,
    credentials: &[Credential],
) -> Result<()> {
    for credential in credentials {
        let outcome = match credential {
            Credential::PrivateKey(key) => {
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                handle
                    .authenticate_publickey(
                        username,
                        PrivateKeyWithHashAlg::new(key.clone(), hash_alg),
                    )
                    .await
            }
            Credential::Password(password) => {
                handle.authenticate_password(username, password).await
            }
        };

        match outcome {
            Ok(result) if result.success() => {
                debug!(method = credential.kind(), "SSH authentication accepted");
                return Ok(());
            }
            Ok(_) => debug!(method = credential.kind(), "SSH authentication rejected"),
            Err(e) => {
                return Err(FerryError::ConnectFailed(format!(
                    "ssh authentication ({}) failed: {}",
                    credential.kind(),
                    e
                )))
            }
        }
    }

    Err(FerryError::ConnectFailed(format!(
        "ssh server rejected all {} credential(s) for user {}",
        credentials.len(),
        username
    )))
}

/// A live SSH session
pub struct SshConnection {
    handle: client::Handle<SessionHandler>,
    address: String,
}

#[async_trait]
impl TunnelConnection for SshConnection {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConnection> {
        check_network(network)?;
        if self.handle.is_closed() {
            return Err(FerryError::TransportClosed(format!(
                "ssh session to {} is closed",
                self.address
            )));
        }

        let (host, port) = split_host_port(address)?;
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| classify_channel_error(e, address))?;

        debug!("Opened direct-tcpip channel to {} via {}", address, self.address);
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SSH disconnect from {}: {}", self.address, e);
        }
    }
}

/// Split channel-open failures into "the session is gone" and everything else
///
/// Only the first kind is worth a reconnect; a refused or unreachable target
/// is the target's problem, not the tunnel's.
pub fn classify_channel_error(err: russh::Error, address: &str) -> FerryError {
    match err {
        russh::Error::Disconnect | russh::Error::HUP | russh::Error::SendError => {
            FerryError::TransportClosed(err.to_string())
        }
        russh::Error::IO(ref io)
            if matches!(
                io.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            FerryError::TransportClosed(err.to_string())
        }
        russh::Error::ChannelOpenFailure(reason) => {
            FerryError::DialFailed(format!("{}: channel open refused ({:?})", address, reason))
        }
        other => {
            warn!("Unexpected SSH error dialing {}: {}", address, other);
            FerryError::DialFailed(format!("{}: {}", address, other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::engine::tunnel::EndpointUrl;

    #[test]
    fn test_session_loss_is_transport_closed() {
        assert!(classify_channel_error(russh::Error::Disconnect, "a:1").is_transport_closed());
        assert!(classify_channel_error(russh::Error::HUP, "a:1").is_transport_closed());
        assert!(classify_channel_error(russh::Error::SendError, "a:1").is_transport_closed());

        let reset = std::io::Error::new(ErrorKind::ConnectionReset, "reset by peer");
        assert!(classify_channel_error(russh::Error::IO(reset), "a:1").is_transport_closed());
    }

    #[test]
    fn test_refused_channel_is_plain_dial_failure() {
        let err = classify_channel_error(
            russh::Error::ChannelOpenFailure(russh::ChannelOpenFailure::ConnectFailed),
            "db.internal:5432",
        );
        assert!(matches!(err, FerryError::DialFailed(ref m) if m.contains("db.internal:5432")));
        assert!(!err.is_transport_closed());

        let refused = std::io::Error::new(ErrorKind::ConnectionRefused, "refused");
        assert!(!classify_channel_error(russh::Error::IO(refused), "a:1").is_transport_closed());
    }

    #[tokio::test]
    async fn test_handshake_to_dead_endpoint_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let target = TunnelTarget {
            endpoint: EndpointUrl::parse(&format!("ssh://alice:secret@{}", addr)).unwrap(),
            username: "alice".to_string(),
            credentials: vec![Credential::Password("secret".to_string())],
        };

        let result = SshConnector::default().handshake(&target).await;
        assert!(matches!(result, Err(FerryError::ConnectFailed(_))));
    }
}
