//! Self-healing tunnel engine
//!
//! The engine keeps one authenticated tunnel session open and opens every
//! outgoing connection as a sub-dial through it. When a sub-dial reports that
//! the session itself is gone, the dialer reconnects and retries the dial, so
//! sessions served concurrently never see the outage.
//!
//! Reconnects are single-flight. Every handshake attempt bumps an epoch
//! counter; a caller that saw the transport fail at epoch `n` only drives a
//! new handshake if nobody has attempted one since `n`. Everybody else waits
//! for that attempt and then either retries on the new session or returns the
//! same error it produced. The handshake runs on its own task, so a dial that
//! is cancelled while driving it does not cut the episode short.

mod credentials;
mod endpoint;
mod ssh;

pub use credentials::{
    default_key_path, resolve_username, Credential, CredentialResolver,
    DefaultCredentialResolver,
};
pub use endpoint::{EndpointUrl, DEFAULT_SSH_PORT};
pub use ssh::{classify_channel_error, SshConnection, SshConnector};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{DirectEngine, DirectEngineConfig, Engine};
use crate::error::{FerryError, Result};
use crate::proxy::session::Session;
use crate::proxy::transport::{BoxedConnection, Dialer};

/// One authenticated tunnel session
#[async_trait]
pub trait TunnelConnection: Send + Sync {
    /// Open a sub-connection to `address` through the tunnel
    ///
    /// Must fail with [`FerryError::TransportClosed`] when the session itself
    /// is gone, and with any other error when only this destination failed.
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConnection>;

    /// Tear the session down
    async fn close(&self);
}

/// Performs tunnel handshakes
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn handshake(&self, target: &TunnelTarget) -> Result<Arc<dyn TunnelConnection>>;
}

/// Everything needed to (re)establish the tunnel
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    pub endpoint: EndpointUrl,
    pub username: String,
    pub credentials: Vec<Credential>,
}

/// Tunnel engine tuning
#[derive(Debug, Clone, Copy)]
pub struct TunnelOptions {
    /// Bound on each handshake, initial or reconnect
    pub handshake_timeout: Duration,
    /// Bound on each sub-dial through the tunnel
    pub dial_timeout: Duration,
    /// Reconnects one dial may drive itself before giving up
    pub max_reconnects: u32,
    /// Timeouts for the HTTP side
    pub direct: DirectEngineConfig,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            dial_timeout: Duration::from_secs(10),
            max_reconnects: 3,
            direct: DirectEngineConfig::default(),
        }
    }
}

struct Slot {
    connection: Arc<dyn TunnelConnection>,
    epoch: u64,
    closed: bool,
}

/// Outcome of the most recent handshake attempt
struct Episode {
    epoch: u64,
    failure: Option<String>,
}

/// State shared between dials and the reconnect tasks they spawn
struct Shared {
    target: TunnelTarget,
    connector: Arc<dyn TunnelConnector>,
    options: TunnelOptions,
    slot: RwLock<Slot>,
    episode: Mutex<Episode>,
    shutting_down: AtomicBool,
}

impl Shared {
    fn current(&self) -> (Arc<dyn TunnelConnection>, u64) {
        let slot = self.slot.read();
        (slot.connection.clone(), slot.epoch)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn shut_down_error(&self) -> FerryError {
        FerryError::ConnectFailed(format!("tunnel to {} is shut down", self.target.endpoint))
    }

    /// Take the current connection out of service, at most once per connection
    fn retire(&self) -> Option<Arc<dyn TunnelConnection>> {
        let mut slot = self.slot.write();
        let already_closed = std::mem::replace(&mut slot.closed, true);
        (!already_closed).then(|| slot.connection.clone())
    }

    /// Replace the connection observed broken at `observed_epoch`
    ///
    /// Returns `Ok(true)` if this call performed the handshake, `Ok(false)` if
    /// a newer connection was already installed by someone else, or the error
    /// of the handshake attempt that failed.
    async fn reconnect(&self, observed_epoch: u64) -> Result<bool> {
        let mut episode = self.episode.lock().await;

        if episode.epoch != observed_epoch {
            debug!(
                observed_epoch,
                epoch = episode.epoch,
                "Reconnect already handled by another dial"
            );
            return match &episode.failure {
                Some(message) => Err(FerryError::ConnectFailed(message.clone())),
                None => Ok(false),
            };
        }
        if self.is_shutting_down() {
            return Err(self.shut_down_error());
        }

        if let Some(stale) = self.retire() {
            stale.close().await;
        }

        info!(endpoint = %self.target.endpoint, "Reconnecting tunnel");
        let outcome = handshake(
            self.connector.as_ref(),
            &self.target,
            self.options.handshake_timeout,
        )
        .await;

        episode.epoch += 1;
        let mut slot = self.slot.write();
        slot.epoch = episode.epoch;

        match outcome {
            Ok(connection) => {
                slot.connection = connection;
                slot.closed = false;
                episode.failure = None;
                info!(epoch = episode.epoch, "Tunnel reconnected");
                Ok(true)
            }
            Err(e) => {
                // The stale, closed session stays in place; the next dial
                // that trips over it starts a fresh attempt.
                let message = e.to_string();
                warn!(epoch = episode.epoch, "Tunnel reconnect failed: {}", message);
                episode.failure = Some(message.clone());
                Err(FerryError::ConnectFailed(message))
            }
        }
    }
}

/// Dialer that routes through the tunnel and repairs it when it drops
pub struct ReconnectingDialer {
    shared: Arc<Shared>,
}

impl ReconnectingDialer {
    /// Run the initial handshake; no reconnect policy applies to it
    pub async fn establish(
        target: TunnelTarget,
        connector: Arc<dyn TunnelConnector>,
        options: TunnelOptions,
    ) -> Result<Self> {
        let connection = handshake(connector.as_ref(), &target, options.handshake_timeout).await?;

        let shared = Shared {
            target,
            connector,
            options,
            slot: RwLock::new(Slot {
                connection,
                epoch: 0,
                closed: false,
            }),
            episode: Mutex::new(Episode {
                epoch: 0,
                failure: None,
            }),
            shutting_down: AtomicBool::new(false),
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.shared.target
    }

    /// Number of handshake attempts made since the initial one
    pub fn epoch(&self) -> u64 {
        self.shared.slot.read().epoch
    }

    /// Repair the tunnel on a detached task
    ///
    /// The episode runs to completion even if the calling dial is dropped
    /// halfway through the handshake; later callers join its result.
    async fn reconnect(&self, observed_epoch: u64) -> Result<bool> {
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.reconnect(observed_epoch).await })
            .await
            .map_err(|e| FerryError::ConnectFailed(format!("reconnect task failed: {}", e)))?
    }

    /// Close the current session; dials fail fast from here on
    pub async fn close(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        if let Some(connection) = self.shared.retire() {
            connection.close().await;
        }
    }
}

#[async_trait]
impl Dialer for ReconnectingDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedConnection> {
        let options = self.shared.options;
        // Only rounds this dial drove itself count against the cap.
        let mut reconnects = 0;

        loop {
            if self.shared.is_shutting_down() {
                return Err(self.shared.shut_down_error());
            }
            let (connection, epoch) = self.shared.current();

            let attempt = connection.dial(network, address);
            let result = match tokio::time::timeout(options.dial_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(FerryError::Timeout),
            };

            match result {
                Err(e) if e.is_transport_closed() => {
                    if self.shared.is_shutting_down() {
                        return Err(self.shared.shut_down_error());
                    }
                    if reconnects >= options.max_reconnects {
                        return Err(FerryError::ConnectFailed(format!(
                            "tunnel to {} kept closing after {} reconnects: {}",
                            self.shared.target.endpoint, reconnects, e
                        )));
                    }
                    warn!(address, epoch, "Tunnel transport closed: {}", e);
                    if self.reconnect(epoch).await? {
                        reconnects += 1;
                    }
                }
                other => return other,
            }
        }
    }
}

async fn handshake(
    connector: &dyn TunnelConnector,
    target: &TunnelTarget,
    timeout: Duration,
) -> Result<Arc<dyn TunnelConnection>> {
    match tokio::time::timeout(timeout, connector.handshake(target)).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(FerryError::ConnectFailed(message))) => Err(FerryError::ConnectFailed(message)),
        Ok(Err(other)) => Err(FerryError::ConnectFailed(other.to_string())),
        Err(_) => Err(FerryError::ConnectFailed(format!(
            "handshake with {} timed out after {}s",
            target.endpoint,
            timeout.as_secs()
        ))),
    }
}

/// Engine that dials everything through a self-healing tunnel
pub struct TunnelEngine {
    dialer: Arc<ReconnectingDialer>,
    direct: DirectEngine,
}

impl TunnelEngine {
    /// Parse the endpoint, resolve credentials and run the initial handshake
    ///
    /// Nothing is returned unless the handshake succeeds.
    #[instrument(skip_all)]
    pub async fn create(
        endpoint: &str,
        resolver: &dyn CredentialResolver,
        connector: Arc<dyn TunnelConnector>,
        options: TunnelOptions,
    ) -> Result<Self> {
        let endpoint = EndpointUrl::parse(endpoint)?;
        let username = resolve_username(&endpoint)?;
        let credentials = resolver.resolve(&endpoint)?;
        debug!(?credentials, %username, "Resolved tunnel credentials");

        let target = TunnelTarget {
            endpoint,
            username,
            credentials,
        };
        let dialer = Arc::new(ReconnectingDialer::establish(target, connector, options).await?);
        info!(endpoint = %dialer.target().endpoint, "Tunnel engine ready");

        Ok(Self {
            direct: DirectEngine::new(dialer.clone(), options.direct),
            dialer,
        })
    }

    /// Tunnel over SSH, authenticating with the default key and/or the
    /// password in the endpoint URL
    pub async fn connect_ssh(
        endpoint: &str,
        key_path: Option<PathBuf>,
        options: TunnelOptions,
    ) -> Result<Self> {
        let scheme = EndpointUrl::parse(endpoint)?.scheme;
        if scheme != "ssh" {
            return Err(FerryError::InvalidConfig(format!(
                "unsupported tunnel scheme \"{}\", expected ssh",
                scheme
            )));
        }

        let resolver = match key_path {
            Some(path) => DefaultCredentialResolver::with_key_path(path),
            None => DefaultCredentialResolver::new(),
        };
        Self::create(endpoint, &resolver, Arc::new(SshConnector::default()), options).await
    }

    pub fn dialer(&self) -> &Arc<ReconnectingDialer> {
        &self.dialer
    }
}

#[async_trait]
impl Engine for TunnelEngine {
    async fn serve(&self, session: Session) {
        self.direct.serve(session).await
    }

    async fn connect(&self, session: Session) {
        self.direct.connect(session).await
    }

    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn shutdown(&self) {
        self.dialer.close().await
    }
}
