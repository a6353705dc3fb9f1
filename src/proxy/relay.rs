//! Bidirectional byte relay for CONNECT sessions

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

/// Copy data both ways until each direction reaches EOF
///
/// Each direction half-closes its destination once its source is drained,
/// so a client that shuts down its write side still receives the rest of
/// the server's response. Returns `(bytes_sent, bytes_received)` from the
/// client's point of view.
#[instrument(skip(client, server))]
pub async fn splice<C, S>(client: C, server: S) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
        result
    };

    let downstream = async {
        let result = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(upstream, downstream);

    let sent = sent.unwrap_or_else(|e| {
        debug!("Client to server copy ended: {}", e);
        0
    });
    let received = received.unwrap_or_else(|e| {
        debug!("Server to client copy ended: {}", e);
        0
    });

    debug!(bytes_sent = sent, bytes_received = received, "Relay closed");
    (sent, received)
}
