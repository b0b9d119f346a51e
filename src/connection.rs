//! Per-connection handling: greet, then acknowledge every chunk.
//!
//! One spawned task owns one connection. The read loop treats whatever a
//! single read returns as one message; TCP may split or coalesce writes,
//! and no reassembly is attempted. Known limitation, kept for wire
//! compatibility.

use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Sent once to every client, immediately after accept.
pub const GREETING: &str = "\nHello!  Welcome from the server!\n";

/// Sent in reply to every chunk received after the greeting.
pub const ACK: &str = "[Server] Response: Got your message!\n";

/// Handle a single client connection.
///
/// Sends the greeting, then acknowledges each received chunk until the peer
/// closes the connection. A send failure ends only this handler; dropping
/// the stream closes the socket either way.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    buffer_size: usize,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!(%peer, "Handling new connection");

    stream.write_all(GREETING.as_bytes()).await?;

    let mut buffer = BytesMut::zeroed(buffer_size);

    loop {
        let n = stream.read(&mut buffer).await?;
        if n == 0 {
            // Orderly close by the peer
            break;
        }

        let text = String::from_utf8_lossy(&buffer[..n]);
        info!(%peer, bytes = n, text = %text.trim_end(), "Received");

        stream.write_all(ACK.as_bytes()).await?;
    }

    debug!(%peer, "Client disconnected");
    Ok(())
}
