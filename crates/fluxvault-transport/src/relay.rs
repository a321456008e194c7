//! Opaque byte relay between two streams
//!
//! Used by a primary agent once a keeper session is handed to a sub-agent.
//! Bytes are copied as they arrive and never inspected, logged or retained.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::TransportResult;

/// Byte counts of a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes forwarded from the client to the upstream
    pub to_upstream: u64,
    /// Bytes forwarded from the upstream to the client
    pub to_client: u64,
}

/// Forward bytes both ways until either side closes
///
/// `pending` holds bytes already read from `client` that belong to the
/// upstream; they are written first so nothing is lost or reordered.
pub async fn relay<A, B>(mut client: A, mut upstream: B, pending: &[u8]) -> TransportResult<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    if !pending.is_empty() {
        upstream.write_all(pending).await?;
    }

    let (to_upstream, to_client) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    let stats = RelayStats {
        to_upstream: to_upstream + pending.len() as u64,
        to_client,
    };
    debug!(
        to_upstream = stats.to_upstream,
        to_client = stats.to_client,
        "Relay finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_relay_is_transparent() {
        let (mut keeper, primary_client_side) = duplex(1024);
        let (primary_upstream_side, mut sub_agent) = duplex(1024);

        let relay_task = tokio::spawn(async move {
            relay(primary_client_side, primary_upstream_side, b"early-").await
        });

        let payload: Vec<u8> = (0..=255u8).cycle().take(4000).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            keeper.write_all(&sent).await.unwrap();
            keeper.shutdown().await.unwrap();
            let mut back = Vec::new();
            keeper.read_to_end(&mut back).await.unwrap();
            back
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 512];
        while received.len() < payload.len() + 6 {
            let n = sub_agent.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&received[..6], b"early-");
        assert_eq!(&received[6..], &payload[..]);

        sub_agent.write_all(b"reply").await.unwrap();
        sub_agent.shutdown().await.unwrap();
        drop(sub_agent);

        assert_eq!(writer.await.unwrap(), b"reply");
        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.to_upstream, payload.len() as u64 + 6);
        assert_eq!(stats.to_client, 5);
    }
}
