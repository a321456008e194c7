//! Handing a keeper session over to a sub-agent
//!
//! After `proxy_ready` the primary stops being a session endpoint. It drops
//! its session key and copies bytes both ways between the keeper's connection
//! and the sub-agent's. Whatever runs over the relay, TLS and a fresh session
//! handshake, is end-to-end between keeper and sub-agent.

use std::time::Duration;

use fluxvault_transport::{relay, BoxedStream, RelayStats, SecureChannel};
use tokio::net::TcpStream;
use tracing::{info, instrument};

use crate::error::{AgentError, AgentResult};
use crate::registrar::{PeerRecord, PeerTable};

/// Look up `component_name` and connect to it
pub(crate) async fn connect_upstream(
    peers: &PeerTable,
    component_name: &str,
    timeout: Duration,
) -> AgentResult<(PeerRecord, TcpStream)> {
    let record = peers
        .get(component_name)
        .ok_or_else(|| AgentError::TargetNotRegistered(component_name.to_string()))?;

    let stream = tokio::time::timeout(timeout, TcpStream::connect(&record.address))
        .await
        .map_err(|_| {
            AgentError::CommandFailed(format!("timed out connecting to {component_name}"))
        })?
        .map_err(|e| {
            AgentError::CommandFailed(format!(
                "failed to reach {component_name} at {}: {e}",
                record.address
            ))
        })?;
    Ok((record, stream))
}

/// Relay the keeper's connection to the sub-agent until either side closes
#[instrument(skip(channel, upstream))]
pub(crate) async fn hand_off(
    channel: SecureChannel<BoxedStream>,
    upstream: TcpStream,
    component_name: &str,
) -> AgentResult<RelayStats> {
    let (client, pending) = channel.into_framed().into_parts();
    info!("Relaying keeper session to sub-agent");
    let stats = relay(client, upstream, &pending).await?;
    info!(
        to_upstream = stats.to_upstream,
        to_client = stats.to_client,
        "Relay closed"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxvault_core::SessionErrorKind;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unregistered_target() {
        let peers = PeerTable::new();
        let err = connect_upstream(&peers, "componentb", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SessionErrorKind::TargetNotRegistered);
        assert!(!err.kind().is_fatal());
    }

    #[tokio::test]
    async fn test_registered_target_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peers = PeerTable::new();
        peers.register("componentb", &addr.to_string(), None);

        let (record, _stream) = connect_upstream(&peers, "componentb", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(record.address, addr.to_string());
        assert!(listener.accept().await.is_ok());
    }
}
