//! Sub-agent registration
//!
//! A primary agent runs a registrar that sub-agents connect to. Each
//! sub-agent keeps one connection open: it sends `register`, then heartbeats,
//! and a fresh `register` whenever its details change (after enrollment). The
//! record lives as long as the connection that last wrote it; a newer
//! registration for the same name replaces the older one, and the older
//! connection closing does not remove the newer record.
//!
//! Registrar traffic is plain framed JSON: it carries only names, addresses
//! and public certificates.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fluxvault_core::PeerSummary;
use fluxvault_transport::FramedStream;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::is_host_port;
use crate::error::{AgentError, AgentResult};

/// Pause between registration attempts while the primary is unreachable
pub const REGISTRATION_RETRY: Duration = Duration::from_secs(5);

/// Interval between heartbeats on an open registration
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A registration with no traffic for this long is dropped
pub const REGISTRATION_IDLE_TIMEOUT: Duration = Duration::from_secs(35);

/// Registrar wire messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "snake_case")]
pub enum RegistrarMessage {
    Register {
        component_name: String,
        address: String,
        #[serde(default)]
        certificate_pem: Option<String>,
    },
    Registered {
        generation: u64,
    },
    Rejected {
        reason: String,
    },
    Heartbeat,
    Deregister,
}

/// A sub-agent known to the primary
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub component_name: String,
    /// `host:port` the primary dials to reach the sub-agent
    pub address: String,
    pub registered_at: DateTime<Utc>,
    /// Certificate the sub-agent was issued, once enrolled
    pub certificate_pem: Option<String>,
    generation: u64,
}

impl PeerRecord {
    /// Whether the sub-agent requires mutual TLS
    pub fn enrolled(&self) -> bool {
        self.certificate_pem.is_some()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            component_name: self.component_name.clone(),
            address: self.address.clone(),
            enrolled: self.enrolled(),
        }
    }
}

/// Registered sub-agents keyed by component name
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: DashMap<String, PeerRecord>,
    next_generation: AtomicU64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record, returning its generation
    pub fn register(
        &self,
        component_name: &str,
        address: &str,
        certificate_pem: Option<String>,
    ) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let record = PeerRecord {
            component_name: component_name.to_string(),
            address: address.to_string(),
            registered_at: Utc::now(),
            certificate_pem,
            generation,
        };
        let enrolled = record.enrolled();
        if let Some(previous) = self.peers.insert(component_name.to_string(), record) {
            if previous.address != address {
                info!(component = %component_name, old = %previous.address, new = %address, "Sub-agent address changed");
            }
        }
        info!(component = %component_name, address = %address, enrolled, generation, "Sub-agent registered");
        generation
    }

    /// Remove `component_name` if it still carries `generation`
    pub fn deregister(&self, component_name: &str, generation: u64) -> bool {
        let removed = self
            .peers
            .remove_if(component_name, |_, record| record.generation == generation)
            .is_some();
        if removed {
            info!(component = %component_name, "Sub-agent deregistered");
        }
        removed
    }

    pub fn get(&self, component_name: &str) -> Option<PeerRecord> {
        self.peers.get(component_name).map(|r| r.clone())
    }

    /// Summaries sorted by name
    pub fn list(&self) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self.peers.iter().map(|r| r.summary()).collect();
        peers.sort_by(|a, b| a.component_name.cmp(&b.component_name));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

fn validate_registration(component_name: &str, address: &str) -> Result<(), String> {
    let valid_name = !component_name.is_empty()
        && component_name.len() <= 63
        && component_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid_name {
        return Err(format!("invalid component name {component_name:?}"));
    }
    if !is_host_port(address) {
        return Err(format!("address must be host:port, got {address:?}"));
    }
    Ok(())
}

/// Accept sub-agent registrations until cancelled
pub async fn serve_registrar(listener: TcpListener, table: Arc<PeerTable>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Registrar accept failed");
                    continue;
                }
            },
        };
        let table = Arc::clone(&table);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = handle_registration(stream, peer, table) => {
                    if let Err(e) = result {
                        debug!(peer = %peer, error = %e, "Registration connection ended");
                    }
                }
            }
        });
    }
    debug!("Registrar stopped");
}

/// Serve one sub-agent's registration connection
#[instrument(skip(stream, table))]
async fn handle_registration(stream: TcpStream, peer: SocketAddr, table: Arc<PeerTable>) -> AgentResult<()> {
    let mut framed = FramedStream::new(stream);
    let mut current: Option<(String, u64)> = None;

    let result = loop {
        let message = match tokio::time::timeout(REGISTRATION_IDLE_TIMEOUT, framed.read_frame::<RegistrarMessage>()).await {
            Err(_) => break Err(AgentError::Timeout(REGISTRATION_IDLE_TIMEOUT)),
            Ok(Err(e)) => break Err(e.into()),
            Ok(Ok(None)) => break Ok(()),
            Ok(Ok(Some(message))) => message,
        };

        match message {
            RegistrarMessage::Register {
                component_name,
                address,
                certificate_pem,
            } => {
                if let Err(reason) = validate_registration(&component_name, &address) {
                    warn!(peer = %peer, reason = %reason, "Registration rejected");
                    framed.write_frame(&RegistrarMessage::Rejected { reason }).await?;
                    break Ok(());
                }
                if let Some((previous, generation)) = current.take() {
                    if previous != component_name {
                        table.deregister(&previous, generation);
                    }
                }
                let generation = table.register(&component_name, &address, certificate_pem);
                current = Some((component_name, generation));
                framed.write_frame(&RegistrarMessage::Registered { generation }).await?;
            }
            RegistrarMessage::Heartbeat => {}
            RegistrarMessage::Deregister => break Ok(()),
            other => {
                break Err(AgentError::Protocol(format!("unexpected registrar message {other:?}")));
            }
        }
    };

    if let Some((component_name, generation)) = current {
        table.deregister(&component_name, generation);
    }
    result
}

/// What a sub-agent registers as
#[derive(Debug, Clone)]
pub struct Registration {
    pub registrar_address: String,
    pub component_name: String,
    pub advertise_address: String,
}

/// Keep this sub-agent registered until cancelled
///
/// `certificate` carries the installed certificate; each change is sent as a
/// fresh registration.
pub async fn run_registration(
    registration: Registration,
    mut certificate: watch::Receiver<Option<String>>,
    shutdown: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = register_once(&registration, &mut certificate, &shutdown) => result,
        };
        match result {
            Ok(()) => return,
            Err(e) => warn!(
                registrar = %registration.registrar_address,
                error = %e,
                retry_in = ?REGISTRATION_RETRY,
                "Registration with primary failed"
            ),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(REGISTRATION_RETRY) => {}
        }
    }
}

async fn send_register(
    framed: &mut FramedStream<TcpStream>,
    registration: &Registration,
    certificate_pem: Option<String>,
) -> AgentResult<u64> {
    framed
        .write_frame(&RegistrarMessage::Register {
            component_name: registration.component_name.clone(),
            address: registration.advertise_address.clone(),
            certificate_pem,
        })
        .await?;
    match framed.read_frame::<RegistrarMessage>().await? {
        Some(RegistrarMessage::Registered { generation }) => Ok(generation),
        Some(RegistrarMessage::Rejected { reason }) => Err(AgentError::Protocol(format!(
            "registration rejected: {reason}"
        ))),
        Some(other) => Err(AgentError::Protocol(format!("unexpected reply {other:?}"))),
        None => Err(AgentError::Protocol("registrar closed the connection".into())),
    }
}

/// One registration connection; returns `Ok` only when cancelled
async fn register_once(
    registration: &Registration,
    certificate: &mut watch::Receiver<Option<String>>,
    shutdown: &CancellationToken,
) -> AgentResult<()> {
    let stream = TcpStream::connect(&registration.registrar_address).await?;
    let mut framed = FramedStream::new(stream);

    let initial = certificate.borrow_and_update().clone();
    let enrolled = initial.is_some();
    send_register(&mut framed, registration, initial).await?;
    info!(
        registrar = %registration.registrar_address,
        component = %registration.component_name,
        enrolled,
        "Registered with primary"
    );

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut watching = true;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = framed.write_frame(&RegistrarMessage::Deregister).await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                framed.write_frame(&RegistrarMessage::Heartbeat).await?;
            }
            changed = certificate.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let updated = certificate.borrow_and_update().clone();
                send_register(&mut framed, registration, updated).await?;
                info!(component = %registration.component_name, "Registration updated after enrollment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_last_wins_and_stale_removal_ignored() {
        let table = PeerTable::new();
        let first = table.register("componentb", "10.0.0.7:8888", None);
        let second = table.register("componentb", "10.0.0.8:8888", None);

        assert_eq!(table.get("componentb").unwrap().address, "10.0.0.8:8888");
        assert!(!table.deregister("componentb", first));
        assert!(table.get("componentb").is_some());
        assert!(table.deregister("componentb", second));
        assert!(table.is_empty());
    }

    #[test]
    fn test_list_sorted_with_enrollment() {
        let table = PeerTable::new();
        table.register("componentc", "10.0.0.9:8888", Some("PEM".into()));
        table.register("componentb", "10.0.0.8:8888", None);

        let peers = table.list();
        assert_eq!(peers[0].component_name, "componentb");
        assert!(!peers[0].enrolled);
        assert!(peers[1].enrolled);
    }

    #[test]
    fn test_registration_validation() {
        assert!(validate_registration("componentb", "10.0.0.8:8888").is_ok());
        assert!(validate_registration("", "10.0.0.8:8888").is_err());
        assert!(validate_registration("bad name", "10.0.0.8:8888").is_err());
        assert!(validate_registration("componentb", "10.0.0.8").is_err());
    }

    async fn wait_for<F: Fn(&PeerTable) -> bool>(table: &PeerTable, check: F) {
        for _ in 0..200 {
            if check(table) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_client_registers_updates_and_is_removed_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let table = Arc::new(PeerTable::new());
        let stop_registrar = CancellationToken::new();
        let server = tokio::spawn(serve_registrar(listener, Arc::clone(&table), stop_registrar.clone()));

        let (cert_tx, cert_rx) = watch::channel(None);
        let stop_client = CancellationToken::new();
        let client = tokio::spawn(run_registration(
            Registration {
                registrar_address: addr.to_string(),
                component_name: "componentb".into(),
                advertise_address: "127.0.0.1:9999".into(),
            },
            cert_rx,
            stop_client.clone(),
        ));

        wait_for(&table, |t| t.get("componentb").is_some()).await;
        assert!(!table.get("componentb").unwrap().enrolled());

        cert_tx.send(Some("CERT".into())).unwrap();
        wait_for(&table, |t| t.get("componentb").is_some_and(|r| r.enrolled())).await;

        stop_client.cancel();
        client.await.unwrap();
        wait_for(&table, |t| t.is_empty()).await;

        stop_registrar.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_connection_removes_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let table = Arc::new(PeerTable::new());
        let stop = CancellationToken::new();
        let server = tokio::spawn(serve_registrar(listener, Arc::clone(&table), stop.clone()));

        let mut framed = FramedStream::new(TcpStream::connect(addr).await.unwrap());
        framed
            .write_frame(&RegistrarMessage::Register {
                component_name: "componentb".into(),
                address: "127.0.0.1:9999".into(),
                certificate_pem: None,
            })
            .await
            .unwrap();
        let reply: RegistrarMessage = framed.read_frame().await.unwrap().unwrap();
        assert!(matches!(reply, RegistrarMessage::Registered { .. }));
        assert_eq!(table.len(), 1);

        drop(framed);
        wait_for(&table, |t| t.is_empty()).await;

        stop.cancel();
        server.await.unwrap();
    }
}
