//! End-to-end tests: a real keeper polling real agents on loopback

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use fluxvault_agent::{AgentConfig, AgentServer, PeerTable, PrimaryAgentConfig, RegistrarConfig};
use fluxvault_core::{Identity, KeyStore, ManagedFileSpec, SessionErrorKind};
use fluxvault_crypto::MemoryKeyStore;
use fluxvault_keeper::{FileOutcome, Keeper, KeeperConfig, SessionOutcome};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn agent_config(dir: &TempDir) -> AgentConfig {
    AgentConfig::with_working_dir(dir.path())
        .with_bind("127.0.0.1", 0)
        .with_whitelist(vec!["127.0.0.1".to_string()])
        .with_rejection_delay(Duration::ZERO)
}

async fn start(config: AgentConfig) -> AgentServer {
    let identities = Arc::new(config.identity_directory().unwrap());
    AgentServer::bind(config, identities).await.unwrap()
}

fn spawn(server: AgentServer, shutdown: &CancellationToken) {
    tokio::spawn(server.run(shutdown.clone()));
}

fn vault_with_secret() -> TempDir {
    let vault = TempDir::new().unwrap();
    std::fs::write(vault.path().join("secret.txt"), b"hunter2").unwrap();
    vault
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Poll `check` until it holds or a few seconds pass
async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

fn endpoint(addr: SocketAddr) -> String {
    addr.to_string()
}

#[tokio::test]
async fn test_delivers_then_reports_unchanged() {
    let shutdown = CancellationToken::new();
    let agent_dir = TempDir::new().unwrap();
    let server = start(agent_config(&agent_dir)).await;
    let addr = server.local_addr().unwrap();
    spawn(server, &shutdown);

    let vault = vault_with_secret();
    let config = KeeperConfig::new(vault.path())
        .with_agent(endpoint(addr))
        .with_managed_file(ManagedFileSpec::new("secret.txt"));
    let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

    let first = keeper.run_cycle().await;
    assert_eq!(first.succeeded(), 1);
    let report = &first.agents[0];
    assert_eq!(report.file("secret.txt"), Some(&FileOutcome::Delivered { bytes: 7 }));
    assert_eq!(std::fs::read(agent_dir.path().join("secret.txt")).unwrap(), b"hunter2");

    let second = keeper.run_cycle().await;
    let report = &second.agents[0];
    assert!(report.succeeded());
    assert_eq!(report.file("secret.txt"), Some(&FileOutcome::Unchanged));
    assert_eq!(report.bytes_delivered(), 0);
    assert_eq!(report.status.as_ref().map(|s| s.files_written), Some(1));

    shutdown.cancel();
}

#[tokio::test]
async fn test_missing_vault_file_reported() {
    let shutdown = CancellationToken::new();
    let agent_dir = TempDir::new().unwrap();
    let server = start(agent_config(&agent_dir)).await;
    let addr = server.local_addr().unwrap();
    spawn(server, &shutdown);

    let vault = vault_with_secret();
    let config = KeeperConfig::new(vault.path())
        .with_agent(endpoint(addr))
        .with_managed_file(ManagedFileSpec::new("secret.txt"))
        .with_managed_file(ManagedFileSpec::new("absent.txt"));
    let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

    let cycle = keeper.run_cycle().await;
    let report = &cycle.agents[0];
    assert!(report.succeeded());
    assert_eq!(report.file("absent.txt"), Some(&FileOutcome::Missing));
    assert!(matches!(report.file("secret.txt"), Some(FileOutcome::Delivered { .. })));
    assert!(!agent_dir.path().join("absent.txt").exists());

    shutdown.cancel();
}

#[tokio::test]
async fn test_unlisted_reported_address_rejected() {
    let shutdown = CancellationToken::new();
    let agent_dir = TempDir::new().unwrap();
    let config = agent_config(&agent_dir).with_whitelist(vec!["10.0.0.5".to_string()]);
    let server = start(config).await;
    let addr = server.local_addr().unwrap();
    spawn(server, &shutdown);

    let vault = vault_with_secret();
    let config = KeeperConfig::new(vault.path())
        .with_agent(endpoint(addr))
        .with_managed_file(ManagedFileSpec::new("secret.txt"))
        .with_reported_address("10.0.0.9");
    let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

    let cycle = keeper.run_cycle().await;
    let report = &cycle.agents[0];
    let SessionOutcome::Failed { kind, .. } = &report.outcome else {
        panic!("expected a failed session");
    };
    assert_eq!(*kind, SessionErrorKind::UnauthorizedAddress);
    assert!(report.files.is_empty());
    assert!(!agent_dir.path().join("secret.txt").exists());

    shutdown.cancel();
}

#[tokio::test]
async fn test_claimed_address_does_not_bypass_allow_list() {
    let shutdown = CancellationToken::new();
    let agent_dir = TempDir::new().unwrap();
    let config = agent_config(&agent_dir).with_whitelist(vec!["10.0.0.5".to_string()]);
    let server = start(config).await;
    let addr = server.local_addr().unwrap();
    spawn(server, &shutdown);

    // Connects from loopback while claiming the listed address
    let vault = vault_with_secret();
    let config = KeeperConfig::new(vault.path())
        .with_agent(endpoint(addr))
        .with_managed_file(ManagedFileSpec::new("secret.txt"))
        .with_reported_address("10.0.0.5");
    let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

    let cycle = keeper.run_cycle().await;
    let report = &cycle.agents[0];
    let SessionOutcome::Failed { kind, .. } = &report.outcome else {
        panic!("expected a failed session, got {:?}", report.outcome);
    };
    assert_eq!(*kind, SessionErrorKind::UnauthorizedAddress);
    assert!(!agent_dir.path().join("secret.txt").exists());

    shutdown.cancel();
}

#[tokio::test]
async fn test_claimed_address_honoured_through_trusted_relay() {
    let shutdown = CancellationToken::new();
    let agent_dir = TempDir::new().unwrap();
    let config = agent_config(&agent_dir)
        .with_whitelist(vec!["10.0.0.5".to_string()])
        .with_trusted_relays(vec!["127.0.0.1".to_string()]);
    let server = start(config).await;
    let addr = server.local_addr().unwrap();
    spawn(server, &shutdown);

    let vault = vault_with_secret();
    let config = KeeperConfig::new(vault.path())
        .with_agent(endpoint(addr))
        .with_managed_file(ManagedFileSpec::new("secret.txt"))
        .with_reported_address("10.0.0.5");
    let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

    let cycle = keeper.run_cycle().await;
    assert!(cycle.agents[0].succeeded(), "{:?}", cycle.agents[0].outcome);
    assert_eq!(std::fs::read(agent_dir.path().join("secret.txt")).unwrap(), b"hunter2");

    shutdown.cancel();
}

#[tokio::test]
async fn test_signed_connection() {
    let shutdown = CancellationToken::new();
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let public_key = Identity::new("ops", key.verifying_key()).public_key_base64();

    let agent_dir = TempDir::new().unwrap();
    let config = agent_config(&agent_dir)
        .with_whitelist(vec![])
        .with_signed_connections("ops")
        .with_identity("ops", public_key);
    let server = start(config).await;
    let addr = server.local_addr().unwrap();
    spawn(server, &shutdown);

    let vault = vault_with_secret();
    let keeper_config = KeeperConfig::new(vault.path())
        .with_agent(endpoint(addr))
        .with_managed_file(ManagedFileSpec::new("secret.txt"))
        .with_signing_account("ops");

    let keys = MemoryKeyStore::new();
    keys.put_key("ops", &key).unwrap();
    let keeper = Keeper::with_static_addresses(keeper_config.clone(), &keys).unwrap();
    let cycle = keeper.run_cycle().await;
    assert!(cycle.agents[0].succeeded());
    assert_eq!(std::fs::read(agent_dir.path().join("secret.txt")).unwrap(), b"hunter2");

    // Same account, wrong key
    let impostor = MemoryKeyStore::new();
    impostor.put_key("ops", &SigningKey::from_bytes(&[9u8; 32])).unwrap();
    let keeper = Keeper::with_static_addresses(keeper_config, &impostor).unwrap();
    let cycle = keeper.run_cycle().await;
    let SessionOutcome::Failed { kind, .. } = &cycle.agents[0].outcome else {
        panic!("expected a failed session");
    };
    assert_eq!(*kind, SessionErrorKind::SignatureVerification);

    shutdown.cancel();
}

#[tokio::test]
async fn test_sub_agent_enrolled_then_served_over_tls() {
    let shutdown = CancellationToken::new();

    let primary_dir = TempDir::new().unwrap();
    let primary = start(
        agent_config(&primary_dir).with_registrar(RegistrarConfig {
            bind_address: "127.0.0.1".into(),
            bind_port: 0,
        }),
    )
    .await;
    let primary_addr = primary.local_addr().unwrap();
    let registrar_addr = primary.registrar_addr().unwrap().unwrap();
    let peers: Arc<PeerTable> = primary.peers().unwrap();
    spawn(primary, &shutdown);

    let sub_dir = TempDir::new().unwrap();
    let sub_port = free_port();
    let sub = start(
        agent_config(&sub_dir)
            .with_bind("127.0.0.1", sub_port)
            .with_primary(PrimaryAgentConfig {
                address: "127.0.0.1".into(),
                port: registrar_addr.port(),
                component_name: "componentb".into(),
                advertise_address: format!("127.0.0.1:{sub_port}"),
            }),
    )
    .await;
    spawn(sub, &shutdown);
    wait_for(|| peers.get("componentb").is_some()).await;

    let vault = vault_with_secret();
    std::fs::write(vault.path().join("db.conf"), b"user=app").unwrap();
    let config = KeeperConfig::new(vault.path())
        .with_agent(endpoint(primary_addr))
        .with_managed_file(ManagedFileSpec::new("secret.txt"))
        .with_component_file("componentb", ManagedFileSpec::new("db.conf"));
    let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

    let first = keeper.run_cycle().await;
    assert_eq!(first.agents.len(), 2);
    let primary_report = first.agent(&endpoint(primary_addr), None).unwrap();
    assert!(primary_report.succeeded());
    assert!(primary_report.file("db.conf").is_none());

    let sub_report = first.agent(&endpoint(primary_addr), Some("componentb")).unwrap();
    assert!(sub_report.succeeded(), "{:?}", sub_report.outcome);
    assert!(sub_report.enrolled);
    assert_eq!(sub_report.file("db.conf"), Some(&FileOutcome::Delivered { bytes: 8 }));
    assert_eq!(std::fs::read(sub_dir.path().join("db.conf")).unwrap(), b"user=app");
    assert!(!primary_dir.path().join("db.conf").exists());

    // The sub-agent re-registers with its certificate
    wait_for(|| peers.get("componentb").is_some_and(|p| p.enrolled())).await;

    let second = keeper.run_cycle().await;
    let sub_report = second.agent(&endpoint(primary_addr), Some("componentb")).unwrap();
    assert!(sub_report.succeeded(), "{:?}", sub_report.outcome);
    assert!(!sub_report.enrolled);
    assert_eq!(sub_report.status.as_ref().map(|s| s.enrolled), Some(true));
    assert_eq!(sub_report.file("db.conf"), Some(&FileOutcome::Unchanged));
    assert_eq!(sub_report.file("secret.txt"), Some(&FileOutcome::Unchanged));

    shutdown.cancel();
}

#[tokio::test]
async fn test_hung_sub_agent_keeps_primary_report() {
    let shutdown = CancellationToken::new();

    let primary_dir = TempDir::new().unwrap();
    let primary = start(
        agent_config(&primary_dir).with_registrar(RegistrarConfig {
            bind_address: "127.0.0.1".into(),
            bind_port: 0,
        }),
    )
    .await;
    let primary_addr = primary.local_addr().unwrap();
    let peers: Arc<PeerTable> = primary.peers().unwrap();
    spawn(primary, &shutdown);

    // Accepts connections and never answers
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });
    peers.register("componentb", &endpoint(silent_addr), None);

    let vault = vault_with_secret();
    std::fs::write(vault.path().join("db.conf"), b"user=app").unwrap();
    let mut config = KeeperConfig::new(vault.path())
        .with_agent(endpoint(primary_addr))
        .with_managed_file(ManagedFileSpec::new("secret.txt"))
        .with_component_file("componentb", ManagedFileSpec::new("db.conf"));
    config.cycle_deadline_secs = 2;
    config.connect_timeout_secs = 30;
    let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

    let cycle = keeper.run_cycle().await;
    assert_eq!(cycle.agents.len(), 2);

    let primary_report = cycle.agent(&endpoint(primary_addr), None).unwrap();
    assert!(primary_report.succeeded(), "{:?}", primary_report.outcome);
    assert_eq!(primary_report.file("secret.txt"), Some(&FileOutcome::Delivered { bytes: 7 }));

    let sub_report = cycle.agent(&endpoint(primary_addr), Some("componentb")).unwrap();
    let SessionOutcome::Failed { kind, .. } = &sub_report.outcome else {
        panic!("expected the sub-agent session to fail, got {:?}", sub_report.outcome);
    };
    assert_eq!(*kind, SessionErrorKind::Timeout);
    assert!(sub_report.files.is_empty());
    assert_eq!(cycle.failed(), 1);

    shutdown.cancel();
}
