//! Polling cycles
//!
//! Each cycle resolves the application's agent addresses and runs one session
//! per address, at most `max_parallel_sessions` at a time. Every session,
//! sub-agent sessions included, runs within the cycle deadline. A primary's registered sub-agents are visited through it
//! after its own session. Every agent gets its own report; one unreachable
//! agent never stops the cycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ed25519_dalek::SigningKey;
use fluxvault_core::{AddressDirectory, KeyStore, PluginBundle, StaticAddressDirectory};
use fluxvault_crypto::CertificateAuthority;
use fluxvault_transport::{BoxedStream, FramedStream, TlsConnector, TlsIdentity};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::{KeeperConfig, PluginSource};
use crate::error::{KeeperError, KeeperResult};
use crate::report::{AgentReport, CycleReport};
use crate::session::KeeperSession;
use crate::vault::Vault;

/// Common name of the keeper's root certificate
pub const CA_COMMON_NAME: &str = "fluxvault-keeper-ca";

/// Common name of the keeper's client certificate on proxied hops
pub const KEEPER_COMMON_NAME: &str = "keeper.fluxvault.local";

/// Everything a session needs from its keeper
pub(crate) struct KeeperContext {
    pub(crate) config: KeeperConfig,
    pub(crate) vault: Vault,
    pub(crate) authority: CertificateAuthority,
    pub(crate) connector: TlsConnector,
    pub(crate) signing: Option<(String, SigningKey)>,
    pub(crate) bundles: Vec<PluginBundle>,
}

/// Delivers managed files to an application's agents
pub struct Keeper {
    ctx: Arc<KeeperContext>,
    directory: Arc<dyn AddressDirectory>,
}

impl Keeper {
    /// Build a keeper, reading its signing key from `keys`
    ///
    /// A fresh certificate authority is created; certificates issued by an
    /// earlier keeper process are no longer trusted.
    pub fn new<K: KeyStore>(
        config: KeeperConfig,
        directory: Arc<dyn AddressDirectory>,
        keys: &K,
    ) -> KeeperResult<Self> {
        config.validate()?;
        let vault = Vault::new(
            config.vault_dir.clone(),
            config.managed_files.clone(),
            config.component_files.clone(),
        )?;

        let signing = match &config.signing_account {
            Some(account) => {
                let key = keys
                    .get_key(account)
                    .map_err(|e| KeeperError::KeyStore(e.to_string()))?
                    .ok_or_else(|| {
                        KeeperError::KeyStore(format!("no signing key stored for {account:?}"))
                    })?;
                Some((account.clone(), key))
            }
            None => None,
        };

        let authority = CertificateAuthority::new(CA_COMMON_NAME)?;
        let leaf = authority.issue_identity(KEEPER_COMMON_NAME)?;
        let identity = TlsIdentity::new(leaf.certificate_pem, leaf.key_pem, authority.root_certificate_pem());
        let connector = TlsConnector::new(&identity)?;

        let bundles = config
            .plugins
            .iter()
            .map(PluginSource::to_bundle)
            .collect::<KeeperResult<Vec<_>>>()?;

        info!(
            app = %config.app_name,
            vault = %config.vault_dir.display(),
            shared_files = config.managed_files.len(),
            components = config.component_files.len(),
            plugins = bundles.len(),
            signing_account = ?config.signing_account,
            "Keeper ready"
        );

        Ok(Self {
            ctx: Arc::new(KeeperContext {
                config,
                vault,
                authority,
                connector,
                signing,
                bundles,
            }),
            directory,
        })
    }

    /// Build a keeper polling the configured `agent_addresses`
    pub fn with_static_addresses<K: KeyStore>(config: KeeperConfig, keys: &K) -> KeeperResult<Self> {
        let directory = Arc::new(StaticAddressDirectory::new(config.agent_addresses.clone()));
        Self::new(config, directory, keys)
    }

    pub fn config(&self) -> &KeeperConfig {
        &self.ctx.config
    }

    /// The authority that signs sub-agent certificates
    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.ctx.authority
    }

    /// Poll every agent once
    #[instrument(skip(self), fields(app = %self.ctx.config.app_name))]
    pub async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let addresses = self.directory.addresses(&self.ctx.config.app_name).await;
        if addresses.is_empty() {
            info!("No agents found, nothing to do");
        }

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.max_parallel_sessions));
        let mut tasks = JoinSet::new();
        for address in addresses {
            let endpoint = self.ctx.config.agent_endpoint(&address);
            let ctx = self.ctx.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Vec::new();
                };
                poll_agent(&ctx, &endpoint).await
            });
        }

        let mut agents = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(reports) => agents.extend(reports),
                Err(e) => error!(error = %e, "Agent task panicked"),
            }
        }
        agents.sort_by(|a, b| (&a.address, &a.component).cmp(&(&b.address, &b.component)));

        let report = CycleReport {
            started_at,
            duration: start.elapsed(),
            agents,
        };
        report.log();
        report
    }

    /// Poll on the configured interval until cancelled, or once with
    /// `run_once`; returns the last completed cycle
    pub async fn run(&self, shutdown: CancellationToken) -> Option<CycleReport> {
        let interval = self.ctx.config.polling_interval();
        let mut last = None;
        loop {
            let report = tokio::select! {
                _ = shutdown.cancelled() => break,
                report = self.run_cycle() => report,
            };
            last = Some(report);
            if self.ctx.config.run_once {
                break;
            }

            debug!(next_in = ?interval, "Waiting for next cycle");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Keeper stopped");
        last
    }
}

async fn connect(ctx: &KeeperContext, endpoint: &str) -> KeeperResult<FramedStream<BoxedStream>> {
    let timeout = ctx.config.connect_timeout();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
        .await
        .map_err(|_| KeeperError::Connect {
            address: endpoint.to_string(),
            reason: format!("timed out after {timeout:?}"),
        })?
        .map_err(|e| KeeperError::Connect {
            address: endpoint.to_string(),
            reason: e.to_string(),
        })?;
    Ok(FramedStream::new(Box::new(stream)))
}

/// Session with the agent at `endpoint`, then with each sub-agent it lists
///
/// Every session gets its own deadline, so a hung sub-agent costs only its
/// own report.
async fn poll_agent(ctx: &KeeperContext, endpoint: &str) -> Vec<AgentReport> {
    let deadline = ctx.config.cycle_deadline();
    let session = async {
        let framed = connect(ctx, endpoint).await?;
        Ok::<_, KeeperError>(KeeperSession::new(ctx, endpoint, None).run(framed).await)
    };
    let (report, peers) = match within(deadline, session).await {
        Ok(finished) => finished,
        Err(e) => (AgentReport::failed(endpoint, None, &e), Vec::new()),
    };

    let mut reports = vec![report];
    for peer in peers {
        reports.push(poll_sub_agent(ctx, endpoint, &peer.component_name).await);
    }
    reports
}

async fn poll_sub_agent(ctx: &KeeperContext, endpoint: &str, component: &str) -> AgentReport {
    let session = async {
        let framed = connect(ctx, endpoint).await?;
        let relayed = KeeperSession::new(ctx, endpoint, None)
            .open_relay(framed, component)
            .await?;
        Ok::<_, KeeperError>(KeeperSession::new(ctx, endpoint, Some(component)).run(relayed).await.0)
    };
    within(ctx.config.cycle_deadline(), session)
        .await
        .unwrap_or_else(|e| AgentReport::failed(endpoint, Some(component.to_string()), &e))
}

/// Run `session`, dropping it with `Timeout` once `deadline` passes
async fn within<T>(
    deadline: Duration,
    session: impl Future<Output = KeeperResult<T>>,
) -> KeeperResult<T> {
    tokio::time::timeout(deadline, session)
        .await
        .map_err(|_| KeeperError::Timeout(deadline))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxvault_core::ManagedFileSpec;
    use fluxvault_crypto::MemoryKeyStore;
    use tempfile::TempDir;

    #[test]
    fn test_missing_signing_key_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = KeeperConfig::new(dir.path()).with_signing_account("ops");
        let result = Keeper::with_static_addresses(config, &MemoryKeyStore::new());
        assert!(matches!(result, Err(KeeperError::KeyStore(_))));
    }

    #[test]
    fn test_keeper_identity_chains_to_its_authority() {
        let dir = TempDir::new().unwrap();
        let config = KeeperConfig::new(dir.path()).with_managed_file(ManagedFileSpec::new("secret.txt"));
        let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

        let issued = keeper.certificate_authority().issued();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].1, KEEPER_COMMON_NAME);
    }

    #[tokio::test]
    async fn test_unreachable_agent_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        // Bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = KeeperConfig::new(dir.path())
            .with_agent(format!("127.0.0.1:{port}"))
            .with_run_once(true);
        let keeper = Keeper::with_static_addresses(config, &MemoryKeyStore::new()).unwrap();

        let report = keeper.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.agents.len(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.agents[0].succeeded());
    }
}
