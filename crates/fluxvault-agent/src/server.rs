//! Agent listener
//!
//! Accepts keeper connections and runs one [`AgentSession`] per connection.
//! A primary also serves the registrar; a sub-agent keeps itself registered
//! with its primary. Once enrolled, every connection must complete mutual TLS
//! before the session handshake.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use fluxvault_core::{AgentRole, IdentityDirectory};
use fluxvault_transport::BoxedStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::{join_host_port, AgentConfig};
use crate::enrollment::Enrollment;
use crate::error::{AgentError, AgentResult};
use crate::files::FileStore;
use crate::plugin::PluginHost;
use crate::registrar::{run_registration, serve_registrar, PeerTable, Registration};
use crate::session::AgentSession;

/// State shared by every session on this agent
pub(crate) struct AgentState {
    pub(crate) config: AgentConfig,
    pub(crate) authenticator: Authenticator,
    pub(crate) files: FileStore,
    pub(crate) plugins: PluginHost,
    pub(crate) peers: Option<Arc<PeerTable>>,
    pub(crate) enrollment: Enrollment,
    pub(crate) started: Instant,
}

/// A bound agent, ready to serve
pub struct AgentServer {
    state: Arc<AgentState>,
    listener: TcpListener,
    registrar: Option<TcpListener>,
}

impl AgentServer {
    /// Validate `config`, restore installed state and bind the listeners
    pub async fn bind(
        config: AgentConfig,
        identities: Arc<dyn IdentityDirectory>,
    ) -> AgentResult<Self> {
        config.validate()?;
        let authenticator = Authenticator::from_config(&config, identities)?;

        let state_dir = config.working_dir.join(".fluxvault");
        let plugins = PluginHost::new(config.plugins_dir(), config.plugin_command_timeout());
        let restored = plugins.restore().await?;
        let enrollment = Enrollment::load(state_dir.join("tls")).await?;

        let listener = TcpListener::bind(config.listen_address()).await?;
        let registrar = match &config.registrar {
            Some(registrar) => Some(
                TcpListener::bind(join_host_port(&registrar.bind_address, registrar.bind_port))
                    .await?,
            ),
            None => None,
        };

        info!(
            address = %listener.local_addr()?,
            role = ?config.role(),
            working_dir = %config.working_dir.display(),
            plugins = restored,
            enrolled = enrollment.is_enrolled().await,
            "Agent listening"
        );

        let peers = registrar.as_ref().map(|_| Arc::new(PeerTable::new()));
        let state = AgentState {
            files: FileStore::new(config.working_dir.clone()),
            config,
            authenticator,
            plugins,
            peers,
            enrollment,
            started: Instant::now(),
        };

        Ok(Self {
            state: Arc::new(state),
            listener,
            registrar,
        })
    }

    pub fn local_addr(&self) -> AgentResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Address of the registrar, on a primary
    pub fn registrar_addr(&self) -> AgentResult<Option<SocketAddr>> {
        self.registrar
            .as_ref()
            .map(|l| l.local_addr().map_err(AgentError::from))
            .transpose()
    }

    /// Sub-agents registered with this primary
    pub fn peers(&self) -> Option<Arc<PeerTable>> {
        self.state.peers.clone()
    }

    pub fn role(&self) -> AgentRole {
        self.state.config.role()
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> AgentResult<()> {
        let mut background = JoinSet::new();

        if let (Some(listener), Some(peers)) = (self.registrar, self.state.peers.clone()) {
            background.spawn(serve_registrar(listener, peers, shutdown.child_token()));
        }
        if let Some(primary) = &self.state.config.primary {
            let registration = Registration {
                registrar_address: primary.registrar_address(),
                component_name: primary.component_name.clone(),
                advertise_address: primary.advertise_address.clone(),
            };
            background.spawn(run_registration(
                registration,
                self.state.enrollment.subscribe(),
                shutdown.child_token(),
            ));
        }

        let mut sessions = JoinSet::new();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            debug!(peer = %peer, "Accepted connection");

            let state = self.state.clone();
            sessions.spawn(async move {
                let Some(stream) = secure_stream(&state, stream, peer).await else {
                    return;
                };
                let summary = AgentSession::new(state, peer).run(stream).await;
                debug!(
                    peer = %summary.peer,
                    state = ?summary.state,
                    files_written = summary.files_written,
                    "Session finished"
                );
            });

            while sessions.try_join_next().is_some() {}
        }

        info!(active = sessions.len(), "Agent shutting down");
        sessions.shutdown().await;
        background.shutdown().await;
        Ok(())
    }
}

/// Wrap the connection in TLS if this agent is enrolled
async fn secure_stream(
    state: &AgentState,
    stream: TcpStream,
    peer: SocketAddr,
) -> Option<BoxedStream> {
    let Some(acceptor) = state.enrollment.acceptor().await else {
        return Some(Box::new(stream));
    };

    let timeout = state.config.handshake_timeout();
    match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => Some(Box::new(tls)),
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "TLS handshake failed, connection dropped");
            None
        }
        Err(_) => {
            warn!(peer = %peer, ?timeout, "TLS handshake timed out");
            None
        }
    }
}
