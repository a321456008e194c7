//! FluxVault agent
//!
//! The agent runs next to an application on a remote host. It listens for a
//! keeper, authenticates it, pulls the files it manages and then serves the
//! keeper's commands:
//!
//! - [`auth`]: address allow-list and signed challenge verification
//! - [`files`]: fingerprinted, atomic writes inside the working directory
//! - [`plugin`]: runtime-installed commands with per-plugin storage
//! - [`registrar`]: sub-agent registration with a primary
//! - [`proxy`]: relaying a keeper session to a registered sub-agent
//! - [`enrollment`]: certificates issued by the keeper's authority
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fluxvault_agent::{AgentConfig, AgentServer};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = AgentConfig::from_file("agent.toml".as_ref())?;
//! let identities = Arc::new(config.identity_directory()?);
//! let server = AgentServer::bind(config, identities).await?;
//! server.run(CancellationToken::new()).await?;
//! ```

pub mod auth;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod files;
pub mod plugin;
mod proxy;
pub mod registrar;
pub mod server;
pub mod session;

pub use auth::{Authenticator, Challenge, Credentials};
pub use config::{AgentConfig, IdentityEntry, PrimaryAgentConfig, RegistrarConfig, SignedConnections};
pub use enrollment::Enrollment;
pub use error::{AgentError, AgentResult};
pub use files::{FileStore, PendingFile};
pub use plugin::{Capability, Invocation, PluginHost, SessionContext};
pub use registrar::{PeerRecord, PeerTable, Registration, RegistrarMessage};
pub use server::AgentServer;
pub use session::{AgentSession, SessionSummary};
