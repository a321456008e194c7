//! FluxVault keeper
//!
//! The keeper holds an application's managed files and pushes them to the
//! agents running next to it. On every polling cycle it:
//!
//! 1. Resolves the agent addresses through an [`AddressDirectory`](fluxvault_core::AddressDirectory)
//! 2. Opens an encrypted session with each agent and authenticates
//! 3. Serves the agent's manifest and file requests from the [`vault`]
//! 4. Ships plugins, runs configured commands and enrolls sub-agents
//! 5. Visits the sub-agents a primary lists, through the primary
//!
//! # Example
//!
//! ```ignore
//! use fluxvault_crypto::FileKeyStore;
//! use fluxvault_keeper::{Keeper, KeeperConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = KeeperConfig::from_file("keeper.toml".as_ref())?;
//! let keys = FileKeyStore::new(&config.key_store_dir);
//! let keeper = Keeper::with_static_addresses(config, &keys)?;
//! keeper.run(CancellationToken::new()).await;
//! ```

pub mod config;
pub mod error;
pub mod keeper;
pub mod report;
mod session;
pub mod vault;

pub use config::{CommandInvocation, KeeperConfig, PluginSource};
pub use error::{KeeperError, KeeperResult};
pub use keeper::{Keeper, CA_COMMON_NAME, KEEPER_COMMON_NAME};
pub use report::{
    AgentReport, CommandOutcome, CommandReport, CycleReport, FileOutcome, FileReport, SessionOutcome,
};
pub use vault::{Vault, VaultFile};
