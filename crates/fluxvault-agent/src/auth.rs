//! Keeper authentication
//!
//! One mode applies per agent:
//!
//! - **Signature**: the keeper signs the per-connection challenge; the
//!   signature is checked against the configured account's public key from
//!   the identity directory. The address allow-list is ignored in this mode.
//! - **Address**: the observed socket address must be on the allow-list. A
//!   supplied address is honoured only when the socket peer is a trusted
//!   relay (a configured relay or this sub-agent's primary), which lets a
//!   keeper behind a primary's relay be checked by its real address.
//! - **Disabled**: every keeper is accepted.
//!
//! Every rejection looks the same to the peer.

use std::net::IpAddr;
use std::sync::Arc;

use fluxvault_core::IdentityDirectory;
use fluxvault_crypto::{challenge_nonce, verify_challenge};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone)]
enum AuthMode {
    Disabled,
    Address {
        whitelist: Vec<IpAddr>,
        relays: Vec<IpAddr>,
    },
    Signature { account: String },
}

/// Nonce issued to one connection
#[derive(Debug, Clone)]
pub struct Challenge {
    pub nonce: [u8; 32],
    pub signature_required: bool,
}

/// What the keeper presented in its `auth_response`
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub account: Option<String>,
    pub signature: Option<Vec<u8>>,
    pub address: Option<String>,
}

/// Decides whether a keeper may open a session
#[derive(Clone)]
pub struct Authenticator {
    mode: AuthMode,
    identities: Arc<dyn IdentityDirectory>,
}

impl Authenticator {
    /// Build from configuration
    ///
    /// When signatures are required the allow-list is not consulted.
    pub fn from_config(config: &AgentConfig, identities: Arc<dyn IdentityDirectory>) -> AgentResult<Self> {
        let mode = if config.disable_authentication {
            warn!("AUTHENTICATION IS DISABLED: any keeper that reaches this agent can write files and run commands");
            AuthMode::Disabled
        } else if let Some(signed) = &config.signed_connections {
            if !config.whitelisted_addresses.is_empty() {
                warn!("Signed connections enabled, address allow-list ignored");
            }
            AuthMode::Signature {
                account: signed.account.clone(),
            }
        } else {
            let whitelist = config.whitelist()?;
            if whitelist.is_empty() {
                return Err(AgentError::Config(
                    "no authentication mode configured".into(),
                ));
            }
            AuthMode::Address {
                whitelist,
                relays: config.trusted_relays()?,
            }
        };

        Ok(Self { mode, identities })
    }

    /// Issue a fresh challenge for one connection
    pub fn challenge(&self) -> Challenge {
        Challenge {
            nonce: challenge_nonce(),
            signature_required: matches!(self.mode, AuthMode::Signature { .. }),
        }
    }

    /// Check the keeper's response against the challenge
    pub async fn verify(
        &self,
        challenge: &Challenge,
        credentials: &Credentials,
        observed: IpAddr,
    ) -> AgentResult<()> {
        match &self.mode {
            AuthMode::Disabled => {
                warn!(peer = %observed, "Accepting keeper without authentication");
                Ok(())
            }
            AuthMode::Address { whitelist, relays } => {
                let address = match credentials.address.as_deref() {
                    Some(claimed) if relays.contains(&observed) => {
                        claimed.trim().parse::<IpAddr>().map_err(|_| {
                            AgentError::UnauthorizedAddress(format!("unparseable address {claimed:?}"))
                        })?
                    }
                    Some(claimed) => {
                        debug!(peer = %observed, claimed = %claimed, "Ignoring address supplied by an untrusted peer");
                        observed
                    }
                    None => observed,
                };
                if whitelist.contains(&address) {
                    debug!(peer = %observed, address = %address, "Address authorized");
                    Ok(())
                } else {
                    Err(AgentError::UnauthorizedAddress(address.to_string()))
                }
            }
            AuthMode::Signature { account } => {
                let presented = credentials.account.as_deref().unwrap_or(account);
                if presented != account {
                    return Err(AgentError::SignatureVerification(format!(
                        "unexpected account {presented:?}"
                    )));
                }
                let signature = credentials.signature.as_deref().ok_or_else(|| {
                    AgentError::SignatureVerification("no signature presented".into())
                })?;
                let identity = self.identities.lookup(account).await.ok_or_else(|| {
                    AgentError::SignatureVerification(format!("unknown account {account:?}"))
                })?;
                verify_challenge(&identity.verifying_key, &challenge.nonce, signature).map_err(
                    |_| AgentError::SignatureVerification(format!("bad signature for {account:?}")),
                )?;
                debug!(account = %account, "Signature verified");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
