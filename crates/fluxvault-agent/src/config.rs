//! Configuration for an agent

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fluxvault_core::{
    AgentRole, Identity, StaticIdentityDirectory, DEFAULT_AGENT_PORT, DEFAULT_REGISTRAR_PORT,
};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

/// Require every keeper to sign the challenge as `account`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedConnections {
    pub account: String,
}

/// A static account -> public key entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub account: String,
    /// Base64 Ed25519 public key
    pub public_key: String,
}

/// Enables the primary role: sub-agents register here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrarConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_registrar_port")]
    pub bind_port: u16,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_registrar_port(),
        }
    }
}

/// Enables the sub-agent role: register with a primary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryAgentConfig {
    /// Host of the primary's registrar
    pub address: String,
    #[serde(default = "default_registrar_port")]
    pub port: u16,
    /// Name the keeper proxies to; also the TLS server name once enrolled
    pub component_name: String,
    /// `host:port` the primary should dial to reach this agent
    pub advertise_address: String,
}

impl PrimaryAgentConfig {
    pub fn registrar_address(&self) -> String {
        join_host_port(&self.address, self.port)
    }
}

/// Configuration for an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_agent_port")]
    pub bind_port: u16,
    /// Root for relative remote paths
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Source addresses allowed when signatures are not required
    #[serde(default)]
    pub whitelisted_addresses: Vec<String>,
    /// Peers allowed to supply the keeper's address on its behalf; the
    /// primary is implicitly trusted when given as an IP address
    #[serde(default)]
    pub trusted_relays: Vec<String>,
    #[serde(default)]
    pub signed_connections: Option<SignedConnections>,
    /// Accept every keeper without authentication
    #[serde(default)]
    pub disable_authentication: bool,
    #[serde(default)]
    pub identities: Vec<IdentityEntry>,
    #[serde(default)]
    pub registrar: Option<RegistrarConfig>,
    #[serde(default)]
    pub primary: Option<PrimaryAgentConfig>,
    /// Allow the `exec` command
    #[serde(default)]
    pub allow_exec: bool,
    /// Plugin installs and storage; defaults to `<working_dir>/.fluxvault/plugins`
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,
    #[serde(default = "default_plugin_command_timeout")]
    pub plugin_command_timeout_secs: u64,
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout_secs: u64,
    /// Pause before closing a rejected connection
    #[serde(default = "default_rejection_delay")]
    pub rejection_delay_ms: u64,
}

fn parse_addresses(addresses: &[String], what: &str) -> AgentResult<Vec<IpAddr>> {
    addresses
        .iter()
        .map(|a| {
            a.trim()
                .parse::<IpAddr>()
                .map_err(|_| AgentError::Config(format!("invalid {what}: {a:?}")))
        })
        .collect()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_registrar_port() -> u16 {
    DEFAULT_REGISTRAR_PORT
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_plugin_command_timeout() -> u64 {
    60
}

fn default_session_idle_timeout() -> u64 {
    120
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_rejection_delay() -> u64 {
    3000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_agent_port(),
            working_dir: default_working_dir(),
            whitelisted_addresses: Vec::new(),
            trusted_relays: Vec::new(),
            signed_connections: None,
            disable_authentication: false,
            identities: Vec::new(),
            registrar: None,
            primary: None,
            allow_exec: false,
            plugins_dir: None,
            plugin_command_timeout_secs: default_plugin_command_timeout(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            upstream_connect_timeout_secs: default_upstream_connect_timeout(),
            rejection_delay_ms: default_rejection_delay(),
        }
    }
}

impl AgentConfig {
    /// Create a configuration with a custom working directory
    pub fn with_working_dir(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    /// Load and validate a TOML file
    pub fn from_file(path: &Path) -> AgentResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the listen address
    pub fn with_bind(mut self, address: impl Into<String>, port: u16) -> Self {
        self.bind_address = address.into();
        self.bind_port = port;
        self
    }

    /// Set the address allow-list
    pub fn with_whitelist(mut self, addresses: Vec<String>) -> Self {
        self.whitelisted_addresses = addresses;
        self
    }

    /// Set the relays whose supplied keeper address is believed
    pub fn with_trusted_relays(mut self, addresses: Vec<String>) -> Self {
        self.trusted_relays = addresses;
        self
    }

    /// Require signatures from `account`
    pub fn with_signed_connections(mut self, account: impl Into<String>) -> Self {
        self.signed_connections = Some(SignedConnections {
            account: account.into(),
        });
        self
    }

    /// Add a static identity
    pub fn with_identity(mut self, account: impl Into<String>, public_key: impl Into<String>) -> Self {
        self.identities.push(IdentityEntry {
            account: account.into(),
            public_key: public_key.into(),
        });
        self
    }

    /// Run a registrar, making this a primary agent
    pub fn with_registrar(mut self, registrar: RegistrarConfig) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Register with a primary, making this a sub-agent
    pub fn with_primary(mut self, primary: PrimaryAgentConfig) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn with_allow_exec(mut self, allow: bool) -> Self {
        self.allow_exec = allow;
        self
    }

    pub fn with_rejection_delay(mut self, delay: Duration) -> Self {
        self.rejection_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Turn authentication off entirely
    pub fn with_authentication_disabled(mut self) -> Self {
        self.disable_authentication = true;
        self
    }

    /// Role implied by the registrar / primary sections
    pub fn role(&self) -> AgentRole {
        if self.registrar.is_some() {
            AgentRole::Primary
        } else if self.primary.is_some() {
            AgentRole::SubAgent
        } else {
            AgentRole::Standalone
        }
    }

    /// Component name a sub-agent registers under
    pub fn component_name(&self) -> Option<&str> {
        self.primary.as_ref().map(|p| p.component_name.as_str())
    }

    pub fn listen_address(&self) -> String {
        join_host_port(&self.bind_address, self.bind_port)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.plugins_dir
            .clone()
            .unwrap_or_else(|| self.working_dir.join(".fluxvault").join("plugins"))
    }

    pub fn plugin_command_timeout(&self) -> Duration {
        Duration::from_secs(self.plugin_command_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_secs)
    }

    pub fn rejection_delay(&self) -> Duration {
        Duration::from_millis(self.rejection_delay_ms)
    }

    /// Parsed allow-list
    pub fn whitelist(&self) -> AgentResult<Vec<IpAddr>> {
        parse_addresses(&self.whitelisted_addresses, "whitelisted address")
    }

    /// Parsed relay list, including the primary when its host is an IP address
    pub fn trusted_relays(&self) -> AgentResult<Vec<IpAddr>> {
        let mut relays = parse_addresses(&self.trusted_relays, "trusted relay")?;
        if let Some(primary) = &self.primary {
            if let Ok(ip) = primary.address.trim().parse::<IpAddr>() {
                relays.push(ip);
            }
        }
        Ok(relays)
    }

    /// Build the identity directory from the static table
    pub fn identity_directory(&self) -> AgentResult<StaticIdentityDirectory> {
        let mut directory = StaticIdentityDirectory::new();
        for entry in &self.identities {
            let identity = Identity::from_base64(&entry.account, &entry.public_key).ok_or_else(|| {
                AgentError::Config(format!("invalid public key for account {:?}", entry.account))
            })?;
            directory.insert(identity);
        }
        Ok(directory)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> AgentResult<()> {
        if self.bind_address.parse::<IpAddr>().is_err() {
            return Err(AgentError::Config(format!(
                "invalid bind address: {:?}",
                self.bind_address
            )));
        }
        if self.working_dir.as_os_str().is_empty() {
            return Err(AgentError::Config("working_dir must not be empty".into()));
        }
        let whitelist = self.whitelist()?;
        self.trusted_relays()?;
        self.identity_directory()?;

        if !self.disable_authentication {
            match &self.signed_connections {
                Some(signed) if signed.account.trim().is_empty() => {
                    return Err(AgentError::Config(
                        "signed_connections.account must not be empty".into(),
                    ));
                }
                Some(_) => {}
                None if whitelist.is_empty() => {
                    return Err(AgentError::Config(
                        "whitelisted_addresses required when authenticating without signatures"
                            .into(),
                    ));
                }
                None => {}
            }
        }

        if self.registrar.is_some() && self.primary.is_some() {
            return Err(AgentError::Config(
                "an agent cannot be both a primary and a sub-agent".into(),
            ));
        }
        if let Some(registrar) = &self.registrar {
            if registrar.bind_address.parse::<IpAddr>().is_err() {
                return Err(AgentError::Config(format!(
                    "invalid registrar bind address: {:?}",
                    registrar.bind_address
                )));
            }
        }
        if let Some(primary) = &self.primary {
            if primary.component_name.trim().is_empty() {
                return Err(AgentError::Config("primary.component_name must not be empty".into()));
            }
            if !is_host_port(&primary.advertise_address) {
                return Err(AgentError::Config(format!(
                    "primary.advertise_address must be host:port, got {:?}",
                    primary.advertise_address
                )));
            }
        }
        if self.session_idle_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(AgentError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Format `host:port`, bracketing IPv6 literals
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

/// Whether `address` looks like `host:port`
pub(crate) fn is_host_port(address: &str) -> bool {
    if address.parse::<SocketAddr>().is_ok() {
        return true;
    }
    match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_requires_auth_mode() {
        let config = AgentConfig::default();
        assert!(config.validate().is_err());

        let config = AgentConfig::default().with_whitelist(vec!["10.0.0.5".into()]);
        assert!(config.validate().is_ok());
        assert_eq!(config.role(), AgentRole::Standalone);
    }

    #[test]
    fn test_disabled_auth_needs_no_whitelist() {
        let config = AgentConfig::default().with_authentication_disabled();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_whitelist_entry() {
        let config = AgentConfig::default().with_whitelist(vec!["not-an-ip".into()]);
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let config = AgentConfig::default()
            .with_whitelist(vec!["10.0.0.5".into()])
            .with_trusted_relays(vec!["relay.local".into()]);
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_primary_and_sub_agent_exclusive() {
        let config = AgentConfig::default()
            .with_authentication_disabled()
            .with_registrar(RegistrarConfig::default())
            .with_primary(PrimaryAgentConfig {
                address: "10.0.0.1".into(),
                port: 8889,
                component_name: "componentb".into(),
                advertise_address: "10.0.0.2:8888".into(),
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config: AgentConfig = toml::from_str(
            r#"
            working_dir = "/srv/app"
            whitelisted_addresses = ["10.0.0.5"]
            trusted_relays = ["10.0.0.3"]

            [primary]
            address = "10.0.0.1"
            component_name = "componentb"
            advertise_address = "10.0.0.7:8888"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.bind_port, 8888);
        assert_eq!(config.role(), AgentRole::SubAgent);
        assert_eq!(config.component_name(), Some("componentb"));
        assert_eq!(
            config.primary.as_ref().unwrap().registrar_address(),
            "10.0.0.1:8889"
        );
        assert_eq!(config.plugins_dir(), PathBuf::from("/srv/app/.fluxvault/plugins"));
        let relays: Vec<String> = config
            .trusted_relays()
            .unwrap()
            .iter()
            .map(|ip| ip.to_string())
            .collect();
        assert_eq!(relays, ["10.0.0.3", "10.0.0.1"]);
    }

    #[test]
    fn test_host_port_helpers() {
        assert!(is_host_port("10.0.0.2:8888"));
        assert!(is_host_port("[::1]:8888"));
        assert!(is_host_port("agent.local:8888"));
        assert!(!is_host_port("agent.local"));
        assert!(!is_host_port(":8888"));
        assert_eq!(join_host_port("::1", 8888), "[::1]:8888");
    }
}
