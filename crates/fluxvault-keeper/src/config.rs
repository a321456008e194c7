//! Configuration for a keeper

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fluxvault_core::{
    DEFAULT_AGENT_PORT, ManagedFileSpec, PluginBundle, PluginCommandSpec, PluginFile,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KeeperError, KeeperResult};

/// A plugin shipped to every agent from a local directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSource {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Directory whose files make up the plugin
    pub dir: PathBuf,
    /// Program run for every command, relative to `dir`
    pub entrypoint: String,
    pub commands: Vec<PluginCommandSpec>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub setup: Option<Vec<String>>,
}

impl PluginSource {
    /// Read the plugin directory into a bundle
    pub fn to_bundle(&self) -> KeeperResult<PluginBundle> {
        let mut files = Vec::new();
        collect_files(&self.dir, &self.dir, &mut files)?;
        if files.is_empty() {
            return Err(KeeperError::Config(format!(
                "plugin {:?} has no files in {}",
                self.name,
                self.dir.display()
            )));
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(PluginBundle {
            name: self.name.clone(),
            description: self.description.clone(),
            entrypoint: self.entrypoint.clone(),
            commands: self.commands.clone(),
            files,
            dependencies: self.dependencies.clone(),
            setup: self.setup.clone(),
        })
    }
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PluginFile>) -> KeeperResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, files)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .map_err(|_| KeeperError::Config(format!("{} outside plugin dir", path.display())))?;
            let contents = std::fs::read(&path)?;
            files.push(PluginFile {
                path: relative.to_string_lossy().replace('\\', "/"),
                contents,
                executable: is_executable(&entry.metadata()?),
            });
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// A plugin command run on agents every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInvocation {
    pub command: String,
    #[serde(default)]
    pub args: Value,
    /// Only run on the sub-agent registered under this name
    #[serde(default)]
    pub component: Option<String>,
}

impl CommandInvocation {
    /// Whether this invocation targets the agent serving `component`
    pub fn applies_to(&self, component: Option<&str>) -> bool {
        match &self.component {
            None => true,
            Some(wanted) => component == Some(wanted.as_str()),
        }
    }
}

/// Configuration for a keeper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Application whose agents are polled
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Root of the managed files; must be absolute
    pub vault_dir: PathBuf,
    /// Agents to poll, `host` or `host:port`
    #[serde(default)]
    pub agent_addresses: Vec<String>,
    /// Port used for addresses without one
    #[serde(default = "default_comms_port")]
    pub comms_port: u16,
    /// Files delivered to every agent
    #[serde(default)]
    pub managed_files: Vec<ManagedFileSpec>,
    /// Files delivered only to the named sub-agent
    #[serde(default)]
    pub component_files: BTreeMap<String, Vec<ManagedFileSpec>>,
    /// Sign the agent's challenge as this account
    #[serde(default)]
    pub signing_account: Option<String>,
    /// Where signing keys are stored
    #[serde(default = "default_key_store_dir")]
    pub key_store_dir: PathBuf,
    /// Address claimed in `auth_response`, for keepers behind NAT
    #[serde(default)]
    pub reported_address: Option<String>,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_secs: u64,
    /// Budget for each agent or sub-agent session within a cycle
    #[serde(default = "default_cycle_deadline")]
    pub cycle_deadline_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_parallel_sessions")]
    pub max_parallel_sessions: usize,
    /// Exit after the first cycle
    #[serde(default)]
    pub run_once: bool,
    /// Issue certificates to sub-agents that have none
    #[serde(default = "default_true")]
    pub enroll_sub_agents: bool,
    /// Values set on every session before commands run
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub plugins: Vec<PluginSource>,
    #[serde(default)]
    pub commands: Vec<CommandInvocation>,
}

fn default_app_name() -> String {
    "fluxvault".to_string()
}

fn default_comms_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_key_store_dir() -> PathBuf {
    PathBuf::from(".fluxvault").join("keys")
}

fn default_polling_interval() -> u64 {
    300
}

fn default_cycle_deadline() -> u64 {
    120
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_parallel_sessions() -> usize {
    16
}

fn default_true() -> bool {
    true
}

impl KeeperConfig {
    /// Create a configuration for the vault at `vault_dir`
    pub fn new(vault_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_name: default_app_name(),
            vault_dir: vault_dir.into(),
            agent_addresses: Vec::new(),
            comms_port: default_comms_port(),
            managed_files: Vec::new(),
            component_files: BTreeMap::new(),
            signing_account: None,
            key_store_dir: default_key_store_dir(),
            reported_address: None,
            polling_interval_secs: default_polling_interval(),
            cycle_deadline_secs: default_cycle_deadline(),
            connect_timeout_secs: default_connect_timeout(),
            max_parallel_sessions: default_max_parallel_sessions(),
            run_once: false,
            enroll_sub_agents: true,
            context: BTreeMap::new(),
            plugins: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Load and validate a TOML file
    pub fn from_file(path: &Path) -> KeeperResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KeeperError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| KeeperError::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_agent(mut self, address: impl Into<String>) -> Self {
        self.agent_addresses.push(address.into());
        self
    }

    pub fn with_managed_file(mut self, spec: ManagedFileSpec) -> Self {
        self.managed_files.push(spec);
        self
    }

    /// Deliver `spec` only to the sub-agent `component`
    pub fn with_component_file(mut self, component: impl Into<String>, spec: ManagedFileSpec) -> Self {
        self.component_files.entry(component.into()).or_default().push(spec);
        self
    }

    pub fn with_signing_account(mut self, account: impl Into<String>) -> Self {
        self.signing_account = Some(account.into());
        self
    }

    pub fn with_reported_address(mut self, address: impl Into<String>) -> Self {
        self.reported_address = Some(address.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_plugin(mut self, plugin: PluginSource) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_command(mut self, invocation: CommandInvocation) -> Self {
        self.commands.push(invocation);
        self
    }

    pub fn with_run_once(mut self, run_once: bool) -> Self {
        self.run_once = run_once;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `address` with the comms port added when it has none
    pub fn agent_endpoint(&self, address: &str) -> String {
        let address = address.trim();
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_string();
        }
        if let Ok(ip) = address.parse::<IpAddr>() {
            return SocketAddr::new(ip, self.comms_port).to_string();
        }
        match address.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
            _ => format!("{address}:{}", self.comms_port),
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> KeeperResult<()> {
        if !self.vault_dir.is_absolute() {
            return Err(KeeperError::Config(format!(
                "vault_dir must be absolute, got {}",
                self.vault_dir.display()
            )));
        }
        if self.app_name.trim().is_empty() {
            return Err(KeeperError::Config("app_name must not be empty".into()));
        }
        for spec in self.managed_files.iter().chain(self.component_files.values().flatten()) {
            spec.validate()?;
        }
        if let Some(account) = &self.signing_account {
            if account.trim().is_empty() {
                return Err(KeeperError::Config("signing_account must not be empty".into()));
            }
        }
        if self.max_parallel_sessions == 0 {
            return Err(KeeperError::Config("max_parallel_sessions must be at least 1".into()));
        }
        if self.cycle_deadline_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(KeeperError::Config("timeouts must be non-zero".into()));
        }
        for plugin in &self.plugins {
            if plugin.commands.is_empty() {
                return Err(KeeperError::Config(format!(
                    "plugin {:?} declares no commands",
                    plugin.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxvault_core::ManifestError;
    use tempfile::TempDir;

    #[test]
    fn test_parse_toml() {
        let config: KeeperConfig = toml::from_str(
            r#"
            vault_dir = "/srv/vault"
            agent_addresses = ["10.0.0.1", "10.0.0.2:9000"]
            signing_account = "ops"

            [[managed_files]]
            local_path = "secret.txt"

            [[component_files.componentb]]
            local_path = "db/password"
            remote_path = "/etc/app/password"

            [context]
            region = "eu"

            [[commands]]
            command = "rotate"
            args = { force = true }
            component = "componentb"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.comms_port, 8888);
        assert!(config.enroll_sub_agents);
        assert_eq!(config.agent_endpoint("10.0.0.1"), "10.0.0.1:8888");
        assert_eq!(config.agent_endpoint("10.0.0.2:9000"), "10.0.0.2:9000");
        assert_eq!(config.agent_endpoint("agent.local"), "agent.local:8888");
        assert_eq!(config.context["region"], "eu");
        assert_eq!(config.commands[0].args["force"], true);
        assert!(config.commands[0].applies_to(Some("componentb")));
        assert!(!config.commands[0].applies_to(None));
    }

    #[test]
    fn test_relative_vault_rejected() {
        let config = KeeperConfig::new("vault");
        assert!(matches!(config.validate(), Err(KeeperError::Config(_))));
    }

    #[test]
    fn test_file_name_mismatch_rejected() {
        let config = KeeperConfig::new("/srv/vault")
            .with_managed_file(ManagedFileSpec::new("secret.txt").with_remote_path("/etc/other.txt"));
        assert!(matches!(
            config.validate(),
            Err(KeeperError::Manifest(ManifestError::FileNameMismatch { .. }))
        ));
    }

    #[test]
    fn test_plugin_bundle_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("run.sh"), "#!/bin/sh\necho ok\n").unwrap();
        std::fs::write(dir.path().join("lib/helpers.sh"), "true\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                dir.path().join("run.sh"),
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }

        let source = PluginSource {
            name: "rotator".into(),
            description: String::new(),
            dir: dir.path().to_path_buf(),
            entrypoint: "run.sh".into(),
            commands: vec![PluginCommandSpec {
                tag: "rotate".into(),
                description: String::new(),
                required_context: vec![],
            }],
            dependencies: vec![],
            setup: None,
        };
        let bundle = source.to_bundle().unwrap();

        let paths: Vec<_> = bundle.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["lib/helpers.sh", "run.sh"]);
        #[cfg(unix)]
        assert!(bundle.files[1].executable);
    }
}
