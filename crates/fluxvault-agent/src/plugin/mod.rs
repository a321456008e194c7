//! Plugin host
//!
//! Keepers extend an agent at runtime by shipping a [`PluginBundle`]. The host
//! validates it, installs its files under the plugins directory, runs its
//! setup command, and registers its commands in a dispatch table shared by
//! every session. Command tags are unique across plugins and may not shadow a
//! built-in.
//!
//! Installed plugins are recorded next to their directory and re-registered
//! by [`PluginHost::restore`] when the agent restarts.

pub mod capability;
pub mod process;
pub mod storage;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fluxvault_core::message::{is_builtin_command, BUILTIN_COMMANDS};
use fluxvault_core::{ensure_contained, CommandInfo, PluginBundle, PluginCommandSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

pub use capability::{Capability, Invocation, SessionContext};
pub use process::ProcessCapability;
pub use storage::PluginStorage;

use crate::error::{AgentError, AgentResult};

/// Time allowed for a plugin's setup command
const SETUP_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_NAME_LEN: usize = 64;

/// Suffix of the per-load directories a bundle is unpacked into
const STAGING_SUFFIX: &str = ".staging";

/// What is persisted about an installed plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstalledPlugin {
    name: String,
    description: String,
    entrypoint: String,
    commands: Vec<PluginCommandSpec>,
}

#[derive(Clone)]
struct RegisteredCommand {
    plugin: String,
    spec: PluginCommandSpec,
    capability: Arc<dyn Capability>,
}

/// Installs plugins and dispatches their commands
pub struct PluginHost {
    plugins_dir: PathBuf,
    command_timeout: Duration,
    commands: RwLock<HashMap<String, RegisteredCommand>>,
    storages: DashMap<String, Arc<PluginStorage>>,
    /// Held while a staged plugin replaces the installed one
    swap: Mutex<()>,
}

impl PluginHost {
    pub fn new(plugins_dir: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            command_timeout,
            commands: RwLock::new(HashMap::new()),
            storages: DashMap::new(),
            swap: Mutex::new(()),
        }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    fn plugin_dir(&self, name: &str) -> PathBuf {
        self.plugins_dir.join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.plugins_dir.join(format!("{name}.plugin.json"))
    }

    fn storage_path(&self, name: &str) -> PathBuf {
        self.plugins_dir.join(format!("{name}.storage.json"))
    }

    /// Install a bundle and register its commands
    #[instrument(skip_all, fields(plugin = %bundle.name))]
    pub async fn load(&self, bundle: PluginBundle) -> AgentResult<Vec<String>> {
        validate_bundle(&bundle)?;
        self.check_collisions(&bundle.name, &bundle.commands).await?;

        tokio::fs::create_dir_all(&self.plugins_dir).await.map_err(load_error)?;
        // Removed on drop unless renamed into place
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", bundle.name))
            .suffix(STAGING_SUFFIX)
            .tempdir_in(&self.plugins_dir)
            .map_err(load_error)?;
        self.install(&bundle, staging.path()).await?;

        let target = self.plugin_dir(&bundle.name);
        let swap = self.swap.lock().await;
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&target).await.map_err(load_error)?;
        }
        tokio::fs::rename(staging.path(), &target).await.map_err(load_error)?;

        let record = InstalledPlugin {
            name: bundle.name.clone(),
            description: bundle.description.clone(),
            entrypoint: bundle.entrypoint.clone(),
            commands: bundle.commands.clone(),
        };
        let encoded = serde_json::to_vec_pretty(&record)
            .map_err(|e| AgentError::PluginLoad(format!("failed to encode record: {e}")))?;
        tokio::fs::write(self.record_path(&bundle.name), encoded)
            .await
            .map_err(load_error)?;

        let capability = ProcessCapability::new(target, &bundle.entrypoint, self.command_timeout);
        let tags = self
            .register(&bundle.name, bundle.commands, Arc::new(capability))
            .await?;
        drop(swap);
        info!(commands = ?tags, "Plugin loaded");
        Ok(tags)
    }

    async fn install(&self, bundle: &PluginBundle, staging: &Path) -> AgentResult<()> {
        for file in &bundle.files {
            let path = staging.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(load_error)?;
            }
            tokio::fs::write(&path, &file.contents).await.map_err(load_error)?;
            if file.executable || file.path == bundle.entrypoint {
                make_executable(&path).await?;
            }
        }
        debug!(files = bundle.files.len(), "Plugin files written");

        if let Some(setup) = &bundle.setup {
            run_setup(setup, &bundle.dependencies, staging).await?;
        }
        Ok(())
    }

    async fn check_collisions(&self, plugin: &str, commands: &[PluginCommandSpec]) -> AgentResult<()> {
        let table = self.commands.read().await;
        for spec in commands {
            if let Some(existing) = table.get(&spec.tag) {
                if existing.plugin != plugin {
                    return Err(AgentError::PluginLoad(format!(
                        "command {:?} already provided by plugin {:?}",
                        spec.tag, existing.plugin
                    )));
                }
            }
        }
        Ok(())
    }

    /// Register commands served by an in-process capability
    ///
    /// Replaces every command previously registered by `plugin`.
    pub async fn register(
        &self,
        plugin: &str,
        commands: Vec<PluginCommandSpec>,
        capability: Arc<dyn Capability>,
    ) -> AgentResult<Vec<String>> {
        validate_commands(&commands)?;
        let mut table = self.commands.write().await;
        for spec in &commands {
            if let Some(existing) = table.get(&spec.tag) {
                if existing.plugin != plugin {
                    return Err(AgentError::PluginLoad(format!(
                        "command {:?} already provided by plugin {:?}",
                        spec.tag, existing.plugin
                    )));
                }
            }
        }

        table.retain(|_, registered| registered.plugin != plugin);
        let mut tags = Vec::with_capacity(commands.len());
        for spec in commands {
            tags.push(spec.tag.clone());
            table.insert(
                spec.tag.clone(),
                RegisteredCommand {
                    plugin: plugin.to_string(),
                    spec,
                    capability: Arc::clone(&capability),
                },
            );
        }
        Ok(tags)
    }

    /// Re-register plugins installed by earlier runs
    pub async fn restore(&self) -> AgentResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.plugins_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut restored = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".plugin.json"));
            if !is_record {
                continue;
            }
            match self.restore_one(&path).await {
                Ok(name) => {
                    debug!(plugin = %name, "Plugin restored");
                    restored += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping installed plugin"),
            }
        }
        if restored > 0 {
            info!(count = restored, "Restored installed plugins");
        }
        Ok(restored)
    }

    async fn restore_one(&self, record_path: &Path) -> AgentResult<String> {
        let bytes = tokio::fs::read(record_path).await?;
        let record: InstalledPlugin = serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::PluginLoad(format!("corrupt plugin record: {e}")))?;
        validate_name(&record.name)?;
        let dir = self.plugin_dir(&record.name);
        if !tokio::fs::try_exists(dir.join(&record.entrypoint)).await.unwrap_or(false) {
            return Err(AgentError::PluginLoad(format!(
                "entrypoint missing for {:?}",
                record.name
            )));
        }
        let capability = ProcessCapability::new(dir, &record.entrypoint, self.command_timeout);
        self.register(&record.name, record.commands, Arc::new(capability))
            .await?;
        Ok(record.name)
    }

    async fn storage(&self, plugin: &str) -> AgentResult<Arc<PluginStorage>> {
        if let Some(storage) = self.storages.get(plugin) {
            return Ok(Arc::clone(&storage));
        }
        let opened = Arc::new(PluginStorage::open(self.storage_path(plugin)).await?);
        Ok(Arc::clone(
            &self.storages.entry(plugin.to_string()).or_insert(opened),
        ))
    }

    /// Run a registered command
    ///
    /// Fails without running anything when a context key the command needs is
    /// missing.
    #[instrument(skip(self, args, context))]
    pub async fn invoke(&self, command: &str, args: Value, context: &SessionContext) -> AgentResult<Value> {
        let registered = self
            .commands
            .read()
            .await
            .get(command)
            .cloned()
            .ok_or_else(|| AgentError::InvalidRequest(format!("unknown command {command:?}")))?;

        let missing: Vec<&str> = registered
            .spec
            .required_context
            .iter()
            .filter(|key| !context.contains(key))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(AgentError::InvalidRequest(format!(
                "missing context for {command:?}: {}",
                missing.join(", ")
            )));
        }

        let storage = self.storage(&registered.plugin).await?;
        registered
            .capability
            .invoke(Invocation {
                command,
                args,
                context,
                storage: &storage,
            })
            .await
    }

    /// Registered plugin command tags, sorted
    pub async fn command_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.commands.read().await.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Built-in and plugin commands with descriptions
    pub async fn list_commands(&self) -> Vec<CommandInfo> {
        let mut commands: Vec<CommandInfo> = BUILTIN_COMMANDS
            .iter()
            .map(|(tag, description)| CommandInfo {
                tag: tag.to_string(),
                description: description.to_string(),
                plugin: None,
            })
            .collect();

        let table = self.commands.read().await;
        let mut plugin_commands: Vec<CommandInfo> = table
            .values()
            .map(|registered| CommandInfo {
                tag: registered.spec.tag.clone(),
                description: registered.spec.description.clone(),
                plugin: Some(registered.plugin.clone()),
            })
            .collect();
        plugin_commands.sort_by(|a, b| a.tag.cmp(&b.tag));
        commands.extend(plugin_commands);
        commands
    }
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins_dir", &self.plugins_dir)
            .finish_non_exhaustive()
    }
}

fn load_error(e: std::io::Error) -> AgentError {
    AgentError::PluginLoad(e.to_string())
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_NAME_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn validate_name(name: &str) -> AgentResult<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(AgentError::PluginLoad(format!("invalid plugin name {name:?}")))
    }
}

fn validate_commands(commands: &[PluginCommandSpec]) -> AgentResult<()> {
    if commands.is_empty() {
        return Err(AgentError::PluginLoad("plugin declares no commands".into()));
    }
    let mut seen = HashSet::new();
    for spec in commands {
        if !is_identifier(&spec.tag) {
            return Err(AgentError::PluginLoad(format!("invalid command tag {:?}", spec.tag)));
        }
        if is_builtin_command(&spec.tag) {
            return Err(AgentError::PluginLoad(format!(
                "command {:?} shadows a built-in",
                spec.tag
            )));
        }
        if !seen.insert(spec.tag.as_str()) {
            return Err(AgentError::PluginLoad(format!("duplicate command {:?}", spec.tag)));
        }
    }
    Ok(())
}

/// Check a bundle before anything touches the disk
pub fn validate_bundle(bundle: &PluginBundle) -> AgentResult<()> {
    validate_name(&bundle.name)?;
    validate_commands(&bundle.commands)?;

    let mut paths = HashSet::new();
    for file in &bundle.files {
        ensure_contained(Path::new(&file.path))
            .map_err(|e| AgentError::PluginLoad(e.to_string()))?;
        if !paths.insert(file.path.as_str()) {
            return Err(AgentError::PluginLoad(format!("duplicate file {:?}", file.path)));
        }
    }
    if !paths.contains(bundle.entrypoint.as_str()) {
        return Err(AgentError::PluginLoad(format!(
            "entrypoint {:?} is not among the bundle's files",
            bundle.entrypoint
        )));
    }

    match &bundle.setup {
        Some(setup) if setup.is_empty() => {
            Err(AgentError::PluginLoad("setup command is empty".into()))
        }
        None if !bundle.dependencies.is_empty() => Err(AgentError::PluginLoad(
            "dependencies declared without a setup command".into(),
        )),
        _ => Ok(()),
    }
}

async fn make_executable(path: &Path) -> AgentResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(load_error)?;
    }
    let _ = path;
    Ok(())
}

async fn run_setup(setup: &[String], dependencies: &[String], dir: &Path) -> AgentResult<()> {
    let Some((program, args)) = setup.split_first() else {
        return Err(AgentError::PluginLoad("setup command is empty".into()));
    };
    info!(program = %program, dependencies = dependencies.len(), "Running plugin setup");

    let output = Command::new(program)
        .args(args)
        .args(dependencies)
        .current_dir(dir)
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(SETUP_TIMEOUT, output)
        .await
        .map_err(|_| AgentError::PluginLoad(format!("setup timed out after {SETUP_TIMEOUT:?}")))?
        .map_err(|e| AgentError::PluginLoad(format!("failed to run setup {program:?}: {e}")))?;

    if !output.status.success() {
        return Err(AgentError::PluginLoad(format!(
            "setup exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
