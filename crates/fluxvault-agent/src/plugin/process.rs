//! Plugin commands backed by an installed program
//!
//! The entrypoint runs once per invocation with the command tag as its only
//! argument and a JSON request on stdin:
//!
//! ```text
//! {"command": "...", "args": ..., "context": {...}, "storage": {...}}
//! ```
//!
//! It answers on stdout. `{"result": ..., "storage": {...}}` returns `result`
//! and replaces the plugin's storage; any other JSON is returned as is, and
//! non-JSON output is returned as a string. A non-zero exit fails the command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::plugin::capability::{Capability, Invocation};

/// Runs a plugin's entrypoint for each command
#[derive(Debug, Clone)]
pub struct ProcessCapability {
    plugin_dir: PathBuf,
    entrypoint: PathBuf,
    timeout: Duration,
}

impl ProcessCapability {
    pub fn new(plugin_dir: PathBuf, entrypoint: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            plugin_dir,
            entrypoint: entrypoint.into(),
            timeout,
        }
    }

    async fn run(&self, command: &str, request: Vec<u8>) -> AgentResult<std::process::Output> {
        let program = self.plugin_dir.join(&self.entrypoint);
        let mut child = Command::new(&program)
            .arg(command)
            .current_dir(&self.plugin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::CommandFailed(format!("failed to start {}: {e}", program.display()))
            })?;

        // Feeding stdin shares the time limit with the wait
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&request).await {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(command, "Plugin did not read its request");
                    Ok(())
                }
                written => written,
            }
        };
        let exchange = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.and(output)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                AgentError::CommandFailed(format!("{command} timed out after {:?}", self.timeout))
            })?
            .map_err(AgentError::from)
    }
}

#[async_trait]
impl Capability for ProcessCapability {
    async fn invoke(&self, invocation: Invocation<'_>) -> AgentResult<Value> {
        let request = json!({
            "command": invocation.command,
            "args": invocation.args,
            "context": invocation.context.to_value(),
            "storage": invocation.storage.snapshot().await,
        });
        let request = serde_json::to_vec(&request)
            .map_err(|e| AgentError::CommandFailed(format!("failed to encode request: {e}")))?;

        let output = self.run(invocation.command, request).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(command = invocation.command, status = ?output.status.code(), "Plugin command failed");
            return Err(AgentError::CommandFailed(format!(
                "{} exited with {}: {}",
                invocation.command,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Ok(parsed) = serde_json::from_str::<Value>(stdout.trim()) else {
            return Ok(Value::String(stdout.trim_end().to_string()));
        };

        match parsed {
            Value::Object(mut object) if object.contains_key("result") => {
                if let Some(Value::Object(storage)) = object.remove("storage") {
                    let storage: BTreeMap<String, Value> = storage.into_iter().collect();
                    invocation.storage.replace(storage).await?;
                }
                Ok(object.remove("result").unwrap_or(Value::Null))
            }
            other => Ok(other),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plugin::capability::SessionContext;
    use crate::plugin::storage::PluginStorage;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn install_script(dir: &TempDir, body: &str) {
        let path = dir.path().join("run.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_structured_output_updates_storage() {
        let dir = TempDir::new().unwrap();
        install_script(
            &dir,
            r#"cat > /dev/null; echo "{\"result\": \"rotated $1\", \"storage\": {\"count\": 1}}""#,
        );
        let capability = ProcessCapability::new(dir.path().to_path_buf(), "run.sh", Duration::from_secs(10));
        let storage = PluginStorage::open(dir.path().join("storage.json")).await.unwrap();
        let context = SessionContext::new();

        let output = capability
            .invoke(Invocation {
                command: "rotate",
                args: Value::Null,
                context: &context,
                storage: &storage,
            })
            .await
            .unwrap();

        assert_eq!(output, json!("rotated rotate"));
        assert_eq!(storage.get("count").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_request_carries_context() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, "cat");
        let capability = ProcessCapability::new(dir.path().to_path_buf(), "run.sh", Duration::from_secs(10));
        let storage = PluginStorage::open(dir.path().join("storage.json")).await.unwrap();
        let mut context = SessionContext::new();
        context.merge(BTreeMap::from([("region".to_string(), json!("eu"))]));

        let echoed = capability
            .invoke(Invocation {
                command: "echo",
                args: json!({"n": 1}),
                context: &context,
                storage: &storage,
            })
            .await
            .unwrap();

        assert_eq!(echoed["context"]["region"], "eu");
        assert_eq!(echoed["args"]["n"], 1);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, "echo boom >&2; exit 3");
        let capability = ProcessCapability::new(dir.path().to_path_buf(), "run.sh", Duration::from_secs(10));
        let storage = PluginStorage::open(dir.path().join("storage.json")).await.unwrap();

        let err = capability
            .invoke(Invocation {
                command: "fail",
                args: Value::Null,
                context: &SessionContext::new(),
                storage: &storage,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CommandFailed(ref m) if m.contains("boom")));
    }

    #[tokio::test]
    async fn test_unread_large_request_times_out() {
        let dir = TempDir::new().unwrap();
        install_script(&dir, "sleep 30");
        let capability = ProcessCapability::new(dir.path().to_path_buf(), "run.sh", Duration::from_secs(1));
        let storage = PluginStorage::open(dir.path().join("storage.json")).await.unwrap();
        let mut context = SessionContext::new();
        // Well past any pipe buffer
        context.merge(BTreeMap::from([("blob".to_string(), json!("x".repeat(1 << 20)))]));

        let started = std::time::Instant::now();
        let err = capability
            .invoke(Invocation {
                command: "stall",
                args: Value::Null,
                context: &context,
                storage: &storage,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CommandFailed(ref m) if m.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
