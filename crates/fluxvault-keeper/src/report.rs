//! What a polling cycle did
//!
//! One [`AgentReport`] per session: the primary or standalone agent at each
//! address, plus one for every sub-agent reached through it. A failed agent
//! never fails the cycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fluxvault_core::{AgentStatus, SessionErrorKind};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::KeeperError;

/// How one managed file fared
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Content sent
    Delivered { bytes: u64 },
    /// Agent copy already matched
    Unchanged,
    /// In the manifest but absent from the vault
    Missing,
    /// Transfer abandoned
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub name: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

/// How one plugin command or install fared
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Succeeded { output: Value },
    Failed { kind: SessionErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandReport {
    pub command: String,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
}

/// How the session as a whole ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Failed { kind: SessionErrorKind, message: String },
}

impl SessionOutcome {
    pub fn from_error(error: &KeeperError) -> Self {
        Self::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// One session with one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    /// Address the keeper connected to
    pub address: String,
    /// Sub-agent reached through `address`, if proxied
    pub component: Option<String>,
    pub outcome: SessionOutcome,
    pub files: Vec<FileReport>,
    pub commands: Vec<CommandReport>,
    pub status: Option<AgentStatus>,
    /// A certificate was issued to the agent during this session
    pub enrolled: bool,
}

impl AgentReport {
    pub fn new(address: impl Into<String>, component: Option<String>) -> Self {
        Self {
            address: address.into(),
            component,
            outcome: SessionOutcome::Completed,
            files: Vec::new(),
            commands: Vec::new(),
            status: None,
            enrolled: false,
        }
    }

    /// Report for a session that could not run at all
    pub fn failed(address: impl Into<String>, component: Option<String>, error: &KeeperError) -> Self {
        let mut report = Self::new(address, component);
        report.outcome = SessionOutcome::from_error(error);
        report
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == SessionOutcome::Completed
    }

    /// Bytes of file content sent
    pub fn bytes_delivered(&self) -> u64 {
        self.files
            .iter()
            .map(|f| match f.outcome {
                FileOutcome::Delivered { bytes } => bytes,
                _ => 0,
            })
            .sum()
    }

    pub fn file(&self, name: &str) -> Option<&FileOutcome> {
        self.files.iter().find(|f| f.name == name).map(|f| &f.outcome)
    }

    /// Label used in logs, `address` or `address/component`
    pub fn target(&self) -> String {
        match &self.component {
            Some(component) => format!("{}/{component}", self.address),
            None => self.address.clone(),
        }
    }
}

/// Outcome of one polling cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub agents: Vec<AgentReport>,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.agents.iter().filter(|a| a.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.agents.len() - self.succeeded()
    }

    pub fn agent(&self, address: &str, component: Option<&str>) -> Option<&AgentReport> {
        self.agents
            .iter()
            .find(|a| a.address == address && a.component.as_deref() == component)
    }

    /// Log one line per agent and a summary
    pub fn log(&self) {
        for agent in &self.agents {
            match &agent.outcome {
                SessionOutcome::Completed => info!(
                    target_agent = %agent.target(),
                    files = agent.files.len(),
                    bytes = agent.bytes_delivered(),
                    commands = agent.commands.len(),
                    enrolled = agent.enrolled,
                    "Agent updated"
                ),
                SessionOutcome::Failed { kind, message } => warn!(
                    target_agent = %agent.target(),
                    kind = %kind,
                    error = %message,
                    "Agent session failed"
                ),
            }
        }
        info!(
            agents = self.agents.len(),
            succeeded = self.succeeded(),
            failed = self.failed(),
            duration_ms = self.duration.as_millis() as u64,
            "Polling cycle complete"
        );
    }
}
