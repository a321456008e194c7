//! Wire vocabulary
//!
//! Two layers travel over a connection:
//!
//! - [`Envelope`] is the cleartext outer frame. It carries the handshake key
//!   material, sealed ciphertext, and a payload-free abort signal.
//! - [`Message`] is the inner, encrypted vocabulary. It is a closed enum, so
//!   every tag a peer can send is known at compile time and handlers match on
//!   it exhaustively.
//!
//! Both serialize adjacently tagged as `{"tag": ..., "payload": ...}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::encoding::{base64_bytes, base64_opt};
use crate::error::SessionErrorKind;

/// Cleartext outer frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    /// Listener's per-connection public key
    PublicKey {
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
    },
    /// Initiator's session key, wrapped under the listener's public key
    WrappedKey {
        #[serde(with = "base64_bytes")]
        wrapped: Vec<u8>,
    },
    /// One encrypted [`Message`]
    Sealed {
        #[serde(with = "base64_bytes")]
        ciphertext: Vec<u8>,
    },
    /// Uniform failure signal, carries no detail
    Abort,
}

impl Envelope {
    /// Tag name for logging
    pub fn tag(&self) -> &'static str {
        match self {
            Self::PublicKey { .. } => "public_key",
            Self::WrappedKey { .. } => "wrapped_key",
            Self::Sealed { .. } => "sealed",
            Self::Abort => "abort",
        }
    }
}

/// Known-plaintext handshake probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePayload {
    pub text: String,
    pub fill: String,
}

/// One file the keeper manages for this agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Name the agent uses in `file_request`
    pub name: String,
    /// Destination, absolute or relative to the agent's working directory
    pub remote_path: String,
}

/// A dispatchable command and its description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub tag: String,
    pub description: String,
    /// Name of the plugin providing the command, `None` for built-ins
    #[serde(default)]
    pub plugin: Option<String>,
}

/// Role an agent plays in a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Reached directly by the keeper, no registrar
    Standalone,
    /// Runs a registrar and proxies to sub-agents
    Primary,
    /// Registered behind a primary
    SubAgent,
}

/// Answer to a `status` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub role: AgentRole,
    /// Component name the agent registers under, if any
    pub component_name: Option<String>,
    /// Whether the agent holds a certificate issued by the keeper
    pub enrolled: bool,
    /// Files written during the current session
    pub files_written: usize,
    /// Plugin command tags currently registered
    pub plugin_commands: Vec<String>,
    pub uptime_secs: u64,
}

/// A registered sub-agent as seen by the keeper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub component_name: String,
    pub address: String,
    pub enrolled: bool,
}

/// A command a plugin promises to handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCommandSpec {
    pub tag: String,
    #[serde(default)]
    pub description: String,
    /// Context keys that must be set before the command can run
    #[serde(default)]
    pub required_context: Vec<String>,
}

/// One file of a plugin bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFile {
    /// Path relative to the plugin's directory
    pub path: String,
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
    #[serde(default)]
    pub executable: bool,
}

/// Extension code shipped by the keeper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginBundle {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Program run for every command, relative to the plugin directory
    pub entrypoint: String,
    pub commands: Vec<PluginCommandSpec>,
    pub files: Vec<PluginFile>,
    /// Dependencies handed to the setup command
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Setup command (program followed by arguments), run once in the plugin
    /// directory with the dependencies appended
    #[serde(default)]
    pub setup: Option<Vec<String>>,
}

/// Encrypted session vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "snake_case")]
pub enum Message {
    // Handshake
    Probe(ProbePayload),
    ProbeReply(ProbePayload),

    // Authentication
    AuthChallenge {
        #[serde(with = "base64_bytes")]
        nonce: Vec<u8>,
        signature_required: bool,
    },
    AuthResponse {
        #[serde(default)]
        account: Option<String>,
        #[serde(default, with = "base64_opt")]
        signature: Option<Vec<u8>>,
        #[serde(default)]
        address: Option<String>,
    },
    AuthAccepted,
    Rejected,

    // Agent requests, keeper responds
    ManifestRequest,
    Manifest {
        files: Vec<FileEntry>,
    },
    FileRequest {
        name: String,
        #[serde(default)]
        fingerprint: Option<String>,
    },
    FileChunkRequest {
        name: String,
        offset: u64,
    },
    FileContent {
        name: String,
        fingerprint: String,
        offset: u64,
        total: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        more: bool,
    },
    FileUnchanged {
        name: String,
    },
    FileNotFound {
        name: String,
    },
    /// Agent is done requesting and hands the floor to the keeper
    Ready,

    // Keeper requests, agent responds
    Status,
    StatusReport(AgentStatus),
    ListCommands,
    Commands {
        commands: Vec<CommandInfo>,
    },
    SetContext {
        values: BTreeMap<String, serde_json::Value>,
    },
    LoadPlugin(PluginBundle),
    PluginLoaded {
        name: String,
        commands: Vec<String>,
    },
    Invoke {
        command: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    InvokeResult {
        command: String,
        output: serde_json::Value,
    },
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    ExecResult {
        status: i32,
        stdout: String,
        stderr: String,
    },
    ListPeers,
    Peers {
        peers: Vec<PeerSummary>,
    },
    ProxyTo {
        component_name: String,
    },
    ProxyReady {
        tls: bool,
    },
    GenerateCsr,
    Csr {
        component_name: String,
        csr_pem: String,
    },
    InstallCertificate {
        certificate_pem: String,
        ca_certificate_pem: String,
    },
    Ack,

    // Either side
    Error {
        kind: SessionErrorKind,
        #[serde(default)]
        message: String,
    },
    Done,
}

impl Message {
    /// Tag name for logging
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Probe(_) => "probe",
            Self::ProbeReply(_) => "probe_reply",
            Self::AuthChallenge { .. } => "auth_challenge",
            Self::AuthResponse { .. } => "auth_response",
            Self::AuthAccepted => "auth_accepted",
            Self::Rejected => "rejected",
            Self::ManifestRequest => "manifest_request",
            Self::Manifest { .. } => "manifest",
            Self::FileRequest { .. } => "file_request",
            Self::FileChunkRequest { .. } => "file_chunk_request",
            Self::FileContent { .. } => "file_content",
            Self::FileUnchanged { .. } => "file_unchanged",
            Self::FileNotFound { .. } => "file_not_found",
            Self::Ready => "ready",
            Self::Status => "status",
            Self::StatusReport(_) => "status_report",
            Self::ListCommands => "list_commands",
            Self::Commands { .. } => "commands",
            Self::SetContext { .. } => "set_context",
            Self::LoadPlugin(_) => "load_plugin",
            Self::PluginLoaded { .. } => "plugin_loaded",
            Self::Invoke { .. } => "invoke",
            Self::InvokeResult { .. } => "invoke_result",
            Self::Exec { .. } => "exec",
            Self::ExecResult { .. } => "exec_result",
            Self::ListPeers => "list_peers",
            Self::Peers { .. } => "peers",
            Self::ProxyTo { .. } => "proxy_to",
            Self::ProxyReady { .. } => "proxy_ready",
            Self::GenerateCsr => "generate_csr",
            Self::Csr { .. } => "csr",
            Self::InstallCertificate { .. } => "install_certificate",
            Self::Ack => "ack",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    /// Build an error reply, dropping the detail for security kinds
    pub fn error(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        let message = if kind.is_disclosable() {
            message.into()
        } else {
            String::new()
        };
        Self::Error { kind, message }
    }
}

/// Tags agents reserve for built-in handlers; plugins may not claim them
pub const BUILTIN_COMMANDS: &[(&str, &str)] = &[
    ("status", "Report agent role, enrollment and registered plugins"),
    ("list_commands", "List every command this agent can dispatch"),
    ("set_context", "Merge key/value state into the session context"),
    ("load_plugin", "Install a plugin and register its commands"),
    ("invoke", "Run a plugin command"),
    ("exec", "Run a program on the agent host (requires allow_exec)"),
    ("list_peers", "List sub-agents registered with this primary"),
    ("proxy_to", "Relay this connection to a registered sub-agent"),
    ("generate_csr", "Create a key pair and certificate signing request"),
    ("install_certificate", "Install a keeper-issued certificate for proxied hops"),
    ("done", "End the session"),
];

/// Whether `tag` names a built-in command
pub fn is_builtin_command(tag: &str) -> bool {
    BUILTIN_COMMANDS.iter().any(|(name, _)| *name == tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::Sealed {
            ciphertext: vec![1, 2, 3],
        };
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["tag"], "sealed");
        assert_eq!(json["payload"]["ciphertext"], "AQID");

        let abort = serde_json::to_string(&Envelope::Abort).unwrap();
        assert_eq!(abort, r#"{"tag":"abort"}"#);
    }

    #[test]
    fn test_message_tag_matches_serialized_tag() {
        let messages = vec![
            Message::FileRequest {
                name: "secret.txt".into(),
                fingerprint: None,
            },
            Message::ProxyTo {
                component_name: "componentB".into(),
            },
            Message::Done,
            Message::StatusReport(AgentStatus {
                role: AgentRole::Primary,
                component_name: None,
                enrolled: false,
                files_written: 0,
                plugin_commands: vec![],
                uptime_secs: 1,
            }),
        ];
        for message in messages {
            let json = serde_json::to_value(&message).unwrap();
            assert_eq!(json["tag"], message.tag());
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let result: Result<Message, _> =
            serde_json::from_str(r#"{"tag":"format_disk","payload":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_optional_auth_fields_default() {
        let message: Message =
            serde_json::from_str(r#"{"tag":"auth_response","payload":{}}"#).unwrap();
        assert_eq!(
            message,
            Message::AuthResponse {
                account: None,
                signature: None,
                address: None
            }
        );
    }

    #[test]
    fn test_error_hides_security_detail() {
        let message = Message::error(SessionErrorKind::SignatureVerification, "bad sig from bob");
        assert_eq!(
            message,
            Message::Error {
                kind: SessionErrorKind::SignatureVerification,
                message: String::new()
            }
        );

        let message = Message::error(SessionErrorKind::TargetNotRegistered, "componentB");
        assert!(matches!(message, Message::Error { message, .. } if message == "componentB"));
    }

    #[test]
    fn test_builtin_commands() {
        assert!(is_builtin_command("status"));
        assert!(is_builtin_command("load_plugin"));
        assert!(!is_builtin_command("rotate_keys"));
    }
}
