//! Core types for FluxVault
//!
//! FluxVault delivers private files from a trusted keeper into remotely hosted
//! agents. This crate holds everything both sides agree on without touching
//! the network or any key material:
//!
//! - [`codec`]: newline-delimited, size-bounded JSON frames
//! - [`message`]: the closed vocabulary of envelopes and session messages
//! - [`state`]: the session lifecycle state machine
//! - [`manifest`]: managed file specifications and content fingerprints
//! - [`identity`]: collaborator traits for identity, address and key lookup
//! - [`error`]: the session error taxonomy shared by every crate

pub mod codec;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod message;
pub mod state;

pub use codec::{decode_frame, encode_frame, FrameBuffer, MAX_FRAME_SIZE};
pub use error::{CodecError, CodecResult, SessionErrorKind};
pub use identity::{
    AddressDirectory, Identity, IdentityDirectory, KeyStore, StaticAddressDirectory,
    StaticIdentityDirectory,
};
pub use manifest::{ensure_contained, Fingerprint, ManagedFileSpec, ManifestError, SyncMode};
pub use message::{
    AgentRole, AgentStatus, CommandInfo, Envelope, FileEntry, Message, PeerSummary,
    PluginBundle, PluginCommandSpec, PluginFile, ProbePayload,
};
pub use state::{InvalidTransition, SessionState, SessionStateMachine};

/// Default TCP port agents listen on for keeper sessions
pub const DEFAULT_AGENT_PORT: u16 = 8888;

/// Default TCP port a primary agent's registrar listens on
pub const DEFAULT_REGISTRAR_PORT: u16 = 8889;

/// Largest raw file chunk carried in one `file_content` message
///
/// Base64 expansion plus the sealing overhead keeps a full chunk well under
/// [`MAX_FRAME_SIZE`].
pub const FILE_CHUNK_SIZE: usize = 16 * 1024;
