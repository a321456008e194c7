//! Transport layer for FluxVault
//!
//! Builds an encrypted, framed session on top of any async byte stream:
//!
//! - [`framed`]: newline-delimited JSON frames over `AsyncRead + AsyncWrite`
//! - [`handshake`]: listener/initiator key exchange and probe
//! - [`channel`]: the encrypted request/response channel it produces
//! - [`tls`]: mutual TLS for proxied hops, rooted in the keeper's authority
//! - [`relay`]: opaque byte forwarding between two streams
//!
//! # Example
//!
//! ```ignore
//! use fluxvault_transport::{accept_handshake, FramedStream};
//!
//! let (stream, peer) = listener.accept().await?;
//! let mut channel = accept_handshake(FramedStream::new(stream)).await?;
//! let request = channel.recv().await?;
//! ```

pub mod channel;
pub mod error;
pub mod framed;
pub mod handshake;
pub mod relay;
pub mod stream;
pub mod tls;

pub use channel::SecureChannel;
pub use error::{TransportError, TransportResult};
pub use framed::FramedStream;
pub use handshake::{accept_handshake, initiate_handshake, PROBE_REPLY_TEXT, PROBE_TEXT};
pub use relay::{relay, RelayStats};
pub use stream::{AsyncStream, BoxedStream};
pub use tls::{TlsAcceptor, TlsConnector, TlsIdentity};
