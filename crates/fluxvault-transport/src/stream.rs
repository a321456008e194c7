//! Type-erased byte streams
//!
//! Sessions switch between plain TCP and TLS-wrapped streams at runtime, so
//! the higher layers work with a boxed stream rather than a concrete type.

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream a session can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Heap-allocated stream of unknown concrete type
pub type BoxedStream = Box<dyn AsyncStream>;
