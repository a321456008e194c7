//! Session handshake
//!
//! ```text
//! listener                                initiator
//!    | -- public_key (clear) -------------->  |
//!    | <------------- wrapped_key (clear) --  |
//!    | -- probe (sealed) ------------------>  |
//!    | <-------------- probe_reply (sealed) - |
//! ```
//!
//! The listener generates a key pair per connection; the initiator generates
//! the session key and wraps it for that key pair. The probe proves both ends
//! hold the same session key. Its reply echoes the probe's fill reversed, so
//! a reply cannot be produced by reflecting the probe back.
//!
//! Every failure is fatal. The failing side sends a payload-free abort and the
//! error stays local.

use fluxvault_core::{Envelope, Message, ProbePayload};
use fluxvault_crypto::{
    generate_keypair, wrap_session_key, CipherRole, SessionCipher, SessionKey, WrappedKey,
};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument, warn};

use crate::channel::SecureChannel;
use crate::error::{TransportError, TransportResult};
use crate::framed::FramedStream;

/// Text of the listener's probe
pub const PROBE_TEXT: &str = "fluxvault-probe";

/// Text of the initiator's probe reply
pub const PROBE_REPLY_TEXT: &str = "fluxvault-probe-reply";

const PROBE_FILL_SIZE: usize = 16;

fn new_probe() -> ProbePayload {
    let mut fill = [0u8; PROBE_FILL_SIZE];
    rand::rng().fill_bytes(&mut fill);
    ProbePayload {
        text: PROBE_TEXT.to_string(),
        fill: hex::encode(fill),
    }
}

fn probe_reply(probe: &ProbePayload) -> ProbePayload {
    ProbePayload {
        text: PROBE_REPLY_TEXT.to_string(),
        fill: probe.fill.chars().rev().collect(),
    }
}

async fn fail_framed<S, T>(framed: &mut FramedStream<S>, reason: String) -> TransportResult<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(reason = %reason, "Handshake failed");
    let _ = framed.write_frame(&Envelope::Abort).await;
    let _ = framed.shutdown().await;
    Err(TransportError::HandshakeFailed(reason))
}

async fn fail_channel<S, T>(channel: &mut SecureChannel<S>, reason: String) -> TransportResult<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!(reason = %reason, "Handshake failed");
    channel.abort().await;
    Err(TransportError::HandshakeFailed(reason))
}

/// Run the listener side: send a fresh public key, unwrap the session key,
/// and probe
#[instrument(skip_all, fields(role = "listener"))]
pub async fn accept_handshake<S>(mut framed: FramedStream<S>) -> TransportResult<SecureChannel<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let keypair = generate_keypair();
    framed
        .write_frame(&Envelope::PublicKey {
            key: keypair.public_bytes().to_vec(),
        })
        .await?;

    let wrapped = match framed.read_frame::<Envelope>().await {
        Ok(Some(Envelope::WrappedKey { wrapped })) => wrapped,
        Ok(Some(other)) => {
            return fail_framed(&mut framed, format!("expected wrapped_key, got {}", other.tag()))
                .await;
        }
        Ok(None) => {
            return fail_framed(&mut framed, "initiator closed before key exchange".into()).await;
        }
        Err(e) => return fail_framed(&mut framed, format!("wrapped key frame: {e}")).await,
    };

    let session_key = match WrappedKey::from_bytes(&wrapped)
        .and_then(|wrapped| keypair.unwrap_session_key(&wrapped))
    {
        Ok(key) => key,
        Err(e) => return fail_framed(&mut framed, format!("unwrap failed: {e}")).await,
    };
    drop(keypair);

    let mut channel = SecureChannel::new(framed, SessionCipher::new(session_key, CipherRole::Listener));
    let probe = new_probe();
    if let Err(e) = channel.send(&Message::Probe(probe.clone())).await {
        return fail_channel(&mut channel, format!("probe: {e}")).await;
    }

    match channel.recv().await {
        Ok(Message::ProbeReply(reply)) if reply == probe_reply(&probe) => {
            debug!("Handshake complete");
            Ok(channel)
        }
        Ok(other) => fail_channel(&mut channel, format!("bad probe reply: {}", other.tag())).await,
        Err(e) => fail_channel(&mut channel, format!("probe reply: {e}")).await,
    }
}

/// Run the initiator side: wrap a fresh session key for the listener's public
/// key and answer its probe
#[instrument(skip_all, fields(role = "initiator"))]
pub async fn initiate_handshake<S>(
    mut framed: FramedStream<S>,
) -> TransportResult<SecureChannel<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let public_key = match framed.read_frame::<Envelope>().await {
        Ok(Some(Envelope::PublicKey { key })) => key,
        Ok(Some(other)) => {
            return fail_framed(&mut framed, format!("expected public_key, got {}", other.tag()))
                .await;
        }
        Ok(None) => {
            return fail_framed(&mut framed, "listener closed before key exchange".into()).await;
        }
        Err(e) => return fail_framed(&mut framed, format!("public key frame: {e}")).await,
    };

    let session_key = SessionKey::generate();
    let wrapped = match wrap_session_key(&session_key, &public_key) {
        Ok(wrapped) => wrapped,
        Err(e) => return fail_framed(&mut framed, format!("wrap failed: {e}")).await,
    };
    framed
        .write_frame(&Envelope::WrappedKey {
            wrapped: wrapped.to_bytes(),
        })
        .await?;

    let mut channel =
        SecureChannel::new(framed, SessionCipher::new(session_key, CipherRole::Initiator));

    match channel.recv().await {
        Ok(Message::Probe(probe)) if probe.text == PROBE_TEXT => {
            channel.send(&Message::ProbeReply(probe_reply(&probe))).await?;
            debug!("Handshake complete");
            Ok(channel)
        }
        Ok(other) => fail_channel(&mut channel, format!("bad probe: {}", other.tag())).await,
        Err(e) => fail_channel(&mut channel, format!("probe: {e}")).await,
    }
}
