//! Agent side of a keeper session
//!
//! The agent is the handshake listener. Once the keeper is authenticated the
//! agent holds the floor first: it asks for its manifest and requests every
//! file in it, then sends `ready` and answers keeper commands until `done`.
//! Every request gets exactly one response. Request-scoped failures are
//! answered with an `error` reply and the session continues; fatal ones end
//! it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fluxvault_core::{
    AgentStatus, FileEntry, Fingerprint, Message, SessionErrorKind, SessionState,
    SessionStateMachine,
};
use fluxvault_crypto::CertificateRequest;
use fluxvault_transport::{
    accept_handshake, BoxedStream, FramedStream, SecureChannel, TransportError,
};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::auth::Credentials;
use crate::error::{AgentError, AgentResult};
use crate::plugin::SessionContext;
use crate::proxy;
use crate::server::AgentState;

/// Cap on each of stdout and stderr returned by `exec`
const MAX_EXEC_OUTPUT: usize = 16 * 1024;

type Channel = SecureChannel<BoxedStream>;

/// How the keeper floor ended
enum Handoff {
    Closed,
    Proxy {
        component_name: String,
        upstream: TcpStream,
    },
}

/// What happened in one session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub peer: SocketAddr,
    pub state: SessionState,
    pub failure: Option<SessionErrorKind>,
    pub files_written: usize,
    pub proxied_to: Option<String>,
}

/// One keeper session on an accepted connection
pub struct AgentSession {
    state: Arc<AgentState>,
    peer: SocketAddr,
    machine: SessionStateMachine,
    context: SessionContext,
    files_written: usize,
    pending_request: Option<CertificateRequest>,
    proxied_to: Option<String>,
}

impl AgentSession {
    pub(crate) fn new(state: Arc<AgentState>, peer: SocketAddr) -> Self {
        Self {
            state,
            peer,
            machine: SessionStateMachine::new(),
            context: SessionContext::new(),
            files_written: 0,
            pending_request: None,
            proxied_to: None,
        }
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            peer: self.peer,
            state: self.machine.state(),
            failure: self.machine.failure(),
            files_written: self.files_written,
            proxied_to: self.proxied_to.clone(),
        }
    }

    fn fail(&mut self, error: &AgentError) {
        let kind = error.kind();
        if kind.is_security_event() {
            warn!(peer = %self.peer, kind = %kind, error = %error, state = ?self.machine.state(), "Security event, session closed");
        } else {
            warn!(peer = %self.peer, kind = %kind, error = %error, state = ?self.machine.state(), "Session failed");
        }
        self.machine.fail(kind);
    }

    /// Drive the session to completion
    #[instrument(skip_all, fields(peer = %self.peer))]
    pub async fn run(mut self, stream: BoxedStream) -> SessionSummary {
        if let Err(e) = self.machine.advance(SessionState::Handshaking) {
            self.fail(&e.into());
            return self.summary();
        }

        let timeout = self.state.config.handshake_timeout();
        let mut channel = match tokio::time::timeout(timeout, accept_handshake(FramedStream::new(stream))).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                self.fail(&e.into());
                return self.summary();
            }
            Err(_) => {
                self.fail(&AgentError::Timeout(timeout));
                return self.summary();
            }
        };

        let result = self.authenticate_and_serve(&mut channel).await;
        match result {
            Ok(Handoff::Closed) => {
                if let Err(e) = self.machine.close() {
                    self.fail(&e.into());
                }
                let _ = channel.shutdown().await;
                debug!(files_written = self.files_written, "Session closed");
            }
            Ok(Handoff::Proxy {
                component_name,
                upstream,
            }) => {
                self.proxied_to = Some(component_name.clone());
                match proxy::hand_off(channel, upstream, &component_name).await {
                    Ok(_) => {
                        if let Err(e) = self.machine.close() {
                            self.fail(&e.into());
                        }
                    }
                    Err(e) => self.fail(&e),
                }
            }
            Err(e) => {
                let lost = matches!(
                    e,
                    AgentError::Transport(
                        TransportError::ConnectionClosed | TransportError::Aborted | TransportError::Io(_)
                    )
                );
                let rejected = e.kind().is_security_event();
                self.fail(&e);
                if rejected {
                    let _ = channel.shutdown().await;
                } else if !lost {
                    channel.abort().await;
                }
            }
        }
        self.summary()
    }

    async fn authenticate_and_serve(&mut self, channel: &mut Channel) -> AgentResult<Handoff> {
        self.machine.advance(SessionState::Authenticating)?;
        self.authenticate(channel).await?;
        self.machine.advance(SessionState::Active)?;

        self.agent_floor(channel).await?;
        self.keeper_floor(channel).await
    }

    async fn recv(&self, channel: &mut Channel) -> AgentResult<Message> {
        let idle = self.state.config.session_idle_timeout();
        tokio::time::timeout(idle, channel.recv())
            .await
            .map_err(|_| AgentError::Timeout(idle))?
            .map_err(AgentError::from)
    }

    async fn request(&self, channel: &mut Channel, message: &Message) -> AgentResult<Message> {
        channel.send(message).await?;
        self.recv(channel).await
    }

    async fn authenticate(&mut self, channel: &mut Channel) -> AgentResult<()> {
        let challenge = self.state.authenticator.challenge();
        let response = self
            .request(
                channel,
                &Message::AuthChallenge {
                    nonce: challenge.nonce.to_vec(),
                    signature_required: challenge.signature_required,
                },
            )
            .await?;

        let credentials = match response {
            Message::AuthResponse {
                account,
                signature,
                address,
            } => Credentials {
                account,
                signature,
                address,
            },
            other => {
                return Err(AgentError::Protocol(format!(
                    "expected auth_response, got {}",
                    other.tag()
                )));
            }
        };

        match self
            .state
            .authenticator
            .verify(&challenge, &credentials, self.peer.ip())
            .await
        {
            Ok(()) => {
                channel.send(&Message::AuthAccepted).await?;
                info!(account = ?credentials.account, "Keeper authenticated");
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.peer, kind = %e.kind(), error = %e, "Keeper rejected");
                tokio::time::sleep(self.state.config.rejection_delay()).await;
                let _ = channel.send(&Message::Rejected).await;
                Err(e)
            }
        }
    }

    /// Request the manifest and every file in it, then hand over the floor
    async fn agent_floor(&mut self, channel: &mut Channel) -> AgentResult<()> {
        let files = match self.request(channel, &Message::ManifestRequest).await? {
            Message::Manifest { files } => files,
            Message::Error { kind, message } if !kind.is_fatal() => {
                warn!(kind = %kind, message = %message, "Keeper could not supply a manifest");
                Vec::new()
            }
            other => {
                return Err(AgentError::Protocol(format!(
                    "expected manifest, got {}",
                    other.tag()
                )));
            }
        };
        debug!(files = files.len(), "Manifest received");

        for entry in files {
            self.sync_file(channel, entry).await?;
        }
        channel.send(&Message::Ready).await?;
        Ok(())
    }

    /// Bring one managed file up to date
    ///
    /// Only protocol and transport failures are returned; anything scoped to
    /// this file is logged and the next file is tried.
    #[instrument(skip(self, channel, entry), fields(file = %entry.name))]
    async fn sync_file(&mut self, channel: &mut Channel, entry: FileEntry) -> AgentResult<()> {
        let target = match self.state.files.resolve(&entry.remote_path) {
            Ok(target) => target,
            Err(e) => {
                warn!(remote_path = %entry.remote_path, error = %e, "Refusing manifest entry");
                return Ok(());
            }
        };
        let current = match self.state.files.fingerprint(&target).await {
            Ok(current) => current,
            Err(e) => {
                warn!(path = %target.display(), error = %e, "Cannot read current copy");
                None
            }
        };

        let reply = self
            .request(
                channel,
                &Message::FileRequest {
                    name: entry.name.clone(),
                    fingerprint: current.map(|f| f.to_hex()),
                },
            )
            .await?;

        match reply {
            Message::FileUnchanged { .. } => {
                debug!("File unchanged");
                Ok(())
            }
            Message::FileNotFound { .. } => {
                warn!("Keeper has no copy of managed file");
                Ok(())
            }
            Message::Error { kind, message } if !kind.is_fatal() => {
                warn!(kind = %kind, message = %message, "File request failed");
                Ok(())
            }
            Message::FileContent {
                fingerprint,
                offset,
                total,
                data,
                more,
                ..
            } => {
                let expected = Fingerprint::from_hex(&fingerprint)
                    .ok_or_else(|| AgentError::Protocol("malformed fingerprint".into()))?;
                if offset != 0 {
                    return Err(AgentError::Protocol(format!(
                        "first chunk at offset {offset}"
                    )));
                }
                self.receive_file(channel, &entry, target, expected, total, data, more)
                    .await
            }
            other => Err(AgentError::Protocol(format!(
                "unexpected reply to file_request: {}",
                other.tag()
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn receive_file(
        &mut self,
        channel: &mut Channel,
        entry: &FileEntry,
        target: std::path::PathBuf,
        expected: Fingerprint,
        total: u64,
        first: Vec<u8>,
        mut more: bool,
    ) -> AgentResult<()> {
        let mut pending = match self.state.files.begin(target.clone(), expected, total).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(path = %target.display(), error = %e, "Cannot write managed file");
                return Ok(());
            }
        };
        if let Err(e) = pending.write_chunk(0, &first).await {
            pending.discard().await;
            return Err(e);
        }

        while more {
            let reply = self
                .request(
                    channel,
                    &Message::FileChunkRequest {
                        name: entry.name.clone(),
                        offset: pending.written(),
                    },
                )
                .await;
            match reply {
                Ok(Message::FileContent {
                    offset,
                    data,
                    more: next,
                    ..
                }) => {
                    if let Err(e) = pending.write_chunk(offset, &data).await {
                        pending.discard().await;
                        return Err(e);
                    }
                    more = next;
                }
                Ok(Message::Error { kind, message }) if !kind.is_fatal() => {
                    warn!(kind = %kind, message = %message, "Transfer abandoned by keeper");
                    pending.discard().await;
                    return Ok(());
                }
                Ok(other) => {
                    pending.discard().await;
                    return Err(AgentError::Protocol(format!(
                        "unexpected reply to file_chunk_request: {}",
                        other.tag()
                    )));
                }
                Err(e) => {
                    pending.discard().await;
                    return Err(e);
                }
            }
        }

        match pending.finish().await {
            Ok(path) => {
                self.files_written += 1;
                info!(path = %path.display(), bytes = total, "Managed file written");
            }
            Err(e) => warn!(path = %target.display(), error = %e, "Managed file not written"),
        }
        Ok(())
    }

    /// Answer keeper commands until `done` or a proxy hand-off
    async fn keeper_floor(&mut self, channel: &mut Channel) -> AgentResult<Handoff> {
        loop {
            let message = self.recv(channel).await?;
            debug!(tag = message.tag(), "Keeper command");
            let reply = match message {
                Message::Done => return Ok(Handoff::Closed),
                Message::ProxyTo { component_name } => match self.prepare_proxy(&component_name).await {
                    Ok((upstream, tls)) => {
                        channel.send(&Message::ProxyReady { tls }).await?;
                        return Ok(Handoff::Proxy {
                            component_name,
                            upstream,
                        });
                    }
                    Err(e) => self.error_reply(e),
                },
                other => match self.dispatch(other).await {
                    Ok(reply) => reply,
                    Err(e) => self.error_reply(e),
                },
            };
            self.respond(channel, reply).await?;
        }
    }

    /// Send a reply, replacing one too large for a frame with an error
    async fn respond(&self, channel: &mut Channel, reply: Message) -> AgentResult<()> {
        match channel.send(&reply).await {
            Err(TransportError::Codec(fluxvault_core::CodecError::FrameTooLarge { size, .. })) => {
                warn!(tag = reply.tag(), size, "Reply exceeds frame limit");
                channel
                    .send(&Message::error(
                        SessionErrorKind::CommandFailed,
                        "reply exceeds frame limit",
                    ))
                    .await?;
                Ok(())
            }
            other => other.map_err(AgentError::from),
        }
    }

    fn error_reply(&self, error: AgentError) -> Message {
        let kind = error.kind();
        if kind.is_security_event() {
            warn!(kind = %kind, error = %error, "Request refused");
        } else {
            debug!(kind = %kind, error = %error, "Request failed");
        }
        Message::error(kind, error.to_string())
    }

    async fn prepare_proxy(&self, component_name: &str) -> AgentResult<(TcpStream, bool)> {
        let peers = self
            .state
            .peers
            .as_ref()
            .ok_or_else(|| AgentError::InvalidRequest("not a primary agent".into()))?;
        let (record, upstream) = proxy::connect_upstream(
            peers,
            component_name,
            self.state.config.upstream_connect_timeout(),
        )
        .await?;
        Ok((upstream, record.enrolled()))
    }

    async fn dispatch(&mut self, message: Message) -> AgentResult<Message> {
        match message {
            Message::Status => Ok(Message::StatusReport(self.status().await)),
            Message::ListCommands => Ok(Message::Commands {
                commands: self.state.plugins.list_commands().await,
            }),
            Message::SetContext { values } => {
                debug!(keys = values.len(), "Context updated");
                self.context.merge(values);
                Ok(Message::Ack)
            }
            Message::LoadPlugin(bundle) => {
                let name = bundle.name.clone();
                let commands = self.state.plugins.load(bundle).await?;
                Ok(Message::PluginLoaded { name, commands })
            }
            Message::Invoke { command, args } => {
                let output = self.state.plugins.invoke(&command, args, &self.context).await?;
                Ok(Message::InvokeResult { command, output })
            }
            Message::Exec { program, args } => self.exec(program, args).await,
            Message::ListPeers => {
                let peers = self
                    .state
                    .peers
                    .as_ref()
                    .ok_or_else(|| AgentError::InvalidRequest("not a primary agent".into()))?;
                Ok(Message::Peers { peers: peers.list() })
            }
            Message::GenerateCsr => {
                let component_name = self
                    .state
                    .config
                    .component_name()
                    .ok_or_else(|| AgentError::InvalidRequest("agent has no component name".into()))?;
                let request = CertificateRequest::generate(component_name)?;
                let reply = Message::Csr {
                    component_name: component_name.to_string(),
                    csr_pem: request.csr_pem().to_string(),
                };
                self.pending_request = Some(request);
                Ok(reply)
            }
            Message::InstallCertificate {
                certificate_pem,
                ca_certificate_pem,
            } => {
                let request = self.pending_request.as_ref().ok_or_else(|| {
                    AgentError::InvalidRequest("no certificate request pending".into())
                })?;
                self.state
                    .enrollment
                    .install(request, certificate_pem, ca_certificate_pem)
                    .await?;
                self.pending_request = None;
                Ok(Message::Ack)
            }
            other => Err(AgentError::InvalidRequest(format!(
                "unexpected {} from keeper",
                other.tag()
            ))),
        }
    }

    async fn status(&self) -> AgentStatus {
        AgentStatus {
            role: self.state.config.role(),
            component_name: self.state.config.component_name().map(str::to_string),
            enrolled: self.state.enrollment.is_enrolled().await,
            files_written: self.files_written,
            plugin_commands: self.state.plugins.command_tags().await,
            uptime_secs: self.state.started.elapsed().as_secs(),
        }
    }

    async fn exec(&self, program: String, args: Vec<String>) -> AgentResult<Message> {
        if !self.state.config.allow_exec {
            return Err(AgentError::InvalidRequest("exec is disabled on this agent".into()));
        }
        info!(program = %program, args = args.len(), "Running exec command");
        let timeout: Duration = self.state.config.plugin_command_timeout();
        let output = Command::new(&program)
            .args(&args)
            .current_dir(self.state.files.working_dir())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| AgentError::CommandFailed(format!("{program:?} timed out after {timeout:?}")))?
            .map_err(|e| AgentError::CommandFailed(format!("failed to run {program:?}: {e}")))?;

        Ok(Message::ExecResult {
            status: output.status.code().unwrap_or(-1),
            stdout: truncated(&output.stdout),
            stderr: truncated(&output.stderr),
        })
    }
}

fn truncated(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_EXEC_OUTPUT);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
