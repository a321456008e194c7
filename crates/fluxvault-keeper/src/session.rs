//! Keeper side of an agent session
//!
//! The keeper is the handshake initiator. After authenticating it serves the
//! agent's manifest and file requests until the agent sends `ready`, then
//! issues its own commands and ends with `done`.
//!
//! Reaching a sub-agent takes two sessions on one connection: a relay leg
//! with the primary, ending in `proxy_to`, and then a full session with the
//! sub-agent over the relayed bytes, inside mutual TLS once it is enrolled.

use std::collections::HashMap;

use fluxvault_core::{
    AgentRole, AgentStatus, Message, PeerSummary, SessionErrorKind, SessionState,
    SessionStateMachine,
};
use fluxvault_crypto::sign_challenge;
use fluxvault_transport::{initiate_handshake, BoxedStream, FramedStream, SecureChannel};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{KeeperError, KeeperResult};
use crate::keeper::KeeperContext;
use crate::report::{AgentReport, CommandOutcome, CommandReport, FileOutcome, FileReport, SessionOutcome};
use crate::vault::VaultFile;

type Channel = SecureChannel<BoxedStream>;

/// One session with one agent
pub(crate) struct KeeperSession<'a> {
    ctx: &'a KeeperContext,
    component: Option<&'a str>,
    machine: SessionStateMachine,
    report: AgentReport,
    in_flight: HashMap<String, VaultFile>,
    peers: Vec<PeerSummary>,
}

impl<'a> KeeperSession<'a> {
    pub(crate) fn new(ctx: &'a KeeperContext, address: &str, component: Option<&'a str>) -> Self {
        Self {
            ctx,
            component,
            machine: SessionStateMachine::new(),
            report: AgentReport::new(address, component.map(str::to_string)),
            in_flight: HashMap::new(),
            peers: Vec::new(),
        }
    }

    /// Deliver files and run commands, returning the report and the
    /// sub-agents a primary listed
    #[instrument(skip_all, fields(agent = %self.report.target()))]
    pub(crate) async fn run(mut self, framed: FramedStream<BoxedStream>) -> (AgentReport, Vec<PeerSummary>) {
        let mut channel = match self.open(framed).await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(&e);
                return self.finish();
            }
        };

        match self.serve(&mut channel).await {
            Ok(()) => {
                if let Err(e) = self.machine.close() {
                    self.fail(&e.into());
                }
                let _ = channel.shutdown().await;
            }
            Err(e) => self.abandon(&mut channel, &e).await,
        }
        self.finish()
    }

    /// Authenticate with a primary and have it relay the connection to
    /// `component_name`
    ///
    /// Returns the stream to run the sub-agent session over.
    #[instrument(skip_all, fields(agent = %self.report.target(), component = component_name))]
    pub(crate) async fn open_relay(
        mut self,
        framed: FramedStream<BoxedStream>,
        component_name: &str,
    ) -> KeeperResult<FramedStream<BoxedStream>> {
        let mut channel = self.open(framed).await?;
        let tls = match self.request_relay(&mut channel, component_name).await {
            Ok(tls) => tls,
            Err(e) => {
                self.abandon(&mut channel, &e).await;
                return Err(e);
            }
        };

        let framed = channel.into_framed();
        if !tls {
            debug!("Relay established");
            return Ok(framed);
        }

        let (stream, pending) = framed.into_parts();
        if !pending.is_empty() {
            return Err(KeeperError::Protocol(
                "sub-agent sent data before the TLS handshake".into(),
            ));
        }
        let tls_stream = self.ctx.connector.connect(component_name, stream).await?;
        debug!("Relay established inside mutual TLS");
        Ok(FramedStream::new(Box::new(tls_stream)))
    }

    fn fail(&mut self, error: &KeeperError) {
        let kind = error.kind();
        if kind.is_security_event() {
            warn!(kind = %kind, error = %error, state = ?self.machine.state(), "Agent refused the keeper");
        } else {
            warn!(kind = %kind, error = %error, state = ?self.machine.state(), "Session failed");
        }
        self.machine.fail(kind);
        self.report.outcome = SessionOutcome::from_error(error);
    }

    /// Fail the session, telling the agent unless it already went away
    async fn abandon(&mut self, channel: &mut Channel, error: &KeeperError) {
        let lost = error.kind() == SessionErrorKind::TransportLost;
        let rejected = matches!(error, KeeperError::Rejected { .. });
        self.fail(error);
        if !lost && !rejected {
            channel.abort().await;
        }
    }

    fn finish(mut self) -> (AgentReport, Vec<PeerSummary>) {
        for (name, _) in self.in_flight.drain() {
            self.report.files.push(FileReport {
                name,
                outcome: FileOutcome::Failed {
                    message: "transfer not completed".into(),
                },
            });
        }
        (self.report, self.peers)
    }

    async fn open(&mut self, framed: FramedStream<BoxedStream>) -> KeeperResult<Channel> {
        self.machine.advance(SessionState::Handshaking)?;
        let timeout = self.ctx.config.connect_timeout();
        let mut channel = tokio::time::timeout(timeout, initiate_handshake(framed))
            .await
            .map_err(|_| KeeperError::Timeout(timeout))??;

        self.machine.advance(SessionState::Authenticating)?;
        self.authenticate(&mut channel).await?;
        self.machine.advance(SessionState::Active)?;
        Ok(channel)
    }

    async fn authenticate(&mut self, channel: &mut Channel) -> KeeperResult<()> {
        let (nonce, signature_required) = match channel.recv().await? {
            Message::AuthChallenge {
                nonce,
                signature_required,
            } => (nonce, signature_required),
            other => return Err(unexpected("auth_challenge", &other)),
        };

        let (account, signature) = match &self.ctx.signing {
            Some((account, key)) => (Some(account.clone()), Some(sign_challenge(key, &nonce))),
            None => {
                if signature_required {
                    warn!("Agent requires a signed connection but no signing account is configured");
                }
                (None, None)
            }
        };

        let reply = channel
            .request(&Message::AuthResponse {
                account,
                signature,
                address: self.ctx.config.reported_address.clone(),
            })
            .await?;
        match reply {
            Message::AuthAccepted => {
                debug!(signed = self.ctx.signing.is_some(), "Authenticated");
                Ok(())
            }
            Message::Rejected => Err(KeeperError::Rejected { signature_required }),
            other => Err(unexpected("auth_accepted", &other)),
        }
    }

    async fn serve(&mut self, channel: &mut Channel) -> KeeperResult<()> {
        self.agent_floor(channel, true).await?;
        self.keeper_floor(channel).await
    }

    async fn request_relay(&mut self, channel: &mut Channel, component_name: &str) -> KeeperResult<bool> {
        self.agent_floor(channel, false).await?;
        let reply = channel
            .request(&Message::ProxyTo {
                component_name: component_name.to_string(),
            })
            .await?;
        match reply {
            Message::ProxyReady { tls } => Ok(tls),
            Message::Error { kind, message } => Err(KeeperError::Remote { kind, message }),
            other => Err(unexpected("proxy_ready", &other)),
        }
    }

    /// Answer the agent's requests until it sends `ready`
    ///
    /// With `deliver` unset the manifest is empty, as on a relay leg.
    async fn agent_floor(&mut self, channel: &mut Channel, deliver: bool) -> KeeperResult<()> {
        loop {
            let reply = match channel.recv().await? {
                Message::ManifestRequest => {
                    let files = if deliver {
                        self.ctx.vault.manifest(self.component)
                    } else {
                        Vec::new()
                    };
                    debug!(files = files.len(), "Sending manifest");
                    Message::Manifest { files }
                }
                Message::FileRequest { name, fingerprint } if deliver => {
                    self.file_request(name, fingerprint).await
                }
                Message::FileChunkRequest { name, offset } if deliver => self.file_chunk(name, offset),
                Message::Ready => return Ok(()),
                Message::Error { kind, message } => {
                    return Err(KeeperError::Remote { kind, message });
                }
                other => {
                    warn!(tag = other.tag(), "Unexpected request from agent");
                    Message::error(
                        SessionErrorKind::InvalidRequest,
                        format!("unexpected {}", other.tag()),
                    )
                }
            };
            channel.send(&reply).await?;
        }
    }

    #[instrument(skip(self, agent_fingerprint))]
    async fn file_request(&mut self, name: String, agent_fingerprint: Option<String>) -> Message {
        if !self.ctx.vault.manages(self.component, &name) {
            warn!("Agent asked for a file outside its manifest");
            return Message::error(
                SessionErrorKind::InvalidRequest,
                format!("{name} is not managed for this agent"),
            );
        }
        self.in_flight.remove(&name);

        let file = match self.ctx.vault.read(self.component, &name).await {
            Ok(Some(file)) => file,
            Ok(None) => {
                warn!("Managed file missing from vault");
                self.record_file(&name, FileOutcome::Missing);
                return Message::FileNotFound { name };
            }
            Err(e) => {
                warn!(error = %e, "Failed to read managed file");
                self.record_file(
                    &name,
                    FileOutcome::Failed {
                        message: e.to_string(),
                    },
                );
                return Message::error(SessionErrorKind::CommandFailed, "file could not be read");
            }
        };

        let fingerprint = file.fingerprint.to_hex();
        if agent_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            debug!("Agent copy is current");
            self.record_file(&name, FileOutcome::Unchanged);
            return Message::FileUnchanged { name };
        }

        self.in_flight.insert(name.clone(), file);
        self.file_chunk(name, 0)
    }

    fn file_chunk(&mut self, name: String, offset: u64) -> Message {
        let Some(file) = self.in_flight.get(&name) else {
            return Message::error(
                SessionErrorKind::InvalidRequest,
                format!("no transfer in progress for {name}"),
            );
        };
        let Some((data, more)) = file.chunk(offset) else {
            return Message::error(
                SessionErrorKind::InvalidRequest,
                format!("offset {offset} out of range for {name}"),
            );
        };

        let reply = Message::FileContent {
            name: name.clone(),
            fingerprint: file.fingerprint.to_hex(),
            offset,
            total: file.len(),
            data: data.to_vec(),
            more,
        };
        if !more {
            let bytes = file.len();
            self.in_flight.remove(&name);
            info!(file = %name, bytes, "File sent");
            self.record_file(&name, FileOutcome::Delivered { bytes });
        }
        reply
    }

    fn record_file(&mut self, name: &str, outcome: FileOutcome) {
        self.report.files.push(FileReport {
            name: name.to_string(),
            outcome,
        });
    }

    fn record_command(&mut self, command: impl Into<String>, outcome: CommandOutcome) {
        self.report.commands.push(CommandReport {
            command: command.into(),
            outcome,
        });
    }

    /// Send a request whose failure is scoped to itself
    ///
    /// Non-fatal error replies come back as `Ok(Err(..))`; fatal ones end the
    /// session.
    async fn command(
        &mut self,
        channel: &mut Channel,
        message: &Message,
    ) -> KeeperResult<Result<Message, CommandOutcome>> {
        match channel.request(message).await? {
            Message::Error { kind, message } if !kind.is_fatal() => {
                Ok(Err(CommandOutcome::Failed { kind, message }))
            }
            Message::Error { kind, message } => Err(KeeperError::Remote { kind, message }),
            reply => Ok(Ok(reply)),
        }
    }

    /// Issue the configured commands, then `done`
    async fn keeper_floor(&mut self, channel: &mut Channel) -> KeeperResult<()> {
        let status = match channel.request(&Message::Status).await? {
            Message::StatusReport(status) => status,
            other => return Err(unexpected("status_report", &other)),
        };
        debug!(role = ?status.role, enrolled = status.enrolled, files_written = status.files_written, "Agent status");
        self.report.status = Some(status.clone());

        if !self.ctx.config.context.is_empty() {
            let message = Message::SetContext {
                values: self.ctx.config.context.clone(),
            };
            match self.command(channel, &message).await? {
                Ok(Message::Ack) => {}
                Ok(other) => return Err(unexpected("ack", &other)),
                Err(outcome) => self.record_command("set_context", outcome),
            }
        }

        self.load_plugins(channel, &status).await?;
        self.invoke_commands(channel).await?;

        if self.component.is_some() && !status.enrolled && self.ctx.config.enroll_sub_agents {
            self.enroll(channel).await?;
        }

        if status.role == AgentRole::Primary {
            match self.command(channel, &Message::ListPeers).await? {
                Ok(Message::Peers { peers }) => {
                    debug!(peers = peers.len(), "Sub-agents registered");
                    self.peers = peers;
                }
                Ok(other) => return Err(unexpected("peers", &other)),
                Err(outcome) => self.record_command("list_peers", outcome),
            }
        }

        channel.send(&Message::Done).await?;
        Ok(())
    }

    /// Ship plugins whose commands the agent does not have yet
    async fn load_plugins(&mut self, channel: &mut Channel, status: &AgentStatus) -> KeeperResult<()> {
        let ctx = self.ctx;
        for bundle in &ctx.bundles {
            let installed = bundle
                .commands
                .iter()
                .all(|c| status.plugin_commands.contains(&c.tag));
            if installed {
                debug!(plugin = %bundle.name, "Plugin already installed");
                continue;
            }

            let label = format!("load_plugin:{}", bundle.name);
            match self.command(channel, &Message::LoadPlugin(bundle.clone())).await? {
                Ok(Message::PluginLoaded { name, commands }) => {
                    info!(plugin = %name, commands = ?commands, "Plugin installed on agent");
                    self.record_command(label, CommandOutcome::Succeeded { output: json!(commands) });
                }
                Ok(other) => return Err(unexpected("plugin_loaded", &other)),
                Err(outcome) => {
                    warn!(plugin = %bundle.name, "Plugin install failed");
                    self.record_command(label, outcome);
                }
            }
        }
        Ok(())
    }

    async fn invoke_commands(&mut self, channel: &mut Channel) -> KeeperResult<()> {
        let ctx = self.ctx;
        let component = self.component;
        for invocation in ctx.config.commands.iter().filter(|c| c.applies_to(component)) {
            let message = Message::Invoke {
                command: invocation.command.clone(),
                args: invocation.args.clone(),
            };
            let outcome = match self.command(channel, &message).await? {
                Ok(Message::InvokeResult { output, .. }) => CommandOutcome::Succeeded { output },
                Ok(other) => return Err(unexpected("invoke_result", &other)),
                Err(outcome) => outcome,
            };
            self.record_command(invocation.command.clone(), outcome);
        }
        Ok(())
    }

    /// Have the sub-agent generate a key, sign its CSR and install the result
    async fn enroll(&mut self, channel: &mut Channel) -> KeeperResult<()> {
        let Some(component) = self.component else {
            return Ok(());
        };

        let (component_name, csr_pem) = match self.command(channel, &Message::GenerateCsr).await? {
            Ok(Message::Csr {
                component_name,
                csr_pem,
            }) => (component_name, csr_pem),
            Ok(other) => return Err(unexpected("csr", &other)),
            Err(outcome) => {
                self.record_command("enroll", outcome);
                return Ok(());
            }
        };

        if component_name != component {
            warn!(requested = %component_name, "CSR names a different component");
            self.record_command(
                "enroll",
                CommandOutcome::Failed {
                    kind: SessionErrorKind::InvalidRequest,
                    message: format!("CSR for {component_name:?}"),
                },
            );
            return Ok(());
        }

        let issued = match self.ctx.authority.sign_request(&csr_pem) {
            Ok(issued) => issued,
            Err(e) => {
                warn!(error = %e, "Refusing to sign CSR");
                self.record_command(
                    "enroll",
                    CommandOutcome::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                );
                return Ok(());
            }
        };

        let install = Message::InstallCertificate {
            certificate_pem: issued.certificate_pem,
            ca_certificate_pem: self.ctx.authority.root_certificate_pem().to_string(),
        };
        match self.command(channel, &install).await? {
            Ok(Message::Ack) => {
                info!(serial = issued.serial, "Sub-agent enrolled");
                self.report.enrolled = true;
                self.record_command("enroll", CommandOutcome::Succeeded { output: Value::from(issued.serial) });
            }
            Ok(other) => return Err(unexpected("ack", &other)),
            Err(outcome) => self.record_command("enroll", outcome),
        }
        Ok(())
    }
}

fn unexpected(expected: &str, actual: &Message) -> KeeperError {
    KeeperError::Protocol(format!("expected {expected}, got {}", actual.tag()))
}
