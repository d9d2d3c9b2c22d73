//! IMAP Server
//!
//! Connection loop of the IMAP4rev1 service: greeting, request framing,
//! state checks, command dispatch and the mapping of failures onto
//! tagged NO and BAD responses.

use super::command::{ImapCommand, TaggedCommand};
use super::handler::Handler;
use super::parser::ImapParser;
use super::response::ImapResponse;
use super::session::ImapSession;
use crate::backend::Backends;
use crate::listener;
use crate::session::{ClientSession, ClientState, Input, SessionLimits};
use mailstore_common::config::ServiceConfig;
use mailstore_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// IMAP Server
pub struct ImapServer {
    config: ServiceConfig,
    backends: Backends,
}

impl ImapServer {
    /// Create a new IMAP server
    pub fn new(backends: Backends) -> Self {
        Self {
            config: backends.config.imap.clone(),
            backends,
        }
    }

    /// Serve clients until `shutdown` fires
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let backends = self.backends.clone();
        listener::serve(
            "imap",
            listener,
            self.config.clone(),
            shutdown,
            move |stream, peer| {
                let backends = backends.clone();
                async move { handle_connection(stream, peer.to_string(), backends).await }
            },
        )
        .await
    }
}

/// Greeting text: the configured banner, or a generic one
fn banner(backends: &Backends) -> String {
    let server = &backends.config.server;
    if server.banner.is_empty() {
        format!("{} mailstore IMAP4rev1 ready", server.hostname)
    } else {
        server.banner.clone()
    }
}

/// Handle a single IMAP connection
pub async fn handle_connection<S>(stream: S, peer: String, backends: Backends) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limits = SessionLimits::from(&backends.config.imap);
    let mut client = ClientSession::new(stream, limits, peer);
    let mut session = ImapSession::new();
    info!(peer = %client.peer(), "New IMAP connection");

    client.push(ImapResponse::greeting(&banner(&backends)));
    client.set_state(ClientState::NonAuthenticated);
    client.flush().await?;

    while !client.state().is_terminal() {
        let request = match client.read_request().await? {
            Input::Data(request) => request,
            Input::Refused { request, reason } => {
                warn!(peer = %client.peer(), reason = %reason, "Request refused");
                let tag = request_tag(&request);
                bad(&mut client, tag.as_deref(), &reason);
                client.flush().await?;
                continue;
            }
            Input::Closed => {
                debug!(peer = %client.peer(), "Connection closed by client");
                client.set_state(ClientState::Quit);
                break;
            }
            Input::Expired => {
                client.push(ImapResponse::bye("idle timeout"));
                break;
            }
        };

        if request.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match ImapParser::parse(&request) {
            Ok(command) => process(&mut client, &mut session, &backends, command).await?,
            Err(e) => {
                debug!(peer = %client.peer(), error = %e.message, "Malformed command");
                bad(&mut client, e.tag.as_deref(), &e.message);
            }
        }
        client.flush().await?;
    }

    client.close().await;
    info!(peer = %client.peer(), state = ?client.state(), "IMAP connection closed");
    Ok(())
}

/// Tag of a request that was not parsed
fn request_tag(request: &[u8]) -> Option<String> {
    let tag = request.split(|b| *b == b' ').next()?;
    let tag = String::from_utf8_lossy(tag).into_owned();
    (!tag.is_empty()).then_some(tag)
}

/// Answer BAD and count the error; too many in a row end the session
fn bad<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ClientSession<S>,
    tag: Option<&str>,
    message: &str,
) {
    client.push(ImapResponse::bad(tag, message));
    if client.bad() {
        warn!(peer = %client.peer(), errors = client.errors(), "Too many errors");
        client.push(ImapResponse::bye("too many errors"));
        client.set_state(ClientState::Error);
    }
}

async fn process<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ClientSession<S>,
    session: &mut ImapSession,
    backends: &Backends,
    tagged: TaggedCommand,
) -> Result<()> {
    let TaggedCommand { tag, command } = tagged;
    if !client.state().allows(command.requires()) {
        bad(
            client,
            Some(&tag),
            &format!("{} not allowed in this state", command.name()),
        );
        return Ok(());
    }
    client.good();
    debug!(peer = %client.peer(), tag = %tag, command = command.name(), "Command");

    let command = match command {
        ImapCommand::Authenticate {
            mechanism,
            initial_response: None,
        } => {
            client.push(ImapResponse::continue_req());
            client.flush().await?;
            match client.read_line().await? {
                Input::Data(line) => {
                    let line = String::from_utf8_lossy(&line).trim().to_string();
                    if line == "*" {
                        bad(client, Some(&tag), "authentication cancelled");
                        return Ok(());
                    }
                    ImapCommand::Authenticate {
                        mechanism,
                        initial_response: Some(line),
                    }
                }
                Input::Refused { reason, .. } => {
                    bad(client, Some(&tag), &reason);
                    return Ok(());
                }
                Input::Closed => {
                    client.set_state(ClientState::Quit);
                    return Ok(());
                }
                Input::Expired => {
                    client.push(ImapResponse::bye("idle timeout"));
                    return Ok(());
                }
            }
        }
        other => other,
    };

    let resyncs = command.resyncs();
    let mut out = Vec::new();
    let result = {
        let mut handler = Handler::new(backends, session, &mut out);
        match handler.execute(command).await {
            Ok(text) if resyncs => handler.report_changes().await.map(|_| text),
            other => other,
        }
    };
    client.push(&out);
    client.set_state(session.state());

    match result {
        Ok(text) => client.push(ImapResponse::ok(&tag, &text)),
        Err(e) => fail(client, session, backends, &tag, e).await,
    }
    Ok(())
}

/// Turn a failed command into its completion response
async fn fail<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ClientSession<S>,
    session: &mut ImapSession,
    backends: &Backends,
    tag: &str,
    error: Error,
) {
    match error {
        Error::InvalidQuery(message) => bad(client, Some(tag), &message),
        Error::Validation(message) | Error::NotFound(message) => {
            client.push(ImapResponse::no(tag, &message))
        }
        Error::PermissionDenied(message) => {
            client.push(ImapResponse::no(tag, &format!("[NOPERM] {}", message)))
        }
        Error::Auth(message) => {
            client.push(ImapResponse::no(
                tag,
                &format!("[AUTHENTICATIONFAILED] {}", message),
            ));
        }
        Error::Sync(message) => {
            warn!(peer = %client.peer(), error = %message, "Mailbox view out of date");
            let mut out = Vec::new();
            if let Err(e) = Handler::new(backends, session, &mut out).report_changes().await {
                warn!(peer = %client.peer(), error = %e, "Resync failed");
            }
            client.push(&out);
            client.push(ImapResponse::no(tag, &message));
        }
        Error::Storage(message) => {
            error!(peer = %client.peer(), error = %message, "Storage failure");
            client.push(ImapResponse::no(
                tag,
                "[UNAVAILABLE] mail storage temporarily unavailable",
            ));
            if let Err(e) = backends.store.health_check().await {
                error!(peer = %client.peer(), error = %e, "Storage health check failed");
                client.push(ImapResponse::bye("storage unavailable"));
                client.set_state(ClientState::Error);
            }
        }
        other => {
            error!(peer = %client.peer(), error = %other, "Command failed");
            client.push(ImapResponse::no(tag, "[SERVERBUG] internal error"));
        }
    }
}
