//! POP3 Server
//!
//! POP3 access to a user's INBOX. Messages marked with DELE are flagged
//! `\Deleted` and expunged when the client QUITs from the transaction
//! state; a dropped connection leaves the maildrop untouched.

use super::command::{Pop3Command, Pop3Parser};
use super::response::Pop3Response;
use super::session::Pop3Session;
use crate::backend::Backends;
use crate::listener;
use crate::mailbox::MailboxState;
use crate::session::{ClientSession, ClientState, Input, SessionLimits};
use mailstore_common::config::ServiceConfig;
use mailstore_common::types::MailboxPermission;
use mailstore_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// POP3 Server
pub struct Pop3Server {
    config: ServiceConfig,
    backends: Backends,
}

impl Pop3Server {
    /// Create a new POP3 server
    pub fn new(backends: Backends) -> Self {
        Self {
            config: backends.config.pop3.clone(),
            backends,
        }
    }

    /// Serve clients until `shutdown` fires
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let backends = self.backends.clone();
        listener::serve(
            "pop3",
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

/// Handle a single POP3 connection
pub async fn handle_connection<S>(stream: S, peer: String, backends: Backends) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limits = SessionLimits::from(&backends.config.pop3);
    let mut client = ClientSession::new(stream, limits, peer);
    let mut session = Pop3Session::new();
    info!(peer = %client.peer(), "New POP3 connection");

    let server = &backends.config.server;
    let banner = if server.banner.is_empty() {
        format!("{} mailstore POP3 ready", server.hostname)
    } else {
        server.banner.clone()
    };
    client.push(Pop3Response::greeting(&banner));
    client.set_state(ClientState::NonAuthenticated);
    client.flush().await?;

    while !client.state().is_terminal() {
        let line = match client.read_line().await? {
            Input::Data(line) => line,
            Input::Refused { reason, .. } => {
                refuse(&mut client, &reason);
                client.flush().await?;
                continue;
            }
            Input::Closed => {
                debug!(peer = %client.peer(), "Connection closed by client");
                client.set_state(ClientState::Quit);
                break;
            }
            Input::Expired => {
                client.push(Pop3Response::err("idle timeout"));
                break;
            }
        };

        let line = String::from_utf8_lossy(&line).into_owned();
        match Pop3Parser::parse(&line) {
            Ok(command) => process(&mut client, &mut session, &backends, command).await?,
            Err(message) => refuse(&mut client, &message),
        }
        client.flush().await?;
    }

    client.close().await;
    info!(peer = %client.peer(), state = ?client.state(), "POP3 connection closed");
    Ok(())
}

/// Answer a protocol error and count it
fn refuse<S: AsyncRead + AsyncWrite + Unpin>(client: &mut ClientSession<S>, message: &str) {
    client.push(Pop3Response::err(message));
    if client.bad() {
        warn!(peer = %client.peer(), errors = client.errors(), "Too many errors");
        client.push(Pop3Response::err("too many errors"));
        client.set_state(ClientState::Error);
    }
}

async fn process<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ClientSession<S>,
    session: &mut Pop3Session,
    backends: &Backends,
    command: Pop3Command,
) -> Result<()> {
    if !client.state().allows(command.requires()) {
        refuse(client, &format!("{} not allowed in this state", command.name()));
        return Ok(());
    }
    client.good();
    debug!(peer = %client.peer(), command = command.name(), "Command");

    let mut out = Vec::new();
    match execute(&mut out, session, backends, command).await {
        Ok(Next::Continue) => client.push(&out),
        Ok(Next::Authenticated) => {
            client.push(&out);
            client.set_state(ClientState::Authenticated);
        }
        Ok(Next::Quit) => {
            client.push(&out);
            client.set_state(ClientState::Quit);
        }
        Err(Error::Auth(message)) => {
            client.push(Pop3Response::err(&format!("[AUTH] {}", message)));
        }
        Err(Error::Validation(message)) | Err(Error::NotFound(message)) => {
            client.push(Pop3Response::err(&message));
        }
        Err(e) if e.is_transient() => {
            error!(peer = %client.peer(), error = %e, "Storage failure");
            client.push(Pop3Response::err("[SYS/TEMP] mail storage temporarily unavailable"));
            if let Err(e) = backends.store.health_check().await {
                error!(peer = %client.peer(), error = %e, "Storage health check failed");
                client.set_state(ClientState::Error);
            }
        }
        Err(e) => {
            error!(peer = %client.peer(), error = %e, "Command failed");
            client.push(Pop3Response::err("[SYS/PERM] internal error"));
        }
    }
    Ok(())
}

/// What the connection loop does after a command
enum Next {
    Continue,
    Authenticated,
    Quit,
}

async fn execute(
    out: &mut Vec<u8>,
    session: &mut Pop3Session,
    backends: &Backends,
    command: Pop3Command,
) -> Result<Next> {
    let store = &backends.store;
    let no_such_message = || Error::NotFound("no such message".to_string());

    match command {
        Pop3Command::User { username } => {
            session.username = Some(username);
            out.extend_from_slice(Pop3Response::ok("send password").as_bytes());
        }

        Pop3Command::Pass { password } => {
            let username = session
                .username
                .take()
                .ok_or_else(|| Error::Validation("USER first".to_string()))?;
            let user_id = backends
                .auth
                .validate(&username, &password)
                .await?
                .ok_or_else(|| Error::Auth("invalid credentials".to_string()))?;

            let inbox = match store.mailboxes.find_by_name(user_id, "INBOX").await? {
                Some(inbox) => inbox,
                None => {
                    store
                        .mailboxes
                        .create(user_id, "INBOX", MailboxPermission::ReadWrite)
                        .await?
                }
            };
            let maildrop = MailboxState::open(store, inbox.id).await?;
            if !maildrop.is_read_only() {
                store.messages.clear_recent(inbox.id).await?;
            }

            info!(user = %username, user_id, messages = maildrop.exists(), "POP3 login");
            session.authenticate(user_id, username, maildrop);
            out.extend_from_slice(
                Pop3Response::ok(&format!(
                    "maildrop has {} messages ({} octets)",
                    session.message_count(),
                    session.total_size()
                ))
                .as_bytes(),
            );
            return Ok(Next::Authenticated);
        }

        Pop3Command::Stat => {
            out.extend_from_slice(
                Pop3Response::stat(session.message_count(), session.total_size()).as_bytes(),
            );
        }

        Pop3Command::List { msg: Some(msg) } => {
            let info = session.get(msg).ok_or_else(no_such_message)?;
            out.extend_from_slice(b"+OK ");
            out.extend_from_slice(Pop3Response::listing(msg, info.size).as_bytes());
        }

        Pop3Command::List { msg: None } => {
            out.extend_from_slice(
                Pop3Response::list_header(session.message_count(), session.total_size())
                    .as_bytes(),
            );
            for (msn, info) in session.messages() {
                out.extend_from_slice(Pop3Response::listing(msn, info.size).as_bytes());
            }
            out.extend_from_slice(Pop3Response::terminator().as_bytes());
        }

        Pop3Command::Uidl { msg: Some(msg) } => {
            let info = session.get(msg).ok_or_else(no_such_message)?;
            out.extend_from_slice(b"+OK ");
            out.extend_from_slice(Pop3Response::listing(msg, info.uid).as_bytes());
        }

        Pop3Command::Uidl { msg: None } => {
            out.extend_from_slice(Pop3Response::ok("unique-id listing follows").as_bytes());
            for (msn, info) in session.messages() {
                out.extend_from_slice(Pop3Response::listing(msn, info.uid).as_bytes());
            }
            out.extend_from_slice(Pop3Response::terminator().as_bytes());
        }

        Pop3Command::Retr { msg } => {
            let raw = message_bytes(session, backends, msg).await?;
            out.extend_from_slice(Pop3Response::ok(&format!("{} octets", raw.len())).as_bytes());
            Pop3Response::multiline(out, &raw);
        }

        Pop3Command::Top { msg, lines } => {
            let raw = message_bytes(session, backends, msg).await?;
            out.extend_from_slice(Pop3Response::ok("top of message follows").as_bytes());
            Pop3Response::multiline(out, &top(&raw, lines as usize));
        }

        Pop3Command::Dele { msg } => {
            if !session.mark_deleted(msg) {
                return Err(no_such_message());
            }
            out.extend_from_slice(Pop3Response::ok(&format!("message {} deleted", msg)).as_bytes());
        }

        Pop3Command::Noop => out.extend_from_slice(b"+OK\r\n"),

        Pop3Command::Rset => {
            session.reset_deletions();
            out.extend_from_slice(
                Pop3Response::ok(&format!("maildrop has {} messages", session.message_count()))
                    .as_bytes(),
            );
        }

        Pop3Command::Capa => out.extend_from_slice(Pop3Response::capabilities().as_bytes()),

        Pop3Command::Quit => {
            let removed = commit(session, backends).await?;
            let message = match session.user.as_ref() {
                Some(_) => format!(
                    "mailstore signing off ({} messages removed, {} left)",
                    removed,
                    session.message_count()
                ),
                None => "mailstore signing off".to_string(),
            };
            out.extend_from_slice(Pop3Response::ok(&message).as_bytes());
            return Ok(Next::Quit);
        }
    }
    Ok(Next::Continue)
}

async fn message_bytes(session: &Pop3Session, backends: &Backends, msg: u32) -> Result<Vec<u8>> {
    let info = session
        .get(msg)
        .ok_or_else(|| Error::NotFound("no such message".to_string()))?;
    let maildrop = session
        .maildrop
        .as_ref()
        .ok_or_else(|| Error::Internal("no maildrop".to_string()))?;
    backends
        .store
        .messages
        .fetch_raw(maildrop.id, info.uid)
        .await?
        .ok_or_else(|| Error::NotFound(format!("message {} has been removed", msg)))
}

/// The header block and the first `lines` lines of the body
fn top(raw: &[u8], lines: usize) -> Vec<u8> {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|p| p + 2));
    let Some(split) = split else {
        return raw.to_vec();
    };

    let (header, body) = raw.split_at(split);
    let mut out = header.to_vec();
    for line in body.split_inclusive(|b| *b == b'\n').take(lines) {
        out.extend_from_slice(line);
    }
    out
}

/// Update state: flag the DELE'd messages `\Deleted` and expunge them.
/// Returns how many messages were removed.
async fn commit(session: &mut Pop3Session, backends: &Backends) -> Result<usize> {
    let store = &backends.store;
    let uids = session.deleted_uids();
    let Some(maildrop) = session.maildrop.as_ref() else {
        return Ok(0);
    };
    if uids.is_empty() {
        return Ok(0);
    }

    for uid in &uids {
        if let Some(info) = maildrop.info(*uid) {
            let mut flags = info.flags.clone();
            flags.deleted = true;
            store.messages.store_flags(maildrop.id, *uid, &flags).await?;
        }
    }
    let removed = store.messages.expunge(maildrop.id).await?;
    info!(mailbox_id = maildrop.id, removed = removed.len(), "POP3 deletions committed");

    session.reset_deletions();
    if let Some(maildrop) = session.maildrop.as_mut() {
        for uid in &removed {
            let _ = maildrop.apply_expunge(*uid);
        }
    }
    Ok(removed.len())
}
