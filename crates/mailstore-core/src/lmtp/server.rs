//! LMTP Server
//!
//! Recipients are resolved when they are given with RCPT; the message is
//! delivered after DATA and answered with one reply per accepted recipient.

use super::command::{parse, LmtpCommand};
use crate::backend::Backends;
use crate::delivery::{DsnStatus, Recipient};
use crate::listener;
use crate::session::{ClientSession, ClientState, Input, SessionLimits};
use mailstore_common::config::ServiceConfig;
use mailstore_common::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// LMTP Server
pub struct LmtpServer {
    config: ServiceConfig,
    backends: Backends,
}

impl LmtpServer {
    pub fn new(backends: Backends) -> Self {
        Self {
            config: backends.config.lmtp.clone(),
            backends,
        }
    }

    /// Serve clients until `shutdown` fires
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let backends = self.backends.clone();
        listener::serve(
            "lmtp",
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

/// Transaction progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connected,
    Greeted,
    MailFrom,
}

#[derive(Debug, Default)]
struct Envelope {
    from: Option<String>,
    recipients: Vec<Recipient>,
}

fn reply(code: u16, text: &str) -> String {
    format!("{} {}\r\n", code, text)
}

/// Reply for one recipient after DATA
fn recipient_reply(status: DsnStatus, address: &str) -> String {
    format!(
        "{} {} {} <{}>\r\n",
        status.reply_code(),
        status,
        status.description(),
        address
    )
}

/// Handle a single LMTP connection
pub async fn handle_connection<S>(stream: S, peer: String, backends: Backends) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limits = SessionLimits::from(&backends.config.lmtp);
    let max_size = limits.max_literal_size;
    let mut client = ClientSession::new(stream, limits, peer);
    let hostname = backends.config.server.hostname.clone();
    info!(peer = %client.peer(), "New LMTP connection");

    let banner = if backends.config.server.banner.is_empty() {
        format!("{} mailstore LMTP ready", hostname)
    } else {
        backends.config.server.banner.clone()
    };
    client.push(reply(220, &banner));
    client.set_state(ClientState::NonAuthenticated);
    client.flush().await?;

    let mut stage = Stage::Connected;
    let mut envelope = Envelope::default();

    while !client.state().is_terminal() {
        let line = match client.read_line().await? {
            Input::Data(line) => line,
            Input::Refused { .. } => {
                refuse(&mut client, "500 5.5.2 Line too long");
                client.flush().await?;
                continue;
            }
            Input::Closed => {
                client.set_state(ClientState::Quit);
                break;
            }
            Input::Expired => {
                client.push(reply(421, "4.4.2 Idle timeout"));
                break;
            }
        };
        let line = String::from_utf8_lossy(&line).into_owned();
        debug!(peer = %client.peer(), line = %line, "LMTP command");

        let command = match parse(&line) {
            Ok(command) => command,
            Err(message) => {
                refuse(&mut client, &message);
                client.flush().await?;
                continue;
            }
        };
        client.good();

        match command {
            LmtpCommand::Lhlo { domain } => {
                envelope = Envelope::default();
                stage = Stage::Greeted;
                client.set_state(ClientState::Authenticated);
                client.push(format!(
                    "250-{} hello {}\r\n250-PIPELINING\r\n250-ENHANCEDSTATUSCODES\r\n\
                     250-8BITMIME\r\n250 SIZE {}\r\n",
                    hostname, domain, max_size
                ));
            }

            LmtpCommand::Mail { from, size } => {
                if stage != Stage::Greeted {
                    refuse(&mut client, "503 5.5.1 Bad sequence of commands");
                } else if size.map_or(false, |s| s > max_size) {
                    client.push(reply(552, "5.3.4 Message size exceeds fixed limit"));
                } else {
                    debug!(peer = %client.peer(), from = %from, "Sender");
                    envelope.from = Some(from);
                    stage = Stage::MailFrom;
                    client.push(reply(250, "2.1.0 OK"));
                }
            }

            LmtpCommand::Rcpt { to } => {
                if stage != Stage::MailFrom {
                    refuse(&mut client, "503 5.5.1 Bad sequence of commands");
                } else {
                    match backends.delivery.resolve(&to).await {
                        Ok(recipient) if recipient.status.is_success() => {
                            client.push(reply(250, &format!("{} OK", recipient.status)));
                            envelope.recipients.push(recipient);
                        }
                        Ok(recipient) => {
                            client.push(recipient_reply(recipient.status, &recipient.address));
                        }
                        Err(e) => {
                            warn!(peer = %client.peer(), rcpt = %to, error = %e, "Recipient lookup failed");
                            client.push(reply(451, "4.3.0 Temporary lookup failure"));
                        }
                    }
                }
            }

            LmtpCommand::Data => {
                if stage != Stage::MailFrom || envelope.recipients.is_empty() {
                    refuse(&mut client, "503 5.5.1 No valid recipients");
                } else {
                    client.push(reply(354, "Start mail input; end with <CRLF>.<CRLF>"));
                    client.flush().await?;
                    match read_data(&mut client, max_size).await? {
                        Some(Body::Complete(data)) => {
                            deliver(&mut client, &backends, &envelope, &data).await;
                        }
                        Some(Body::TooLarge) => {
                            for recipient in &envelope.recipients {
                                client.push(recipient_reply(DsnStatus::too_big(), &recipient.address));
                            }
                        }
                        None => break,
                    }
                    envelope = Envelope::default();
                    stage = Stage::Greeted;
                }
            }

            LmtpCommand::Rset => {
                envelope = Envelope::default();
                if stage != Stage::Connected {
                    stage = Stage::Greeted;
                }
                client.push(reply(250, "2.0.0 OK"));
            }

            LmtpCommand::Noop => client.push(reply(250, "2.0.0 OK")),

            LmtpCommand::Vrfy { address } => match backends.delivery.resolve(&address).await {
                Ok(recipient) if recipient.status.is_success() => {
                    client.push(reply(252, &format!("2.1.5 <{}>", recipient.address)));
                }
                Ok(recipient) => client.push(recipient_reply(recipient.status, &recipient.address)),
                Err(_) => client.push(reply(451, "4.3.0 Temporary lookup failure")),
            },

            LmtpCommand::Quit => {
                client.push(reply(221, "2.0.0 Bye"));
                client.set_state(ClientState::Quit);
            }
        }
        client.flush().await?;
    }

    client.close().await;
    info!(peer = %client.peer(), "LMTP connection closed");
    Ok(())
}

/// Answer a protocol error and count it
fn refuse<S: AsyncRead + AsyncWrite + Unpin>(client: &mut ClientSession<S>, line: &str) {
    client.push(format!("{}\r\n", line));
    if client.bad() {
        client.push(reply(421, "4.7.0 Too many errors"));
        client.set_state(ClientState::Error);
    }
}

enum Body {
    Complete(Vec<u8>),
    TooLarge,
}

/// Read the message up to the lone dot, undoing dot-stuffing. `None` when
/// the client went away.
async fn read_data<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ClientSession<S>,
    max_size: usize,
) -> Result<Option<Body>> {
    let mut data = Vec::new();
    let mut too_large = false;
    loop {
        let line = match client.read_line().await? {
            Input::Data(line) => line,
            Input::Refused { .. } => {
                too_large = true;
                continue;
            }
            Input::Closed | Input::Expired => return Ok(None),
        };
        if line == b"." {
            break;
        }
        if too_large {
            continue;
        }
        let line = line.strip_prefix(b".").unwrap_or(&line);
        data.extend_from_slice(line);
        data.extend_from_slice(b"\r\n");
        if data.len() > max_size {
            too_large = true;
            data.clear();
        }
    }
    Ok(Some(if too_large {
        Body::TooLarge
    } else {
        Body::Complete(data)
    }))
}

async fn deliver<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ClientSession<S>,
    backends: &Backends,
    envelope: &Envelope,
    data: &[u8],
) {
    let sender = envelope.from.as_deref().unwrap_or("");
    for recipient in &envelope.recipients {
        let status = backends.delivery.deliver(sender, recipient, data).await;
        info!(
            peer = %client.peer(),
            from = sender,
            rcpt = %recipient.address,
            status = %status,
            size = data.len(),
            "LMTP delivery"
        );
        client.push(recipient_reply(status, &recipient.address));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailstore_common::types::{MailboxPermission, UserId};
    use mailstore_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
    };
    use tokio::task::JoinHandle;

    async fn fixture() -> (Arc<MemoryStore>, Backends, UserId) {
        let (backing, backends) = Backends::memory();
        let store = &backends.store;
        let joe = store.users.create("joe@example.com", "").await.unwrap().id;
        store
            .aliases
            .create("sales@example.com", "joe@example.com")
            .await
            .unwrap();
        (backing, backends, joe)
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        server: JoinHandle<Result<()>>,
    }

    impl Client {
        async fn connect(backends: &Backends) -> Self {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let server = tokio::spawn(handle_connection(
                theirs,
                "test".to_string(),
                backends.clone(),
            ));
            let (reader, writer) = tokio::io::split(ours);
            let mut client = Self {
                reader: BufReader::new(reader),
                writer,
                server,
            };
            assert_eq!(client.line().await, "220 localhost mailstore LMTP ready");
            client
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line.trim_end_matches("\r\n").to_string()
        }

        async fn send(&mut self, data: &str) {
            self.writer.write_all(data.as_bytes()).await.unwrap();
        }

        async fn command(&mut self, command: &str) -> String {
            self.send(&format!("{}\r\n", command)).await;
            self.line().await
        }

        async fn lhlo(&mut self) {
            self.send("LHLO client.example.org\r\n").await;
            loop {
                let line = self.line().await;
                if line.starts_with("250 ") {
                    return;
                }
                assert!(line.starts_with("250-"), "{}", line);
            }
        }
    }

    #[tokio::test]
    async fn test_per_recipient_replies() {
        let (_, backends, joe) = fixture().await;
        let mut client = Client::connect(&backends).await;
        client.lhlo().await;

        assert_eq!(client.command("MAIL FROM:<ann@example.org>").await, "250 2.1.0 OK");
        assert_eq!(client.command("RCPT TO:<joe@example.com>").await, "250 2.1.5 OK");
        assert_eq!(
            client.command("RCPT TO:<nobody@example.com>").await,
            "550 5.1.1 Bad destination mailbox address <nobody@example.com>"
        );
        assert_eq!(client.command("RCPT TO:<sales@example.com>").await, "250 2.1.5 OK");
        assert_eq!(
            client.command("DATA").await,
            "354 Start mail input; end with <CRLF>.<CRLF>"
        );
        client.send("Subject: hi\r\n\r\n..dot\r\nbody\r\n.\r\n").await;
        assert_eq!(client.line().await, "250 2.0.0 Delivered <joe@example.com>");
        assert_eq!(client.line().await, "250 2.0.0 Delivered <sales@example.com>");
        assert_eq!(client.command("QUIT").await, "221 2.0.0 Bye");
        client.server.await.unwrap().unwrap();

        let store = &backends.store;
        let inbox = store.mailboxes.find_by_name(joe, "INBOX").await.unwrap().unwrap();
        let messages = store.messages.list(inbox.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        let raw = store
            .messages
            .fetch_raw(inbox.id, messages[0].uid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, b"Subject: hi\r\n\r\n.dot\r\nbody\r\n".to_vec());
    }

    #[tokio::test]
    async fn test_detail_mailbox_delivery() {
        let (_, backends, joe) = fixture().await;
        let store = &backends.store;
        let work = store
            .mailboxes
            .create(joe, "work", MailboxPermission::ReadWrite)
            .await
            .unwrap();
        let mut client = Client::connect(&backends).await;
        client.lhlo().await;

        client.command("MAIL FROM:<>").await;
        assert_eq!(client.command("RCPT TO:<joe+work@example.com>").await, "250 2.1.5 OK");
        client.command("DATA").await;
        client.send("Subject: filed\r\n\r\nx\r\n.\r\n").await;
        assert_eq!(client.line().await, "250 2.0.0 Delivered <joe+work@example.com>");

        assert_eq!(store.messages.list(work.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_command_sequence_errors() {
        let (_, backends, _) = fixture().await;
        let mut client = Client::connect(&backends).await;

        assert_eq!(
            client.command("MAIL FROM:<a@example.org>").await,
            "503 5.5.1 Bad sequence of commands"
        );
        assert_eq!(client.command("HELO x").await, "500 5.5.1 Use LHLO");
        client.lhlo().await;
        client.command("MAIL FROM:<a@example.org>").await;
        assert_eq!(client.command("DATA").await, "503 5.5.1 No valid recipients");
        assert_eq!(client.command("RSET").await, "250 2.0.0 OK");
        assert_eq!(
            client.command("RCPT TO:<joe@example.com>").await,
            "503 5.5.1 Bad sequence of commands"
        );
        assert_eq!(client.command("VRFY joe@example.com").await, "252 2.1.5 <joe@example.com>");
    }

    #[tokio::test]
    async fn test_oversized_message() {
        let (_, mut backends, joe) = fixture().await;
        let mut config = (*backends.config).clone();
        config.lmtp.max_literal_size = 16;
        backends.config = Arc::new(config);

        let mut client = Client::connect(&backends).await;
        client.send("LHLO x\r\n").await;
        let mut last = client.line().await;
        while !last.starts_with("250 ") {
            last = client.line().await;
        }
        assert_eq!(last, "250 SIZE 16");

        assert_eq!(
            client.command("MAIL FROM:<a@example.org> SIZE=100").await,
            "552 5.3.4 Message size exceeds fixed limit"
        );
        client.command("MAIL FROM:<a@example.org>").await;
        client.command("RCPT TO:<joe@example.com>").await;
        client.command("DATA").await;
        client
            .send("Subject: this header alone is too long\r\n\r\nbody\r\n.\r\n")
            .await;
        assert_eq!(
            client.line().await,
            "550 5.3.4 Message too big for system <joe@example.com>"
        );
        assert!(backends
            .store
            .mailboxes
            .find_by_name(joe, "INBOX")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_storage_outage_is_temporary() {
        let (backing, backends, _) = fixture().await;
        let mut client = Client::connect(&backends).await;
        client.lhlo().await;
        client.command("MAIL FROM:<a@example.org>").await;

        backing.set_offline(true);
        assert_eq!(
            client.command("RCPT TO:<joe@example.com>").await,
            "451 4.3.0 Temporary lookup failure"
        );
    }
}
