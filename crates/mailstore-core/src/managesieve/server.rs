//! ManageSieve Server
//!
//! Lets users upload, list, activate and delete the Sieve scripts the
//! `sieve` sort driver runs at delivery. Scripts are checked by the
//! configured sort driver before they are stored. Only SASL PLAIN is
//! offered and STARTTLS is refused.

use super::command::{SieveCommand, SieveParser};
use super::response::SieveResponse;
use crate::auth::decode_plain;
use crate::backend::Backends;
use crate::listener;
use crate::session::{literal_suffix, ClientSession, ClientState, Input, SessionLimits};
use mailstore_common::config::ServiceConfig;
use mailstore_common::types::UserId;
use mailstore_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// ManageSieve Server
pub struct ManageSieveServer {
    config: ServiceConfig,
    backends: Backends,
}

impl ManageSieveServer {
    pub fn new(backends: Backends) -> Self {
        Self {
            config: backends.config.managesieve.clone(),
            backends,
        }
    }

    /// Serve clients until `shutdown` fires
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let backends = self.backends.clone();
        listener::serve(
            "managesieve",
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

/// Handle a single ManageSieve connection
pub async fn handle_connection<S>(stream: S, peer: String, backends: Backends) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limits = SessionLimits::from(&backends.config.managesieve);
    let mut client = ClientSession::new(stream, limits, peer);
    let mut user: Option<UserId> = None;
    info!(peer = %client.peer(), "New ManageSieve connection");

    if let Err(e) = backends.store.health_check().await {
        error!(peer = %client.peer(), error = %e, "Storage unavailable, turning client away");
        client.push(SieveResponse::bye("Mail storage is unavailable."));
        client.close().await;
        return Ok(());
    }
    client.push(capabilities(&backends));
    client.set_state(ClientState::NonAuthenticated);
    client.flush().await?;

    while !client.state().is_terminal() {
        let request = match read_command(&mut client).await? {
            Input::Data(request) => request,
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
                client.push(SieveResponse::bye("Connection timed out."));
                break;
            }
        };
        if request.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match SieveParser::parse(&request) {
            Ok(command) => process(&mut client, &mut user, &backends, command).await?,
            Err(message) => refuse(&mut client, &message),
        }
        client.flush().await?;
    }

    client.close().await;
    info!(peer = %client.peer(), state = ?client.state(), "ManageSieve connection closed");
    Ok(())
}

fn capabilities(backends: &Backends) -> String {
    let banner = &backends.config.server.banner;
    let implementation = if banner.is_empty() {
        format!("mailstore {}", env!("CARGO_PKG_VERSION"))
    } else {
        banner.clone()
    };
    SieveResponse::capabilities(&implementation, backends.sort.extensions())
}

/// Read a command line and the literals it announces. ManageSieve has no
/// continuation requests, so `{n}` is read the same way as `{n+}`.
async fn read_command<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ClientSession<S>,
) -> Result<Input> {
    let mut request = Vec::new();
    loop {
        let line = match client.read_line().await? {
            Input::Data(line) => line,
            Input::Refused { reason, .. } => return Ok(Input::Refused { request, reason }),
            other => return Ok(other),
        };
        request.extend_from_slice(&line);

        let Some((size, _)) = literal_suffix(&line) else {
            return Ok(Input::Data(request));
        };
        if size > client.limits().max_literal_size {
            client.discard(size).await?;
            return Ok(Input::Refused {
                request,
                reason: "Literal is too large.".to_string(),
            });
        }
        match client.read_exact(size).await? {
            Input::Data(literal) => {
                request.extend_from_slice(b"\r\n");
                request.extend_from_slice(&literal);
            }
            other => return Ok(other),
        }
    }
}

/// Answer NO and count the error
fn refuse<S: AsyncRead + AsyncWrite + Unpin>(client: &mut ClientSession<S>, message: &str) {
    client.push(SieveResponse::no(message));
    if client.bad() {
        warn!(peer = %client.peer(), errors = client.errors(), "Too many errors");
        client.push(SieveResponse::bye("Too many errors, closing connection."));
        client.set_state(ClientState::Error);
    }
}

async fn process<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut ClientSession<S>,
    user: &mut Option<UserId>,
    backends: &Backends,
    command: SieveCommand,
) -> Result<()> {
    if !client.state().allows(command.requires()) {
        if command.requires() == ClientState::Authenticated {
            client.push(SieveResponse::no("Please authenticate first."));
        } else {
            client.push(SieveResponse::no("Already authenticated."));
        }
        return Ok(());
    }
    debug!(peer = %client.peer(), command = command.name(), "Command");

    let max_script = client.limits().max_literal_size;
    let mut out = Vec::new();
    match execute(&mut out, user, backends, command, max_script).await {
        Ok(Next::Continue) => client.push(&out),
        Ok(Next::Authenticated) => {
            client.push(&out);
            client.set_state(ClientState::Authenticated);
        }
        Ok(Next::Logout) => {
            client.push(&out);
            client.set_state(ClientState::Logout);
        }
        Err(Error::Auth(message))
        | Err(Error::Validation(message))
        | Err(Error::NotFound(message)) => refuse(client, &message),
        Err(e) if e.is_transient() => {
            error!(peer = %client.peer(), error = %e, "Storage failure");
            client.push(SieveResponse::no("Mail storage is temporarily unavailable."));
            if let Err(e) = backends.store.health_check().await {
                error!(peer = %client.peer(), error = %e, "Storage health check failed");
                client.set_state(ClientState::Error);
            }
        }
        Err(e) => {
            error!(peer = %client.peer(), error = %e, "Command failed");
            client.push(SieveResponse::no("Internal error."));
        }
    }
    Ok(())
}

/// What the connection loop does after a command
enum Next {
    Continue,
    Authenticated,
    Logout,
}

fn script_name(name: String) -> Result<String> {
    if name.is_empty() {
        return Err(Error::Validation("Script name required.".to_string()));
    }
    Ok(name)
}

async fn execute(
    out: &mut Vec<u8>,
    user: &mut Option<UserId>,
    backends: &Backends,
    command: SieveCommand,
    max_script: usize,
) -> Result<Next> {
    let scripts = &backends.store.scripts;
    let session_user = *user;
    let owner = || session_user.ok_or_else(|| Error::Internal("session has no user".to_string()));

    match command {
        SieveCommand::Logout => {
            out.extend_from_slice(SieveResponse::ok_with("Bye.").as_bytes());
            return Ok(Next::Logout);
        }

        SieveCommand::StartTls => out.extend_from_slice(b"NO\r\n"),

        SieveCommand::Capability => out.extend_from_slice(capabilities(backends).as_bytes()),

        SieveCommand::Authenticate { mechanism, initial } => {
            if !mechanism.eq_ignore_ascii_case("PLAIN") {
                return Err(Error::Validation(
                    "Authentication scheme not supported.".to_string(),
                ));
            }
            let initial =
                initial.ok_or_else(|| Error::Validation("Missing argument.".to_string()))?;
            let (username, password) = decode_plain(&initial)
                .ok_or_else(|| Error::Validation("SASL decode error.".to_string()))?;
            let user_id = match backends.auth.validate(&username, &password).await? {
                Some(user_id) => user_id,
                None => {
                    info!(user = %username, "ManageSieve login failed");
                    return Err(Error::Auth("Username or password incorrect.".to_string()));
                }
            };

            info!(user = %username, user_id, "ManageSieve login");
            *user = Some(user_id);
            out.extend_from_slice(SieveResponse::ok().as_bytes());
            return Ok(Next::Authenticated);
        }

        SieveCommand::ListScripts => {
            let list = scripts.list(owner()?).await?;
            if list.is_empty() {
                out.extend_from_slice(SieveResponse::ok_with("No scripts found.").as_bytes());
            } else {
                for script in &list {
                    out.extend_from_slice(
                        SieveResponse::listing(&script.name, script.active).as_bytes(),
                    );
                }
                out.extend_from_slice(SieveResponse::ok().as_bytes());
            }
        }

        SieveCommand::PutScript { name, script } => {
            let owner = owner()?;
            let name = script_name(name)?;
            if script.len() > max_script {
                out.extend_from_slice(
                    SieveResponse::no_code("QUOTA", "Script exceeds available space.").as_bytes(),
                );
                return Ok(Next::Continue);
            }
            match backends.sort.validate(owner, &script).await {
                Ok(()) => {}
                Err(Error::Validation(message)) | Err(Error::InvalidQuery(message)) => {
                    return Err(Error::Validation(format!("Script error: {}.", message)));
                }
                Err(e) => return Err(e),
            }

            // replacing a script keeps its activation
            let active = scripts
                .get(owner, &name)
                .await?
                .map_or(false, |existing| existing.active);
            scripts.put(owner, &name, &script, active).await?;
            info!(user_id = owner, script = %name, size = script.len(), active, "Sieve script stored");
            out.extend_from_slice(
                SieveResponse::ok_with("Script successfully received.").as_bytes(),
            );
        }

        SieveCommand::SetActive { name } => {
            let owner = owner()?;
            if name.is_empty() {
                if scripts.active(owner).await?.is_none() {
                    out.extend_from_slice(
                        SieveResponse::ok_with("No scripts are active at this time.").as_bytes(),
                    );
                } else {
                    scripts.set_active(owner, None).await?;
                    info!(user_id = owner, "Sieve scripts deactivated");
                    out.extend_from_slice(
                        SieveResponse::ok_with("All scripts deactivated.").as_bytes(),
                    );
                }
            } else {
                scripts
                    .set_active(owner, Some(&name))
                    .await
                    .map_err(|e| match e {
                        Error::NotFound(_) => Error::NotFound("Script does not exist.".to_string()),
                        e => e,
                    })?;
                info!(user_id = owner, script = %name, "Sieve script activated");
                out.extend_from_slice(SieveResponse::ok_with("Script activated.").as_bytes());
            }
        }

        SieveCommand::GetScript { name } => {
            let name = script_name(name)?;
            let script = scripts
                .get(owner()?, &name)
                .await?
                .ok_or_else(|| Error::NotFound("Script not found.".to_string()))?;
            SieveResponse::script(out, &script.script);
        }

        SieveCommand::DeleteScript { name } => {
            let owner = owner()?;
            let name = script_name(name)?;
            scripts.delete(owner, &name).await.map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound("Script not found.".to_string()),
                e => e,
            })?;
            info!(user_id = owner, script = %name, "Sieve script deleted");
            out.extend_from_slice(SieveResponse::ok_with("Script deleted.").as_bytes());
        }

        SieveCommand::HaveSpace { size, .. } => {
            if size > max_script as u64 {
                out.extend_from_slice(
                    SieveResponse::no_code("QUOTA", "Quota exceeded").as_bytes(),
                );
            } else {
                out.extend_from_slice(SieveResponse::ok().as_bytes());
            }
        }
    }
    Ok(Next::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::{Algorithm, Argon2, Params, Version};
    use mailstore_common::Config;
    use mailstore_storage::{MemoryStore, Store};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
    };
    use tokio::task::JoinHandle;

    /// base64 of "\0joe\0secret"
    const JOE_PLAIN: &str = "AGpvZQBzZWNyZXQ=";

    fn test_hash(password: &str) -> String {
        let params = Params::new(1024, 1, 1, None).unwrap();
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::encode_b64(b"mailstore-test-salt").unwrap();
        argon
            .hash_password(password.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    async fn fixture() -> (Arc<MemoryStore>, Backends, UserId) {
        let backing = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.database.backend = "memory".to_string();
        config.sort.driver = "sieve".to_string();
        let backends = Backends::with_store(config, Store::memory(backing.clone())).unwrap();
        let joe = backends
            .store
            .users
            .create("joe", &test_hash("secret"))
            .await
            .unwrap()
            .id;
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
            assert_eq!(client.capabilities().await.last().unwrap(), "OK");
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

        /// Lines up to and including the final OK
        async fn capabilities(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let line = self.line().await;
                let done = line == "OK";
                lines.push(line);
                if done {
                    return lines;
                }
            }
        }

        async fn login(&mut self) {
            let answer = self
                .command(&format!("AUTHENTICATE \"PLAIN\" \"{}\"", JOE_PLAIN))
                .await;
            assert_eq!(answer, "OK");
        }

        async fn put(&mut self, name: &str, script: &str) -> String {
            self.send(&format!(
                "PUTSCRIPT \"{}\" {{{}+}}\r\n{}\r\n",
                name,
                script.len(),
                script
            ))
            .await;
            self.line().await
        }
    }

    #[tokio::test]
    async fn test_greeting_and_login() {
        let (_, backends, _) = fixture().await;
        let mut client = Client::connect(&backends).await;

        client.send("CAPABILITY\r\n").await;
        let lines = client.capabilities().await;
        assert!(lines[0].starts_with("\"IMPLEMENTATION\" \"mailstore"), "{}", lines[0]);
        assert_eq!(
            lines[1..].to_vec(),
            vec!["\"SASL\" \"PLAIN\"", "\"SIEVE\" \"fileinto reject\"", "OK"]
        );

        assert_eq!(
            client.command("LISTSCRIPTS").await,
            "NO \"Please authenticate first.\""
        );
        assert_eq!(client.command("STARTTLS").await, "NO");
        assert_eq!(
            client.command("AUTHENTICATE \"PLAIN\" \"AGpvZQB3cm9uZw==\"").await,
            "NO \"Username or password incorrect.\""
        );
        assert_eq!(
            client.command("AUTHENTICATE \"DIGEST-MD5\" \"x\"").await,
            "NO \"Authentication scheme not supported.\""
        );

        client
            .send(&format!(
                "AUTHENTICATE \"PLAIN\" {{{}+}}\r\n{}\r\n",
                JOE_PLAIN.len(),
                JOE_PLAIN
            ))
            .await;
        assert_eq!(client.line().await, "OK");
        assert_eq!(
            client.command(&format!("AUTHENTICATE \"PLAIN\" \"{}\"", JOE_PLAIN)).await,
            "NO \"Already authenticated.\""
        );

        assert_eq!(client.command("LOGOUT").await, "OK \"Bye.\"");
        client.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_script_lifecycle() {
        let (_, backends, joe) = fixture().await;
        let mut client = Client::connect(&backends).await;
        client.login().await;

        assert_eq!(client.command("LISTSCRIPTS").await, "OK \"No scripts found.\"");
        assert_eq!(
            client.put("work", "require \"fileinto\";\r\nfileinto \"Work\";").await,
            "OK \"Script successfully received.\""
        );
        assert_eq!(
            client.put("home", "keep;").await,
            "OK \"Script successfully received.\""
        );
        assert_eq!(
            client.command("SETACTIVE \"work\"").await,
            "OK \"Script activated.\""
        );

        assert_eq!(client.command("LISTSCRIPTS").await, "\"home\"");
        assert_eq!(client.line().await, "\"work\" ACTIVE");
        assert_eq!(client.line().await, "OK");

        // replacing the active script keeps it active
        assert_eq!(
            client.put("work", "discard;").await,
            "OK \"Script successfully received.\""
        );
        let active = backends.store.scripts.active(joe).await.unwrap().unwrap();
        assert_eq!(active.name, "work");
        assert_eq!(active.script, "discard;");

        assert_eq!(client.command("GETSCRIPT \"work\"").await, "{8}");
        assert_eq!(client.line().await, "discard;");
        assert_eq!(client.line().await, "OK");
        assert_eq!(
            client.command("GETSCRIPT \"nope\"").await,
            "NO \"Script not found.\""
        );

        assert_eq!(
            client.command("SETACTIVE \"nope\"").await,
            "NO \"Script does not exist.\""
        );
        assert_eq!(
            client.command("SETACTIVE \"\"").await,
            "OK \"All scripts deactivated.\""
        );
        assert!(backends.store.scripts.active(joe).await.unwrap().is_none());
        assert_eq!(
            client.command("SETACTIVE \"\"").await,
            "OK \"No scripts are active at this time.\""
        );

        assert_eq!(
            client.command("DELETESCRIPT \"home\"").await,
            "OK \"Script deleted.\""
        );
        assert_eq!(client.command("LISTSCRIPTS").await, "\"work\"");
        assert_eq!(client.line().await, "OK");
        assert_eq!(client.command("HAVESPACE \"x\" 100").await, "OK");
        assert_eq!(
            client.command("HAVESPACE \"x\" 999999999").await,
            "NO (QUOTA) \"Quota exceeded\""
        );
    }

    #[tokio::test]
    async fn test_invalid_script_is_not_stored() {
        let (_, backends, joe) = fixture().await;
        let mut client = Client::connect(&backends).await;
        client.login().await;

        let answer = client.put("broken", "bogus;").await;
        assert!(answer.starts_with("NO \"Script error: "), "{}", answer);
        assert!(backends.store.scripts.list(joe).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_too_many_errors() {
        let (_, backends, _) = fixture().await;
        let mut client = Client::connect(&backends).await;

        for _ in 0..3 {
            assert_eq!(
                client.command("FROB").await,
                "NO \"What are you trying to say here?\""
            );
        }
        assert_eq!(
            client.command("GETSCRIPT").await,
            "NO \"This command requires an argument.\""
        );
        assert_eq!(
            client.line().await,
            "BYE \"Too many errors, closing connection.\""
        );
        client.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_storage_down_at_connect() {
        let (backing, backends, _) = fixture().await;
        backing.set_offline(true);

        let (ours, theirs) = tokio::io::duplex(4096);
        let server = tokio::spawn(handle_connection(theirs, "test".to_string(), backends));
        let mut reader = BufReader::new(ours);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "BYE \"Mail storage is unavailable.\"\r\n");
        server.await.unwrap().unwrap();
    }
}
