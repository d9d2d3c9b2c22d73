//! Client session plumbing shared by the protocol servers
//!
//! A [`ClientSession`] owns the connection of one client: its protocol
//! state, the idle deadline, request framing and the outbound buffer.
//! Protocol servers read requests through it, queue their responses with
//! [`ClientSession::push`] and drain them with [`ClientSession::flush`].

use mailstore_common::config::ServiceConfig;
use mailstore_common::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

/// Longest command line accepted, CRLF included
pub const MAX_LINE: usize = 64 * 1024;

/// Protocol errors tolerated before the session is dropped
pub const MAX_ERRORS: u32 = 3;

/// Consecutive writes without progress before the connection is torn down
const MAX_STALLS: u32 = 5;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    InitialConnect,
    NonAuthenticated,
    Authenticated,
    Selected,
    Logout,
    Quit,
    Error,
    /// Idle expiry; pending output is flushed, then the session ends
    QuitQueued,
    /// Matches every live state in command requirements
    Any,
}

impl ClientState {
    pub fn is_authenticated(self) -> bool {
        matches!(self, ClientState::Authenticated | ClientState::Selected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClientState::Logout | ClientState::Quit | ClientState::Error | ClientState::QuitQueued
        )
    }

    /// Whether a command that requires `required` may run in this state.
    /// `Authenticated` is also satisfied by `Selected`.
    pub fn allows(self, required: ClientState) -> bool {
        match required {
            ClientState::Any => !self.is_terminal(),
            ClientState::Authenticated => self.is_authenticated(),
            other => self == other,
        }
    }
}

/// Time and size limits of one listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub login_timeout: Duration,
    pub timeout: Duration,
    pub max_literal_size: usize,
}

impl From<&ServiceConfig> for SessionLimits {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            login_timeout: Duration::from_secs(config.login_timeout_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            max_literal_size: config.max_literal_size,
        }
    }
}

/// Result of reading from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A line without its line ending, or a full request with literals
    Data(Vec<u8>),
    /// Oversized line or literal. Carries what was read of the request so
    /// the caller can still answer with its tag.
    Refused { request: Vec<u8>, reason: String },
    /// The client closed the connection
    Closed,
    /// The idle deadline passed
    Expired,
}

/// One client connection
pub struct ClientSession<S> {
    stream: BufReader<S>,
    outbound: Vec<u8>,
    state: ClientState,
    errors: u32,
    limits: SessionLimits,
    deadline: Instant,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSession<S> {
    pub fn new(stream: S, limits: SessionLimits, peer: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            outbound: Vec::new(),
            state: ClientState::InitialConnect,
            errors: 0,
            limits,
            deadline: Instant::now() + limits.login_timeout,
            peer: peer.into(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn set_state(&mut self, state: ClientState) {
        if state != self.state {
            debug!(peer = %self.peer, from = ?self.state, to = ?state, "Session state");
        }
        self.state = state;
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Idle timeout of the current state
    pub fn idle_timeout(&self) -> Duration {
        if self.state.is_authenticated() {
            self.limits.timeout
        } else {
            self.limits.login_timeout
        }
    }

    pub fn reset_deadline(&mut self) {
        self.deadline = Instant::now() + self.idle_timeout();
    }

    /// Count a protocol error. Returns true once the limit is exceeded.
    pub fn bad(&mut self) -> bool {
        self.errors += 1;
        self.errors > MAX_ERRORS
    }

    /// A well-formed command clears the error count
    pub fn good(&mut self) {
        self.errors = 0;
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Queue output for the next flush
    pub fn push(&mut self, data: impl AsRef<[u8]>) {
        self.outbound.extend_from_slice(data.as_ref());
    }

    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Drain the outbound buffer. Every attempt has its own write timeout;
    /// an attempt that writes nothing is a stall, and too many stalls in a
    /// row end the connection.
    pub async fn flush(&mut self) -> Result<()> {
        let mut stalls = 0;
        while !self.outbound.is_empty() {
            match timeout(WRITE_TIMEOUT, self.stream.get_mut().write(&self.outbound)).await {
                Ok(Ok(n)) if n > 0 => {
                    self.outbound.drain(..n);
                    stalls = 0;
                }
                Ok(Err(e)) => return Err(Error::Internal(format!("write to {}: {}", self.peer, e))),
                Ok(Ok(_)) | Err(_) => {
                    stalls += 1;
                    warn!(peer = %self.peer, stalls, "Output stalled");
                    if stalls >= MAX_STALLS {
                        self.outbound.clear();
                        self.set_state(ClientState::Error);
                        return Err(Error::Internal(format!("output to {} stalled", self.peer)));
                    }
                }
            }
        }
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| Error::Internal(format!("flush to {}: {}", self.peer, e)))?;
        self.reset_deadline();
        Ok(())
    }

    /// Read one line, without its line ending
    pub async fn read_line(&mut self) -> Result<Input> {
        match timeout_at(self.deadline, read_bounded_line(&mut self.stream)).await {
            Err(_) => {
                self.expire();
                Ok(Input::Expired)
            }
            Ok(Err(e)) => Err(Error::Internal(format!("read from {}: {}", self.peer, e))),
            Ok(Ok(None)) => Ok(Input::Closed),
            Ok(Ok(Some(Line::Complete(line)))) => Ok(Input::Data(line)),
            Ok(Ok(Some(Line::TooLong))) => Ok(Input::Refused {
                request: Vec::new(),
                reason: "line too long".to_string(),
            }),
        }
    }

    /// Read exactly `size` bytes
    pub async fn read_exact(&mut self, size: usize) -> Result<Input> {
        let mut buf = vec![0u8; size];
        match timeout_at(self.deadline, self.stream.read_exact(&mut buf)).await {
            Err(_) => {
                self.expire();
                Ok(Input::Expired)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(Input::Closed),
            Ok(Err(e)) => Err(Error::Internal(format!("read from {}: {}", self.peer, e))),
            Ok(Ok(_)) => Ok(Input::Data(buf)),
        }
    }

    /// Read a command line together with any literals it announces.
    ///
    /// A line ending in `{n}` gets a continuation request before the `n`
    /// bytes are read; `{n+}` is read without one. The literal is kept in
    /// wire form (`{n}` CRLF bytes) so the command parser sees it inline.
    pub async fn read_request(&mut self) -> Result<Input> {
        let mut request = Vec::new();
        loop {
            let line = match self.read_line().await? {
                Input::Data(line) => line,
                Input::Refused { reason, .. } => {
                    return Ok(Input::Refused { request, reason });
                }
                other => return Ok(other),
            };
            request.extend_from_slice(&line);

            let Some((size, synchronizing)) = literal_suffix(&line) else {
                return Ok(Input::Data(request));
            };

            if size > self.limits.max_literal_size {
                if !synchronizing {
                    self.discard(size).await?;
                }
                return Ok(Input::Refused {
                    request,
                    reason: format!("literal of {} octets is too large", size),
                });
            }

            if synchronizing {
                self.push("+ OK\r\n");
                self.flush().await?;
            }

            match self.read_exact(size).await? {
                Input::Data(literal) => {
                    request.extend_from_slice(b"\r\n");
                    request.extend_from_slice(&literal);
                }
                other => return Ok(other),
            }
        }
    }

    /// Skip `size` bytes of input
    pub async fn discard(&mut self, size: usize) -> Result<()> {
        let mut sink = tokio::io::sink();
        let mut limited = (&mut self.stream).take(size as u64);
        timeout_at(self.deadline, tokio::io::copy(&mut limited, &mut sink))
            .await
            .map_err(|_| Error::Internal(format!("read from {} timed out", self.peer)))?
            .map_err(|e| Error::Internal(format!("read from {}: {}", self.peer, e)))?;
        Ok(())
    }

    fn expire(&mut self) {
        debug!(peer = %self.peer, state = ?self.state, "Idle timeout");
        self.set_state(ClientState::QuitQueued);
    }

    /// Flush what is left and shut the connection down
    pub async fn close(&mut self) {
        if let Err(e) = self.flush().await {
            debug!(peer = %self.peer, error = %e, "Discarding output on close");
        }
        let _ = self.stream.get_mut().shutdown().await;
    }
}

enum Line {
    Complete(Vec<u8>),
    TooLong,
}

async fn read_bounded_line<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> std::io::Result<Option<Line>> {
    let mut line = Vec::new();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if line.is_empty() && !overflow {
                None
            } else if overflow {
                Some(Line::TooLong)
            } else {
                Some(Line::Complete(trim_eol(line)))
            });
        }

        let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..=pos], true),
            None => (available, false),
        };
        let used = chunk.len();
        if !overflow {
            if line.len() + used > MAX_LINE {
                overflow = true;
                line.clear();
            } else {
                line.extend_from_slice(chunk);
            }
        }
        reader.consume(used);

        if done {
            return Ok(Some(if overflow {
                Line::TooLong
            } else {
                Line::Complete(trim_eol(line))
            }));
        }
    }
}

fn trim_eol(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

/// Size and synchronizing mode of a literal announced at the end of a line
pub fn literal_suffix(line: &[u8]) -> Option<(usize, bool)> {
    let inner = line.strip_suffix(b"}")?;
    let open = inner.iter().rposition(|b| *b == b'{')?;
    let spec = &inner[open + 1..];
    let (digits, synchronizing) = match spec.strip_suffix(b"+") {
        Some(digits) => (digits, false),
        None => (spec, true),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let size = std::str::from_utf8(digits).ok()?.parse().ok()?;
    Some((size, synchronizing))
}
