//! ManageSieve command definitions
//!
//! A request is the command line with any `{n+}` literal inlined in wire
//! form, the way [`super::server`] reads it off the connection.

use crate::session::ClientState;

/// ManageSieve command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SieveCommand {
    Logout,
    StartTls,
    Capability,
    ListScripts,
    /// AUTHENTICATE "mechanism" ["initial response"]
    Authenticate {
        mechanism: String,
        initial: Option<String>,
    },
    PutScript { name: String, script: String },
    /// An empty name deactivates every script
    SetActive { name: String },
    GetScript { name: String },
    DeleteScript { name: String },
    HaveSpace { name: String, size: u64 },
}

impl SieveCommand {
    /// State a command may run in
    pub fn requires(&self) -> ClientState {
        match self {
            SieveCommand::Logout | SieveCommand::StartTls | SieveCommand::Capability => {
                ClientState::Any
            }
            SieveCommand::Authenticate { .. } => ClientState::NonAuthenticated,
            _ => ClientState::Authenticated,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SieveCommand::Logout => "LOGOUT",
            SieveCommand::StartTls => "STARTTLS",
            SieveCommand::Capability => "CAPABILITY",
            SieveCommand::ListScripts => "LISTSCRIPTS",
            SieveCommand::Authenticate { .. } => "AUTHENTICATE",
            SieveCommand::PutScript { .. } => "PUTSCRIPT",
            SieveCommand::SetActive { .. } => "SETACTIVE",
            SieveCommand::GetScript { .. } => "GETSCRIPT",
            SieveCommand::DeleteScript { .. } => "DELETESCRIPT",
            SieveCommand::HaveSpace { .. } => "HAVESPACE",
        }
    }
}

/// ManageSieve command parser
pub struct SieveParser;

impl SieveParser {
    /// Parse one request. The error is the text of the `NO` answer.
    pub fn parse(request: &[u8]) -> Result<SieveCommand, String> {
        let split = request
            .iter()
            .position(|b| *b == b' ' || *b == b'\r')
            .unwrap_or(request.len());
        let cmd = String::from_utf8_lossy(&request[..split]).to_ascii_uppercase();
        let mut args = arguments(&request[split..])?.into_iter();

        let bare = matches!(
            cmd.as_str(),
            "LOGOUT" | "STARTTLS" | "CAPABILITY" | "LISTSCRIPTS"
        );
        let known = bare
            || matches!(
                cmd.as_str(),
                "AUTHENTICATE" | "PUTSCRIPT" | "SETACTIVE" | "GETSCRIPT" | "DELETESCRIPT"
                    | "HAVESPACE"
            );
        if !known {
            return Err("What are you trying to say here?".to_string());
        }
        if !bare && args.len() == 0 {
            return Err("This command requires an argument.".to_string());
        }

        let command = match cmd.as_str() {
            "LOGOUT" => SieveCommand::Logout,
            "STARTTLS" => SieveCommand::StartTls,
            "CAPABILITY" => SieveCommand::Capability,
            "LISTSCRIPTS" => SieveCommand::ListScripts,
            "AUTHENTICATE" => SieveCommand::Authenticate {
                mechanism: text(args.next())?,
                initial: args.next().map(|arg| text(Some(arg))).transpose()?,
            },
            "PUTSCRIPT" => {
                let name = text(args.next())?;
                let script = args
                    .next()
                    .ok_or_else(|| "Script required.".to_string())?;
                SieveCommand::PutScript {
                    name,
                    script: String::from_utf8(script)
                        .map_err(|_| "Script is not valid UTF-8.".to_string())?,
                }
            }
            "SETACTIVE" => SieveCommand::SetActive {
                name: text(args.next())?,
            },
            "GETSCRIPT" => SieveCommand::GetScript {
                name: text(args.next())?,
            },
            "DELETESCRIPT" => SieveCommand::DeleteScript {
                name: text(args.next())?,
            },
            "HAVESPACE" => {
                let name = text(args.next())?;
                let size = text(args.next())?
                    .parse()
                    .map_err(|_| "Invalid script length.".to_string())?;
                SieveCommand::HaveSpace { name, size }
            }
            _ => return Err("What are you trying to say here?".to_string()),
        };
        Ok(command)
    }
}

fn text(arg: Option<Vec<u8>>) -> Result<String, String> {
    let arg = arg.ok_or_else(|| "Missing argument.".to_string())?;
    String::from_utf8(arg).map_err(|_| "Arguments must be UTF-8.".to_string())
}

/// Split the arguments of a request: quoted strings, `{n+}` or `{n}`
/// literals and bare atoms
fn arguments(mut rest: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let mut args = Vec::new();
    loop {
        while let Some((b' ' | b'\r' | b'\n', tail)) = rest.split_first() {
            rest = tail;
        }
        let Some(&first) = rest.first() else {
            return Ok(args);
        };

        match first {
            b'"' => {
                let mut value = Vec::new();
                let mut i = 1;
                loop {
                    match rest.get(i) {
                        None => return Err("Unterminated quoted string.".to_string()),
                        Some(b'\\') => {
                            if let Some(&escaped) = rest.get(i + 1) {
                                value.push(escaped);
                            }
                            i += 2;
                        }
                        Some(b'"') => break,
                        Some(&b) => {
                            value.push(b);
                            i += 1;
                        }
                    }
                }
                args.push(value);
                rest = &rest[i + 1..];
            }
            b'{' => {
                let close = rest
                    .iter()
                    .position(|b| *b == b'}')
                    .ok_or_else(|| "Bad literal.".to_string())?;
                let spec = &rest[1..close];
                let digits = spec.strip_suffix(b"+").unwrap_or(spec);
                let size: usize = std::str::from_utf8(digits)
                    .ok()
                    .and_then(|d| d.parse().ok())
                    .ok_or_else(|| "Bad literal.".to_string())?;
                let body = rest[close + 1..]
                    .strip_prefix(b"\r\n")
                    .ok_or_else(|| "Bad literal.".to_string())?;
                if body.len() < size {
                    return Err("Literal is shorter than announced.".to_string());
                }
                args.push(body[..size].to_vec());
                rest = &body[size..];
            }
            _ => {
                let end = rest
                    .iter()
                    .position(|b| matches!(b, b' ' | b'\r' | b'\n'))
                    .unwrap_or(rest.len());
                args.push(rest[..end].to_vec());
                rest = &rest[end..];
            }
        }
    }
}
