//! POP3 Command definitions
//!
//! Defines the POP3 commands supported by this server.

use crate::session::ClientState;

/// POP3 Command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Command {
    // Authorization state commands
    /// USER username - Identify user
    User { username: String },
    /// PASS password - Provide password
    Pass { password: String },

    // Transaction state commands
    /// STAT - Get mailbox status
    Stat,
    /// LIST [msg] - List messages
    List { msg: Option<u32> },
    /// RETR msg - Retrieve message
    Retr { msg: u32 },
    /// DELE msg - Mark message for deletion
    Dele { msg: u32 },
    /// NOOP - No operation
    Noop,
    /// RSET - Reset (unmark all deletions)
    Rset,
    /// TOP msg n - Get message headers and first n lines
    Top { msg: u32, lines: u32 },
    /// UIDL [msg] - Get unique ID listing
    Uidl { msg: Option<u32> },

    // Any state commands
    /// QUIT - End session
    Quit,
    /// CAPA - Get server capabilities
    Capa,
}

impl Pop3Command {
    /// State a command may run in
    pub fn requires(&self) -> ClientState {
        match self {
            Pop3Command::User { .. } | Pop3Command::Pass { .. } => ClientState::NonAuthenticated,
            Pop3Command::Quit | Pop3Command::Capa => ClientState::Any,
            _ => ClientState::Authenticated,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Pop3Command::User { .. } => "USER",
            Pop3Command::Pass { .. } => "PASS",
            Pop3Command::Stat => "STAT",
            Pop3Command::List { .. } => "LIST",
            Pop3Command::Retr { .. } => "RETR",
            Pop3Command::Dele { .. } => "DELE",
            Pop3Command::Noop => "NOOP",
            Pop3Command::Rset => "RSET",
            Pop3Command::Top { .. } => "TOP",
            Pop3Command::Uidl { .. } => "UIDL",
            Pop3Command::Quit => "QUIT",
            Pop3Command::Capa => "CAPA",
        }
    }
}

/// POP3 Command Parser
pub struct Pop3Parser;

impl Pop3Parser {
    /// Parse a POP3 command line. The error is the text of the `-ERR`
    /// answer.
    pub fn parse(line: &str) -> Result<Pop3Command, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (cmd, args) = match line.split_once(' ') {
            Some((cmd, args)) => (cmd.to_ascii_uppercase(), args),
            None => (line.to_ascii_uppercase(), ""),
        };
        if cmd.is_empty() {
            return Err("empty command".to_string());
        }

        let number = |what: &str, s: &str| -> Result<u32, String> {
            s.trim()
                .parse()
                .map_err(|_| format!("invalid {} '{}'", what, s.trim()))
        };
        let optional = |s: &str| -> Result<Option<u32>, String> {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                number("message number", s).map(Some)
            }
        };

        let command = match cmd.as_str() {
            "USER" if !args.trim().is_empty() => Pop3Command::User {
                username: args.trim().to_string(),
            },
            // passwords may contain spaces
            "PASS" if !args.is_empty() => Pop3Command::Pass {
                password: args.to_string(),
            },
            "USER" | "PASS" => return Err(format!("{} needs an argument", cmd)),
            "STAT" => Pop3Command::Stat,
            "LIST" => Pop3Command::List {
                msg: optional(args)?,
            },
            "RETR" => Pop3Command::Retr {
                msg: number("message number", args)?,
            },
            "DELE" => Pop3Command::Dele {
                msg: number("message number", args)?,
            },
            "NOOP" => Pop3Command::Noop,
            "RSET" => Pop3Command::Rset,
            "TOP" => {
                let mut parts = args.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some(msg), Some(lines)) => Pop3Command::Top {
                        msg: number("message number", msg)?,
                        lines: number("line count", lines)?,
                    },
                    _ => return Err("TOP needs a message number and a line count".to_string()),
                }
            }
            "UIDL" => Pop3Command::Uidl {
                msg: optional(args)?,
            },
            "QUIT" => Pop3Command::Quit,
            "CAPA" => Pop3Command::Capa,
            other => return Err(format!("unknown command {}", other)),
        };
        Ok(command)
    }
}
