//! IMAP Command Parser
//!
//! Parses IMAP4 requests, literals included, into [`TaggedCommand`]s.

use super::command::{
    FetchItem, ImapCommand, StatusItem, StoreFlags, StoreOperation, TaggedCommand,
};
use super::search::{parse_search, parse_sort_criteria};
use crate::sequence::SequenceSet;

/// One syntactic element of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Atom(String),
    Quoted(String),
    Literal(Vec<u8>),
    List(Vec<Token>),
}

impl Token {
    /// Text of an atom, quoted string or literal
    pub fn text(&self) -> Option<String> {
        match self {
            Token::Atom(s) | Token::Quoted(s) => Some(s.clone()),
            Token::Literal(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Token::List(_) => None,
        }
    }

    pub fn atom(&self) -> Option<&str> {
        match self {
            Token::Atom(s) => Some(s),
            _ => None,
        }
    }

    /// Case-insensitive atom comparison
    pub fn is_atom(&self, name: &str) -> bool {
        self.atom().map(|a| a.eq_ignore_ascii_case(name)).unwrap_or(false)
    }
}

/// Split a request into tokens. Literals are expected in wire form,
/// `{n}` CRLF followed by `n` bytes.
pub fn tokenize(input: &[u8]) -> Result<Vec<Token>, String> {
    let mut stack: Vec<Vec<Token>> = vec![Vec::new()];
    let mut pos = 0;

    while pos < input.len() {
        let token = match input[pos] {
            b' ' => {
                pos += 1;
                continue;
            }
            b'(' => {
                stack.push(Vec::new());
                pos += 1;
                continue;
            }
            b')' => {
                pos += 1;
                let list = stack.pop().unwrap_or_default();
                if stack.is_empty() {
                    return Err("unbalanced parenthesis".to_string());
                }
                Token::List(list)
            }
            b'"' => {
                let (s, next) = quoted(input, pos)?;
                pos = next;
                Token::Quoted(s)
            }
            b'{' => {
                let (bytes, next) = literal(input, pos)?;
                pos = next;
                Token::Literal(bytes)
            }
            _ => {
                let (s, next) = atom(input, pos);
                pos = next;
                Token::Atom(s)
            }
        };
        if let Some(top) = stack.last_mut() {
            top.push(token);
        }
    }

    if stack.len() != 1 {
        return Err("unbalanced parenthesis".to_string());
    }
    Ok(stack.pop().unwrap_or_default())
}

fn quoted(input: &[u8], start: usize) -> Result<(String, usize), String> {
    let mut out = Vec::new();
    let mut pos = start + 1;
    while pos < input.len() {
        match input[pos] {
            b'\\' if pos + 1 < input.len() => {
                out.push(input[pos + 1]);
                pos += 2;
            }
            b'"' => return Ok((String::from_utf8_lossy(&out).into_owned(), pos + 1)),
            b'\r' | b'\n' => break,
            c => {
                out.push(c);
                pos += 1;
            }
        }
    }
    Err("unterminated quoted string".to_string())
}

fn literal(input: &[u8], start: usize) -> Result<(Vec<u8>, usize), String> {
    let close = input[start..]
        .iter()
        .position(|b| *b == b'}')
        .map(|p| start + p)
        .ok_or_else(|| "unterminated literal".to_string())?;
    let spec = &input[start + 1..close];
    let digits = spec.strip_suffix(b"+").unwrap_or(spec);
    let size: usize = std::str::from_utf8(digits)
        .ok()
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|d| d.parse().ok())
        .ok_or_else(|| "invalid literal size".to_string())?;

    let body = close + 1;
    if input.get(body..body + 2) != Some(b"\r\n".as_slice()) {
        return Err("literal must be followed by CRLF".to_string());
    }
    let data = body + 2;
    let bytes = input
        .get(data..data + size)
        .ok_or_else(|| "truncated literal".to_string())?;
    Ok((bytes.to_vec(), data + size))
}

/// Atom characters up to a space or parenthesis; spaces and parentheses
/// inside `[...]` belong to the atom (`BODY[HEADER.FIELDS (FROM)]`).
fn atom(input: &[u8], start: usize) -> (String, usize) {
    let mut depth = 0usize;
    let mut pos = start;
    while pos < input.len() {
        match input[pos] {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b' ' | b'(' | b')' if depth == 0 => break,
            b'\r' | b'\n' => break,
            _ => {}
        }
        pos += 1;
    }
    (String::from_utf8_lossy(&input[start..pos]).into_owned(), pos.max(start + 1))
}

/// A request that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Tag, when one could be read
    pub tag: Option<String>,
    pub message: String,
}

/// Cursor over command arguments
struct Args<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Args<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn rest(&mut self) -> &'a [Token] {
        let tokens = self.tokens;
        let rest = &tokens[self.pos.min(tokens.len())..];
        self.pos = tokens.len();
        rest
    }

    fn astring(&mut self, what: &str) -> Result<String, String> {
        self.next()
            .and_then(Token::text)
            .ok_or_else(|| format!("missing {}", what))
    }

    fn atom(&mut self, what: &str) -> Result<&'a str, String> {
        self.next()
            .and_then(Token::atom)
            .ok_or_else(|| format!("missing {}", what))
    }

    fn sequence(&mut self) -> Result<SequenceSet, String> {
        let raw = self.atom("sequence set")?;
        SequenceSet::parse(raw).ok_or_else(|| format!("invalid sequence set {}", raw))
    }

    fn end(&self) -> Result<(), String> {
        if self.pos < self.tokens.len() {
            Err("unexpected arguments".to_string())
        } else {
            Ok(())
        }
    }
}

/// IMAP command parser
pub struct ImapParser;

impl ImapParser {
    /// Parse one request
    pub fn parse(request: &[u8]) -> Result<TaggedCommand, ParseError> {
        let raw_tag = request
            .split(|b| *b == b' ')
            .next()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .filter(|t| Self::valid_tag(t));

        let fail = |message: String| ParseError {
            tag: raw_tag.clone(),
            message,
        };

        let tokens = tokenize(request).map_err(fail)?;
        let tag = match tokens.first() {
            Some(Token::Atom(tag)) if Self::valid_tag(tag) => tag.clone(),
            Some(_) => return Err(fail("invalid tag".to_string())),
            None => return Err(fail("empty command".to_string())),
        };
        let name = tokens
            .get(1)
            .and_then(Token::atom)
            .ok_or_else(|| fail("missing command".to_string()))?
            .to_ascii_uppercase();

        let mut args = Args::new(&tokens[2..]);
        let command = Self::parse_command(&name, &mut args).map_err(fail)?;
        Ok(TaggedCommand { tag, command })
    }

    fn valid_tag(tag: &str) -> bool {
        !tag.is_empty()
            && tag
                .bytes()
                .all(|b| b.is_ascii_graphic() && !b"(){%*\"\\+".contains(&b))
    }

    /// Parse the command portion
    fn parse_command(name: &str, args: &mut Args<'_>) -> Result<ImapCommand, String> {
        let command = match name {
            // Any state
            "CAPABILITY" => ImapCommand::Capability,
            "NOOP" => ImapCommand::Noop,
            "LOGOUT" => ImapCommand::Logout,

            // Not authenticated
            "LOGIN" => ImapCommand::Login {
                username: args.astring("user name")?,
                password: args.astring("password")?,
            },
            "AUTHENTICATE" => ImapCommand::Authenticate {
                mechanism: args.atom("mechanism")?.to_ascii_uppercase(),
                initial_response: args.next().and_then(Token::text),
            },

            // Authenticated state
            "SELECT" => ImapCommand::Select {
                mailbox: args.astring("mailbox")?,
            },
            "EXAMINE" => ImapCommand::Examine {
                mailbox: args.astring("mailbox")?,
            },
            "CREATE" => ImapCommand::Create {
                mailbox: args.astring("mailbox")?,
            },
            "DELETE" => ImapCommand::Delete {
                mailbox: args.astring("mailbox")?,
            },
            "RENAME" => ImapCommand::Rename {
                old_mailbox: args.astring("mailbox")?,
                new_mailbox: args.astring("new mailbox name")?,
            },
            "SUBSCRIBE" => ImapCommand::Subscribe {
                mailbox: args.astring("mailbox")?,
            },
            "UNSUBSCRIBE" => ImapCommand::Unsubscribe {
                mailbox: args.astring("mailbox")?,
            },
            "LIST" => ImapCommand::List {
                reference: args.astring("reference")?,
                pattern: args.astring("pattern")?,
            },
            "LSUB" => ImapCommand::Lsub {
                reference: args.astring("reference")?,
                pattern: args.astring("pattern")?,
            },
            "STATUS" => Self::parse_status(args)?,
            "APPEND" => Self::parse_append(args)?,
            "NAMESPACE" => ImapCommand::Namespace,
            "GETACL" => ImapCommand::GetAcl {
                mailbox: args.astring("mailbox")?,
            },
            "SETACL" => ImapCommand::SetAcl {
                mailbox: args.astring("mailbox")?,
                identifier: args.astring("identifier")?,
                rights: args.astring("rights")?,
            },
            "DELETEACL" => ImapCommand::DeleteAcl {
                mailbox: args.astring("mailbox")?,
                identifier: args.astring("identifier")?,
            },
            "MYRIGHTS" => ImapCommand::MyRights {
                mailbox: args.astring("mailbox")?,
            },
            "LISTRIGHTS" => ImapCommand::ListRights {
                mailbox: args.astring("mailbox")?,
                identifier: args.astring("identifier")?,
            },
            "GETQUOTA" => ImapCommand::GetQuota {
                root: args.astring("quota root")?,
            },
            "GETQUOTAROOT" => ImapCommand::GetQuotaRoot {
                mailbox: args.astring("mailbox")?,
            },

            // Selected state
            "CHECK" => ImapCommand::Check,
            "CLOSE" => ImapCommand::Close,
            "EXPUNGE" => ImapCommand::Expunge,
            "SEARCH" => ImapCommand::Search {
                key: parse_search(args.rest())?,
                uid: false,
            },
            "SORT" => Self::parse_sort(args, false)?,
            "FETCH" => Self::parse_fetch(args, false)?,
            "STORE" => Self::parse_store(args, false)?,
            "COPY" => ImapCommand::Copy {
                sequence: args.sequence()?,
                mailbox: args.astring("mailbox")?,
                uid: false,
            },
            "UID" => Self::parse_uid_command(args)?,

            other => return Err(format!("unknown command {}", other)),
        };
        args.end()?;
        Ok(command)
    }

    /// Parse UID FETCH/SEARCH/SORT/STORE/COPY/EXPUNGE commands
    fn parse_uid_command(args: &mut Args<'_>) -> Result<ImapCommand, String> {
        let sub = args.atom("UID command")?.to_ascii_uppercase();
        Ok(match sub.as_str() {
            "FETCH" => Self::parse_fetch(args, true)?,
            "SEARCH" => ImapCommand::Search {
                key: parse_search(args.rest())?,
                uid: true,
            },
            "SORT" => Self::parse_sort(args, true)?,
            "STORE" => Self::parse_store(args, true)?,
            "COPY" => ImapCommand::Copy {
                sequence: args.sequence()?,
                mailbox: args.astring("mailbox")?,
                uid: true,
            },
            "EXPUNGE" => {
                args.rest();
                ImapCommand::Expunge
            }
            other => return Err(format!("unknown command UID {}", other)),
        })
    }

    /// Parse STATUS command
    fn parse_status(args: &mut Args<'_>) -> Result<ImapCommand, String> {
        let mailbox = args.astring("mailbox")?;
        let items = match args.next() {
            Some(Token::List(items)) => items
                .iter()
                .map(|t| {
                    t.atom()
                        .and_then(StatusItem::parse)
                        .ok_or_else(|| "invalid status item".to_string())
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err("missing status items".to_string()),
        };
        Ok(ImapCommand::Status { mailbox, items })
    }

    /// Parse APPEND command: mailbox [(flags)] [date-time] literal
    fn parse_append(args: &mut Args<'_>) -> Result<ImapCommand, String> {
        let mailbox = args.astring("mailbox")?;

        let mut flags = Vec::new();
        if let Some(Token::List(list)) = args.peek() {
            flags = Self::flag_list(list)?;
            args.next();
        }

        let mut date = None;
        if let Some(Token::Quoted(d)) = args.peek() {
            date = Some(d.clone());
            args.next();
        }

        let message = match args.next() {
            Some(Token::Literal(bytes)) => bytes.clone(),
            _ => return Err("missing message literal".to_string()),
        };

        Ok(ImapCommand::Append {
            mailbox,
            flags,
            date,
            message,
        })
    }

    /// Parse FETCH command
    fn parse_fetch(args: &mut Args<'_>, uid: bool) -> Result<ImapCommand, String> {
        let sequence = args.sequence()?;
        let names: Vec<&Token> = match args.next() {
            Some(Token::List(list)) => list.iter().collect(),
            Some(token) => vec![token],
            None => return Err("missing fetch items".to_string()),
        };

        let mut items = Vec::new();
        for name in names {
            let atom = name.atom().ok_or_else(|| "invalid fetch item".to_string())?;
            let parsed =
                FetchItem::parse(atom).ok_or_else(|| format!("invalid fetch item {}", atom))?;
            for item in parsed {
                if !items.contains(&item) {
                    items.push(item);
                }
            }
        }

        Ok(ImapCommand::Fetch {
            sequence,
            items,
            uid,
        })
    }

    /// Parse STORE command: sequence +FLAGS|-FLAGS|FLAGS[.SILENT] flags
    fn parse_store(args: &mut Args<'_>, uid: bool) -> Result<ImapCommand, String> {
        let sequence = args.sequence()?;
        let op = args.atom("store operation")?.to_ascii_uppercase();

        let (operation, name) = match op.as_bytes().first() {
            Some(b'+') => (StoreOperation::Add, &op[1..]),
            Some(b'-') => (StoreOperation::Remove, &op[1..]),
            _ => (StoreOperation::Replace, op.as_str()),
        };
        let silent = match name {
            "FLAGS" => false,
            "FLAGS.SILENT" => true,
            _ => return Err(format!("invalid store operation {}", op)),
        };

        let flags = match args.peek() {
            Some(Token::List(list)) => {
                args.next();
                Self::flag_list(list)?
            }
            _ => Self::flag_list(args.rest())?,
        };

        Ok(ImapCommand::Store {
            sequence,
            flags: StoreFlags {
                operation,
                silent,
                flags,
            },
            uid,
        })
    }

    /// Parse SORT command: (criteria) charset search-keys
    fn parse_sort(args: &mut Args<'_>, uid: bool) -> Result<ImapCommand, String> {
        let criteria = match args.next() {
            Some(Token::List(list)) => parse_sort_criteria(list)?,
            _ => return Err("missing sort criteria".to_string()),
        };
        args.astring("charset")?;
        let key = parse_search(args.rest())?;
        Ok(ImapCommand::Sort { criteria, key, uid })
    }

    fn flag_list(tokens: &[Token]) -> Result<Vec<String>, String> {
        tokens
            .iter()
            .map(|t| t.atom().map(str::to_string).ok_or_else(|| "invalid flag".to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{SearchKey, SortCriterion, SortField};
    use pretty_assertions::assert_eq;

    fn parse(line: &str) -> ImapCommand {
        ImapParser::parse(line.as_bytes()).unwrap().command
    }

    #[test]
    fn test_tokenize() {
        let tokens = tokenize(b"A1 FETCH 1:* (FLAGS BODY[HEADER.FIELDS (FROM)]) \"a \\\"b\\\"\"").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Atom("A1".into()),
                Token::Atom("FETCH".into()),
                Token::Atom("1:*".into()),
                Token::List(vec![
                    Token::Atom("FLAGS".into()),
                    Token::Atom("BODY[HEADER.FIELDS (FROM)]".into()),
                ]),
                Token::Quoted("a \"b\"".into()),
            ]
        );
        assert!(tokenize(b"A1 (FLAGS").is_err());
        assert!(tokenize(b"A1 FLAGS)").is_err());
        assert!(tokenize(b"A1 \"open").is_err());
    }

    #[test]
    fn test_literal_tokens() {
        let tokens = tokenize(b"A1 LOGIN {3}\r\njoe pass").unwrap();
        assert_eq!(tokens[2], Token::Literal(b"joe".to_vec()));
        assert_eq!(tokens[3], Token::Atom("pass".into()));
        assert!(tokenize(b"A1 LOGIN {5}\r\njoe").is_err());
    }

    #[test]
    fn test_parse_capability() {
        let cmd = ImapParser::parse(b"A001 CAPABILITY").unwrap();
        assert_eq!(cmd.tag, "A001");
        assert_eq!(cmd.command, ImapCommand::Capability);
    }

    #[test]
    fn test_parse_login_quoted() {
        assert_eq!(
            parse(r#"A002 LOGIN "user@example.com" "pass word""#),
            ImapCommand::Login {
                username: "user@example.com".into(),
                password: "pass word".into()
            }
        );
    }

    #[test]
    fn test_parse_uid_fetch() {
        match parse("A005 UID FETCH 1:100 (FLAGS BODY.PEEK[])") {
            ImapCommand::Fetch { sequence, items, uid } => {
                assert!(uid);
                assert_eq!(sequence, SequenceSet::Range(1, 100));
                assert_eq!(items.len(), 2);
            }
            other => panic!("Expected UID FETCH, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_store() {
        assert_eq!(
            parse(r"A1 STORE 2:3 +FLAGS.SILENT (\Deleted \Seen)"),
            ImapCommand::Store {
                sequence: SequenceSet::Range(2, 3),
                flags: StoreFlags {
                    operation: StoreOperation::Add,
                    silent: true,
                    flags: vec!["\\Deleted".into(), "\\Seen".into()],
                },
                uid: false,
            }
        );
        assert!(ImapParser::parse(b"A1 STORE 1 FLAGZ (\\Seen)").is_err());
    }

    #[test]
    fn test_parse_append() {
        let cmd = parse("A1 APPEND Drafts (\\Draft) \"05-Mar-2024 10:00:00 +0000\" {5}\r\nHello");
        assert_eq!(
            cmd,
            ImapCommand::Append {
                mailbox: "Drafts".into(),
                flags: vec!["\\Draft".into()],
                date: Some("05-Mar-2024 10:00:00 +0000".into()),
                message: b"Hello".to_vec(),
            }
        );
    }

    #[test]
    fn test_parse_sort() {
        assert_eq!(
            parse("A1 UID SORT (REVERSE DATE SUBJECT) UTF-8 ALL"),
            ImapCommand::Sort {
                criteria: vec![
                    SortCriterion {
                        field: SortField::Date,
                        reverse: true
                    },
                    SortCriterion {
                        field: SortField::Subject,
                        reverse: false
                    },
                ],
                key: SearchKey::All,
                uid: true,
            }
        );
    }

    #[test]
    fn test_parse_acl_commands() {
        assert_eq!(
            parse("A1 SETACL Shared bob +lr"),
            ImapCommand::SetAcl {
                mailbox: "Shared".into(),
                identifier: "bob".into(),
                rights: "+lr".into()
            }
        );
        assert_eq!(
            parse("A1 LISTRIGHTS INBOX anyone"),
            ImapCommand::ListRights {
                mailbox: "INBOX".into(),
                identifier: "anyone".into()
            }
        );
    }

    #[test]
    fn test_parse_quota_commands() {
        assert_eq!(
            parse("A1 GETQUOTA \"\""),
            ImapCommand::GetQuota { root: String::new() }
        );
        assert_eq!(
            parse("A1 getquotaroot INBOX"),
            ImapCommand::GetQuotaRoot {
                mailbox: "INBOX".into()
            }
        );
    }

    #[test]
    fn test_parse_errors_keep_the_tag() {
        let err = ImapParser::parse(b"A9 FROBNICATE").unwrap_err();
        assert_eq!(err.tag.as_deref(), Some("A9"));

        let err = ImapParser::parse(b"A9 SELECT").unwrap_err();
        assert_eq!(err.message, "missing mailbox");

        let err = ImapParser::parse(b"A9 NOOP extra").unwrap_err();
        assert_eq!(err.message, "unexpected arguments");

        let err = ImapParser::parse(b"* NOOP").unwrap_err();
        assert_eq!(err.tag, None);
    }
}
