//! Sieve (RFC 5228) subset
//!
//! Actions: `keep`, `discard`, `stop`, `fileinto`, `reject`, `redirect`.
//! Control: `require`, `if` / `elsif` / `else`.
//! Tests: `header`, `address`, `exists`, `size`, `allof`, `anyof`, `not`,
//! `true`, `false`, with `:is` and `:contains` matching under the default
//! `i;ascii-casemap` comparator.

use super::{SortBackend, SortResult};
use crate::search::mime::top_level_headers;
use async_trait::async_trait;
use mailstore_common::types::UserId;
use mailstore_common::{Error, Result};
use mailstore_storage::Store;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Tag(String),
    Str(String),
    Num(u64),
    LBracket,
    RBracket,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
}

fn invalid(msg: impl std::fmt::Display) -> Error {
    Error::Validation(format!("sieve: {}", msg))
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                if i + 1 >= chars.len() {
                    return Err(invalid("unterminated comment"));
                }
                i += 2;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semi);
                i += 1;
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string")),
                        Some('"') => break,
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                s.push(*next);
                            }
                            i += 2;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            ':' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if i == start {
                    return Err(invalid("empty tag"));
                }
                let tag: String = chars[start..i].iter().collect();
                tokens.push(Token::Tag(tag.to_ascii_lowercase()));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = chars[start..i].iter().collect();
                let mut n: u64 = digits.parse().map_err(invalid)?;
                let scale = match chars.get(i).map(|c| c.to_ascii_uppercase()) {
                    Some('K') => Some(1 << 10),
                    Some('M') => Some(1 << 20),
                    Some('G') => Some(1 << 30),
                    _ => None,
                };
                if let Some(scale) = scale {
                    n = n.saturating_mul(scale);
                    i += 1;
                }
                tokens.push(Token::Num(n));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word.eq_ignore_ascii_case("text") && chars.get(i) == Some(&':') {
                    let (text, next) = multiline(&chars, i + 1)?;
                    tokens.push(Token::Str(text));
                    i = next;
                } else {
                    tokens.push(Token::Ident(word.to_ascii_lowercase()));
                }
            }
            _ => return Err(invalid(format!("unexpected character '{}'", c))),
        }
    }
    Ok(tokens)
}

/// `text:` string: lines up to one holding a lone `.`, dot-stuffing removed
fn multiline(chars: &[char], mut i: usize) -> Result<(String, usize)> {
    while i < chars.len() && chars[i] != '\n' {
        i += 1;
    }
    i += 1;

    let mut out = String::new();
    while i < chars.len() {
        let start = i;
        while i < chars.len() && chars[i] != '\n' {
            i += 1;
        }
        let line: String = chars[start..i].iter().collect();
        let line = line.trim_end_matches('\r');
        i += 1;
        if line == "." {
            return Ok((out, i));
        }
        out.push_str(line.strip_prefix('.').filter(|_| line.starts_with("..")).unwrap_or(line));
        out.push('\n');
    }
    Err(invalid("unterminated text block"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchType {
    Is,
    Contains,
}

impl MatchType {
    fn matches(self, value: &str, key: &str) -> bool {
        match self {
            MatchType::Is => value.eq_ignore_ascii_case(key),
            MatchType::Contains => value.to_lowercase().contains(&key.to_lowercase()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressPart {
    All,
    LocalPart,
    Domain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Test {
    True,
    False,
    Not(Box<Test>),
    AllOf(Vec<Test>),
    AnyOf(Vec<Test>),
    Exists(Vec<String>),
    Header {
        match_type: MatchType,
        names: Vec<String>,
        keys: Vec<String>,
    },
    Address {
        match_type: MatchType,
        part: AddressPart,
        names: Vec<String>,
        keys: Vec<String>,
    },
    Size {
        over: bool,
        limit: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Keep,
    Discard,
    Stop,
    FileInto(String),
    Reject(String),
    Redirect(String),
    If {
        branches: Vec<(Test, Vec<Command>)>,
        otherwise: Vec<Command>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(invalid(format!("expected {:?}, found {:?}", want, t))),
            None => Err(invalid(format!("expected {:?} at end of script", want))),
        }
    }

    fn commands(&mut self, in_block: bool) -> Result<Vec<Command>> {
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None if !in_block => return Ok(out),
                None => return Err(invalid("missing '}'")),
                Some(Token::RBrace) if in_block => {
                    self.pos += 1;
                    return Ok(out);
                }
                _ => {
                    if let Some(command) = self.command()? {
                        out.push(command);
                    }
                }
            }
        }
    }

    fn block(&mut self) -> Result<Vec<Command>> {
        self.expect(Token::LBrace)?;
        self.commands(true)
    }

    fn command(&mut self) -> Result<Option<Command>> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            other => return Err(invalid(format!("expected command, found {:?}", other))),
        };

        let command = match name.as_str() {
            "require" => {
                self.string_list()?;
                None
            }
            "keep" => Some(Command::Keep),
            "discard" => Some(Command::Discard),
            "stop" => Some(Command::Stop),
            "fileinto" => Some(Command::FileInto(self.string()?)),
            "reject" => Some(Command::Reject(self.string()?)),
            "redirect" => Some(Command::Redirect(self.string()?)),
            "if" => {
                let mut branches = vec![(self.test()?, self.block()?)];
                let mut otherwise = Vec::new();
                loop {
                    match self.peek() {
                        Some(Token::Ident(w)) if w == "elsif" => {
                            self.pos += 1;
                            branches.push((self.test()?, self.block()?));
                        }
                        Some(Token::Ident(w)) if w == "else" => {
                            self.pos += 1;
                            otherwise = self.block()?;
                            break;
                        }
                        _ => break,
                    }
                }
                return Ok(Some(Command::If {
                    branches,
                    otherwise,
                }));
            }
            other => return Err(invalid(format!("unsupported command '{}'", other))),
        };
        self.expect(Token::Semi)?;
        Ok(command)
    }

    fn string(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(s),
            other => Err(invalid(format!("expected string, found {:?}", other))),
        }
    }

    fn string_list(&mut self) -> Result<Vec<String>> {
        if self.peek() != Some(&Token::LBracket) {
            return Ok(vec![self.string()?]);
        }
        self.pos += 1;
        let mut out = vec![self.string()?];
        loop {
            match self.next() {
                Some(Token::Comma) => out.push(self.string()?),
                Some(Token::RBracket) => return Ok(out),
                other => return Err(invalid(format!("expected ',' or ']', found {:?}", other))),
            }
        }
    }

    fn test_list(&mut self) -> Result<Vec<Test>> {
        self.expect(Token::LParen)?;
        let mut out = vec![self.test()?];
        loop {
            match self.next() {
                Some(Token::Comma) => out.push(self.test()?),
                Some(Token::RParen) => return Ok(out),
                other => return Err(invalid(format!("expected ',' or ')', found {:?}", other))),
            }
        }
    }

    /// Tagged arguments of a test: match type, address part, comparator
    fn tags(&mut self) -> Result<(MatchType, AddressPart)> {
        let mut match_type = MatchType::Is;
        let mut part = AddressPart::All;
        while let Some(Token::Tag(tag)) = self.peek().cloned() {
            self.pos += 1;
            match tag.as_str() {
                "is" => match_type = MatchType::Is,
                "contains" => match_type = MatchType::Contains,
                "all" => part = AddressPart::All,
                "localpart" => part = AddressPart::LocalPart,
                "domain" => part = AddressPart::Domain,
                "comparator" => {
                    let comparator = self.string()?;
                    if !comparator.eq_ignore_ascii_case("i;ascii-casemap") {
                        return Err(invalid(format!("unsupported comparator {}", comparator)));
                    }
                }
                other => return Err(invalid(format!("unsupported tag :{}", other))),
            }
        }
        Ok((match_type, part))
    }

    fn test(&mut self) -> Result<Test> {
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            other => return Err(invalid(format!("expected test, found {:?}", other))),
        };
        Ok(match name.as_str() {
            "true" => Test::True,
            "false" => Test::False,
            "not" => Test::Not(Box::new(self.test()?)),
            "allof" => Test::AllOf(self.test_list()?),
            "anyof" => Test::AnyOf(self.test_list()?),
            "exists" => Test::Exists(self.string_list()?),
            "header" => {
                let (match_type, _) = self.tags()?;
                Test::Header {
                    match_type,
                    names: self.string_list()?,
                    keys: self.string_list()?,
                }
            }
            "address" => {
                let (match_type, part) = self.tags()?;
                Test::Address {
                    match_type,
                    part,
                    names: self.string_list()?,
                    keys: self.string_list()?,
                }
            }
            "size" => {
                let over = match self.next() {
                    Some(Token::Tag(t)) if t == "over" => true,
                    Some(Token::Tag(t)) if t == "under" => false,
                    other => {
                        return Err(invalid(format!("size needs :over or :under, found {:?}", other)))
                    }
                };
                let limit = match self.next() {
                    Some(Token::Num(n)) => n,
                    other => return Err(invalid(format!("expected number, found {:?}", other))),
                };
                Test::Size { over, limit }
            }
            other => return Err(invalid(format!("unsupported test '{}'", other))),
        })
    }
}

/// A parsed script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    commands: Vec<Command>,
}

/// Message data the tests look at
struct Envelope {
    headers: Vec<(String, String)>,
    size: u64,
}

impl Envelope {
    fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Bare address of one mailbox in a header value
fn bare_address(value: &str) -> &str {
    match (value.find('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim(),
        _ => value.trim(),
    }
}

struct Run {
    result: SortResult,
    implicit_keep: bool,
    explicit_keep: bool,
}

impl Script {
    pub fn parse(src: &str) -> Result<Self> {
        let mut parser = Parser {
            tokens: lex(src)?,
            pos: 0,
        };
        Ok(Self {
            commands: parser.commands(false)?,
        })
    }

    /// Run the script against a raw message
    pub fn evaluate(&self, message: &[u8]) -> SortResult {
        let envelope = Envelope {
            headers: top_level_headers(message),
            size: message.len() as u64,
        };
        let mut run = Run {
            result: SortResult {
                keep: false,
                ..SortResult::keep()
            },
            implicit_keep: true,
            explicit_keep: false,
        };
        Self::execute(&self.commands, &envelope, &mut run);
        run.result.keep = run.explicit_keep || run.implicit_keep;
        run.result
    }

    /// Returns true once `stop` has run
    fn execute(commands: &[Command], envelope: &Envelope, run: &mut Run) -> bool {
        for command in commands {
            match command {
                Command::Keep => run.explicit_keep = true,
                Command::Discard => run.implicit_keep = false,
                Command::Stop => return true,
                Command::FileInto(mailbox) => {
                    run.implicit_keep = false;
                    run.result.fileinto.push(mailbox.clone());
                }
                Command::Reject(reason) => {
                    run.implicit_keep = false;
                    run.result.reject = Some(reason.clone());
                }
                Command::Redirect(address) => {
                    run.implicit_keep = false;
                    run.result.redirect.push(address.clone());
                }
                Command::If {
                    branches,
                    otherwise,
                } => {
                    let chosen = branches
                        .iter()
                        .find(|(test, _)| Self::check(test, envelope))
                        .map(|(_, block)| block)
                        .unwrap_or(otherwise);
                    if Self::execute(chosen, envelope, run) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn check(test: &Test, envelope: &Envelope) -> bool {
        match test {
            Test::True => true,
            Test::False => false,
            Test::Not(inner) => !Self::check(inner, envelope),
            Test::AllOf(tests) => tests.iter().all(|t| Self::check(t, envelope)),
            Test::AnyOf(tests) => tests.iter().any(|t| Self::check(t, envelope)),
            Test::Exists(names) => names.iter().all(|n| envelope.values(n).next().is_some()),
            Test::Header {
                match_type,
                names,
                keys,
            } => names.iter().any(|name| {
                envelope
                    .values(name)
                    .any(|v| keys.iter().any(|k| match_type.matches(v, k)))
            }),
            Test::Address {
                match_type,
                part,
                names,
                keys,
            } => names.iter().any(|name| {
                envelope.values(name).any(|value| {
                    value.split(',').any(|mailbox| {
                        let address = bare_address(mailbox);
                        let (local, domain) = address.rsplit_once('@').unwrap_or((address, ""));
                        let subject = match part {
                            AddressPart::All => address,
                            AddressPart::LocalPart => local,
                            AddressPart::Domain => domain,
                        };
                        keys.iter().any(|k| match_type.matches(subject, k))
                    })
                })
            }),
            Test::Size { over, limit } => {
                if *over {
                    envelope.size > *limit
                } else {
                    envelope.size < *limit
                }
            }
        }
    }
}

/// The `sieve` driver: runs each user's active script
pub struct SieveSort {
    store: Store,
}

impl SieveSort {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SortBackend for SieveSort {
    fn name(&self) -> &'static str {
        "sieve"
    }

    fn extensions(&self) -> &'static str {
        "fileinto reject"
    }

    async fn validate(&self, _user: UserId, script: &str) -> Result<()> {
        Script::parse(script).map(|_| ())
    }

    async fn process(&self, user: UserId, message: &[u8], mailbox: &str) -> Result<SortResult> {
        let Some(active) = self.store.scripts.active(user).await? else {
            return Ok(SortResult::keep());
        };

        let script = match Script::parse(&active.script) {
            Ok(script) => script,
            Err(e) => {
                warn!(user_id = user, script = %active.name, error = %e, "Broken sieve script, keeping message");
                return Ok(SortResult::keep());
            }
        };

        let result = script.evaluate(message);
        debug!(
            user_id = user,
            mailbox = %mailbox,
            keep = result.keep,
            fileinto = ?result.fileinto,
            "Sieve script applied"
        );
        Ok(result)
    }
}
