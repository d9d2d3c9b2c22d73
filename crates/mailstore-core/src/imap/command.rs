//! IMAP Command definitions
//!
//! Defines the IMAP commands supported by this server.

use crate::search::{SearchKey, SortCriterion};
use crate::sequence::SequenceSet;
use crate::session::ClientState;

/// IMAP command tag (client-provided identifier)
pub type Tag = String;

/// Part of a message addressed by `BODY[...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// `BODY[]`, the whole message
    Full,
    /// `BODY[HEADER]`
    Header,
    /// `BODY[TEXT]`
    Text,
    /// `BODY[HEADER.FIELDS (...)]`
    HeaderFields(Vec<String>),
}

impl Section {
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "" => Some(Section::Full),
            "HEADER" => Some(Section::Header),
            "TEXT" => Some(Section::Text),
            _ => {
                let list = upper.strip_prefix("HEADER.FIELDS")?.trim();
                let names = list.strip_prefix('(')?.strip_suffix(')')?;
                let names: Vec<String> = names.split_whitespace().map(str::to_string).collect();
                if names.is_empty() {
                    None
                } else {
                    Some(Section::HeaderFields(names))
                }
            }
        }
    }

    /// Section name as echoed in FETCH responses
    pub fn name(&self) -> String {
        match self {
            Section::Full => String::new(),
            Section::Header => "HEADER".to_string(),
            Section::Text => "TEXT".to_string(),
            Section::HeaderFields(names) => format!("HEADER.FIELDS ({})", names.join(" ")),
        }
    }
}

/// FETCH data items
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    /// Message flags
    Flags,
    /// Internal date
    InternalDate,
    /// RFC822.SIZE
    Rfc822Size,
    /// RFC822, same as BODY[]
    Rfc822,
    /// RFC822.HEADER, same as BODY.PEEK[HEADER]
    Rfc822Header,
    /// RFC822.TEXT, same as BODY[TEXT]
    Rfc822Text,
    /// Envelope structure
    Envelope,
    /// UID
    Uid,
    /// Body section; `peek` leaves `\Seen` alone
    Body {
        section: Section,
        peek: bool,
        partial: Option<(u32, u32)>,
    },
}

impl FetchItem {
    /// Parse one fetch attribute. Macros expand to several items.
    pub fn parse(s: &str) -> Option<Vec<Self>> {
        let upper = s.trim().to_ascii_uppercase();
        let single = match upper.as_str() {
            "FLAGS" => FetchItem::Flags,
            "INTERNALDATE" => FetchItem::InternalDate,
            "RFC822.SIZE" => FetchItem::Rfc822Size,
            "RFC822" => FetchItem::Rfc822,
            "RFC822.HEADER" => FetchItem::Rfc822Header,
            "RFC822.TEXT" => FetchItem::Rfc822Text,
            "ENVELOPE" => FetchItem::Envelope,
            "UID" => FetchItem::Uid,
            "FAST" => {
                return Some(vec![
                    FetchItem::Flags,
                    FetchItem::InternalDate,
                    FetchItem::Rfc822Size,
                ])
            }
            "ALL" | "FULL" => {
                return Some(vec![
                    FetchItem::Flags,
                    FetchItem::InternalDate,
                    FetchItem::Rfc822Size,
                    FetchItem::Envelope,
                ])
            }
            _ => {
                let (rest, peek) = if let Some(rest) = upper.strip_prefix("BODY.PEEK[") {
                    (rest, true)
                } else {
                    (upper.strip_prefix("BODY[")?, false)
                };
                let close = rest.rfind(']')?;
                let section = Section::parse(&rest[..close])?;
                let partial = Self::parse_partial(&rest[close + 1..])?;
                FetchItem::Body {
                    section,
                    peek,
                    partial,
                }
            }
        };
        Some(vec![single])
    }

    /// `<start.length>` suffix
    fn parse_partial(s: &str) -> Option<Option<(u32, u32)>> {
        if s.is_empty() {
            return Some(None);
        }
        let inner = s.strip_prefix('<')?.strip_suffix('>')?;
        let (start, len) = inner.split_once('.')?;
        Some(Some((start.parse().ok()?, len.parse().ok()?)))
    }
}

/// STATUS data items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

impl StatusItem {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_uppercase().as_str() {
            "MESSAGES" => StatusItem::Messages,
            "RECENT" => StatusItem::Recent,
            "UIDNEXT" => StatusItem::UidNext,
            "UIDVALIDITY" => StatusItem::UidValidity,
            "UNSEEN" => StatusItem::Unseen,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            StatusItem::Messages => "MESSAGES",
            StatusItem::Recent => "RECENT",
            StatusItem::UidNext => "UIDNEXT",
            StatusItem::UidValidity => "UIDVALIDITY",
            StatusItem::Unseen => "UNSEEN",
        }
    }
}

/// Store operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    /// Replace flags
    Replace,
    /// Add flags
    Add,
    /// Remove flags
    Remove,
}

/// Store flags specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFlags {
    pub operation: StoreOperation,
    pub silent: bool,
    pub flags: Vec<String>,
}

/// IMAP Command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImapCommand {
    // Any state commands
    Capability,
    Noop,
    Logout,

    // Not authenticated state
    Login {
        username: String,
        password: String,
    },
    Authenticate {
        mechanism: String,
        initial_response: Option<String>,
    },

    // Authenticated state
    Select {
        mailbox: String,
    },
    Examine {
        mailbox: String,
    },
    Create {
        mailbox: String,
    },
    Delete {
        mailbox: String,
    },
    Rename {
        old_mailbox: String,
        new_mailbox: String,
    },
    Subscribe {
        mailbox: String,
    },
    Unsubscribe {
        mailbox: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        flags: Vec<String>,
        date: Option<String>,
        message: Vec<u8>,
    },
    Namespace,
    GetAcl {
        mailbox: String,
    },
    SetAcl {
        mailbox: String,
        identifier: String,
        rights: String,
    },
    DeleteAcl {
        mailbox: String,
        identifier: String,
    },
    MyRights {
        mailbox: String,
    },
    ListRights {
        mailbox: String,
        identifier: String,
    },
    GetQuota {
        root: String,
    },
    GetQuotaRoot {
        mailbox: String,
    },

    // Selected state
    Check,
    Close,
    Expunge,
    Search {
        key: SearchKey,
        uid: bool,
    },
    Sort {
        criteria: Vec<SortCriterion>,
        key: SearchKey,
        uid: bool,
    },
    Fetch {
        sequence: SequenceSet,
        items: Vec<FetchItem>,
        uid: bool,
    },
    Store {
        sequence: SequenceSet,
        flags: StoreFlags,
        uid: bool,
    },
    Copy {
        sequence: SequenceSet,
        mailbox: String,
        uid: bool,
    },
}

impl ImapCommand {
    /// Lowest state the command may run in
    pub fn requires(&self) -> ClientState {
        match self {
            ImapCommand::Capability | ImapCommand::Noop | ImapCommand::Logout => ClientState::Any,
            ImapCommand::Login { .. } | ImapCommand::Authenticate { .. } => {
                ClientState::NonAuthenticated
            }
            ImapCommand::Check
            | ImapCommand::Close
            | ImapCommand::Expunge
            | ImapCommand::Search { .. }
            | ImapCommand::Sort { .. }
            | ImapCommand::Fetch { .. }
            | ImapCommand::Store { .. }
            | ImapCommand::Copy { .. } => ClientState::Selected,
            _ => ClientState::Authenticated,
        }
    }

    /// Whether the selected mailbox is resynced after the command
    pub fn resyncs(&self) -> bool {
        matches!(
            self,
            ImapCommand::Noop
                | ImapCommand::Check
                | ImapCommand::Fetch { .. }
                | ImapCommand::Store { .. }
                | ImapCommand::Search { .. }
                | ImapCommand::Sort { .. }
                | ImapCommand::Expunge
        )
    }

    /// Command name as used in completion responses
    pub fn name(&self) -> &'static str {
        match self {
            ImapCommand::Capability => "CAPABILITY",
            ImapCommand::Noop => "NOOP",
            ImapCommand::Logout => "LOGOUT",
            ImapCommand::Login { .. } => "LOGIN",
            ImapCommand::Authenticate { .. } => "AUTHENTICATE",
            ImapCommand::Select { .. } => "SELECT",
            ImapCommand::Examine { .. } => "EXAMINE",
            ImapCommand::Create { .. } => "CREATE",
            ImapCommand::Delete { .. } => "DELETE",
            ImapCommand::Rename { .. } => "RENAME",
            ImapCommand::Subscribe { .. } => "SUBSCRIBE",
            ImapCommand::Unsubscribe { .. } => "UNSUBSCRIBE",
            ImapCommand::List { .. } => "LIST",
            ImapCommand::Lsub { .. } => "LSUB",
            ImapCommand::Status { .. } => "STATUS",
            ImapCommand::Append { .. } => "APPEND",
            ImapCommand::Namespace => "NAMESPACE",
            ImapCommand::GetAcl { .. } => "GETACL",
            ImapCommand::SetAcl { .. } => "SETACL",
            ImapCommand::DeleteAcl { .. } => "DELETEACL",
            ImapCommand::MyRights { .. } => "MYRIGHTS",
            ImapCommand::ListRights { .. } => "LISTRIGHTS",
            ImapCommand::GetQuota { .. } => "GETQUOTA",
            ImapCommand::GetQuotaRoot { .. } => "GETQUOTAROOT",
            ImapCommand::Check => "CHECK",
            ImapCommand::Close => "CLOSE",
            ImapCommand::Expunge => "EXPUNGE",
            ImapCommand::Search { .. } => "SEARCH",
            ImapCommand::Sort { .. } => "SORT",
            ImapCommand::Fetch { .. } => "FETCH",
            ImapCommand::Store { .. } => "STORE",
            ImapCommand::Copy { .. } => "COPY",
        }
    }
}

/// Parsed IMAP command with tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedCommand {
    pub tag: Tag,
    pub command: ImapCommand,
}
