//! IMAP Response generation
//!
//! Generates IMAP4 response strings for client communication.

use chrono::{DateTime, Utc};
use mailstore_common::types::MessageFlags;

pub const CAPABILITIES: &str = "IMAP4rev1 LITERAL+ SASL-IR AUTH=PLAIN ACL NAMESPACE SORT QUOTA";

/// IMAP Response builder
pub struct ImapResponse;

impl ImapResponse {
    /// Server greeting
    pub fn greeting(banner: &str) -> String {
        format!("* OK [CAPABILITY {}] {}\r\n", CAPABILITIES, banner)
    }

    /// Tagged OK response
    pub fn ok(tag: &str, message: &str) -> String {
        format!("{} OK {}\r\n", tag, message)
    }

    /// Tagged NO response
    pub fn no(tag: &str, message: &str) -> String {
        format!("{} NO {}\r\n", tag, message)
    }

    /// Tagged BAD response, or untagged when the tag is unknown
    pub fn bad(tag: Option<&str>, message: &str) -> String {
        format!("{} BAD {}\r\n", tag.unwrap_or("*"), message)
    }

    /// Untagged BYE response
    pub fn bye(message: &str) -> String {
        format!("* BYE {}\r\n", message)
    }

    /// CAPABILITY response
    pub fn capability() -> String {
        format!("* CAPABILITY {}\r\n", CAPABILITIES)
    }

    /// EXPUNGE response
    pub fn expunge(seq: u32) -> String {
        format!("* {} EXPUNGE\r\n", seq)
    }

    /// NAMESPACE response: personal, other users, shared
    pub fn namespace() -> String {
        "* NAMESPACE ((\"\" \"/\")) ((\"#Users/\" \"/\")) NIL\r\n".to_string()
    }

    /// LIST or LSUB response for a mailbox
    pub fn list(kind: &str, flags: &[&str], mailbox: &str) -> String {
        format!(
            "* {} ({}) \"/\" {}\r\n",
            kind,
            flags.join(" "),
            Self::quote(mailbox)
        )
    }

    pub fn mailbox_flags(flags: &[String]) -> String {
        format!("* FLAGS ({})\r\n", flags.join(" "))
    }

    pub fn permanent_flags(flags: &[String]) -> String {
        format!(
            "* OK [PERMANENTFLAGS ({} \\*)] Flags permitted\r\n",
            flags.join(" ")
        )
    }

    pub fn exists(count: usize) -> String {
        format!("* {} EXISTS\r\n", count)
    }

    pub fn recent(count: usize) -> String {
        format!("* {} RECENT\r\n", count)
    }

    pub fn unseen(first_unseen: u32) -> String {
        format!("* OK [UNSEEN {}] First unseen\r\n", first_unseen)
    }

    pub fn uid_validity(validity: u64) -> String {
        format!("* OK [UIDVALIDITY {}] UIDs valid\r\n", validity)
    }

    pub fn uid_next(next: u64) -> String {
        format!("* OK [UIDNEXT {}] Predicted next UID\r\n", next)
    }

    /// STATUS response
    pub fn status(mailbox: &str, items: &[(&str, u64)]) -> String {
        let items_str: Vec<String> = items.iter().map(|(k, v)| format!("{} {}", k, v)).collect();
        format!("* STATUS {} ({})\r\n", Self::quote(mailbox), items_str.join(" "))
    }

    /// SEARCH or SORT response
    pub fn numbers(kind: &str, numbers: &[u64]) -> String {
        let mut out = format!("* {}", kind);
        for n in numbers {
            out.push(' ');
            out.push_str(&n.to_string());
        }
        out.push_str("\r\n");
        out
    }

    /// ACL response
    pub fn acl(mailbox: &str, rights: &[(String, String)]) -> String {
        let mut out = format!("* ACL {}", Self::quote(mailbox));
        for (identifier, letters) in rights {
            out.push_str(&format!(" {} {}", Self::quote(identifier), letters));
        }
        out.push_str("\r\n");
        out
    }

    /// LISTRIGHTS response
    pub fn listrights(mailbox: &str, identifier: &str, rights: &[String]) -> String {
        let groups: Vec<String> = rights
            .iter()
            .map(|r| if r.is_empty() { "\"\"".to_string() } else { r.clone() })
            .collect();
        format!(
            "* LISTRIGHTS {} {} {}\r\n",
            Self::quote(mailbox),
            Self::quote(identifier),
            groups.join(" ")
        )
    }

    /// QUOTAROOT response
    pub fn quotaroot(mailbox: &str, root: &str) -> String {
        format!("* QUOTAROOT {} {}\r\n", Self::quote(mailbox), Self::quote(root))
    }

    /// QUOTA response; sizes are in KiB
    pub fn quota(root: &str, resources: &[(&str, u64, u64)]) -> String {
        let items: Vec<String> = resources
            .iter()
            .map(|(name, usage, limit)| format!("{} {} {}", name, usage, limit))
            .collect();
        format!("* QUOTA {} ({})\r\n", Self::quote(root), items.join(" "))
    }

    /// MYRIGHTS response
    pub fn myrights(mailbox: &str, rights: &str) -> String {
        let rights = if rights.is_empty() { "\"\"" } else { rights };
        format!("* MYRIGHTS {} {}\r\n", Self::quote(mailbox), rights)
    }

    /// Format flags for FETCH
    pub fn format_flags(flags: &MessageFlags) -> String {
        format!("({})", flags.to_imap().join(" "))
    }

    /// Format internal date for FETCH
    pub fn format_internal_date(dt: &DateTime<Utc>) -> String {
        format!("\"{}\"", dt.format("%d-%b-%Y %H:%M:%S %z"))
    }

    /// Format envelope for FETCH from the top-level header fields
    pub fn format_envelope(headers: &[(String, String)]) -> String {
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        let nstring = |v: Option<&str>| v.map(Self::quote).unwrap_or_else(|| "NIL".to_string());

        let from = Self::format_address_list(get("from"));
        let sender = get("sender").map_or_else(|| from.clone(), |v| Self::format_address_list(Some(v)));
        let reply_to =
            get("reply-to").map_or_else(|| from.clone(), |v| Self::format_address_list(Some(v)));

        // (date subject from sender reply-to to cc bcc in-reply-to message-id)
        format!(
            "({} {} {} {} {} {} {} {} {} {})",
            nstring(get("date")),
            nstring(get("subject")),
            from,
            sender,
            reply_to,
            Self::format_address_list(get("to")),
            Self::format_address_list(get("cc")),
            Self::format_address_list(get("bcc")),
            nstring(get("in-reply-to")),
            nstring(get("message-id")),
        )
    }

    /// Format address list for envelope
    fn format_address_list(addr: Option<&str>) -> String {
        let Some(addr) = addr else {
            return "NIL".to_string();
        };
        let entries: Vec<String> = addr
            .split(',')
            .filter_map(Self::parse_address)
            .map(|(name, email)| {
                let (local, domain) = email.split_once('@').unwrap_or((email.as_str(), ""));
                let name = if name.is_empty() {
                    "NIL".to_string()
                } else {
                    Self::quote(&name)
                };
                format!("({} NIL {} {})", name, Self::quote(local), Self::quote(domain))
            })
            .collect();
        if entries.is_empty() {
            "NIL".to_string()
        } else {
            format!("({})", entries.join(""))
        }
    }

    /// Parse email address into name and email parts
    fn parse_address(addr: &str) -> Option<(String, String)> {
        // Handle "Name <email>" format
        if let (Some(start), Some(end)) = (addr.find('<'), addr.rfind('>')) {
            if start < end {
                let name = addr[..start].trim().trim_matches('"').to_string();
                return Some((name, addr[start + 1..end].trim().to_string()));
            }
        }

        // Just email address
        let addr = addr.trim();
        if addr.contains('@') {
            return Some((String::new(), addr.to_string()));
        }

        None
    }

    /// Quote a string for IMAP (escape backslash and quote)
    pub fn quote(s: &str) -> String {
        format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
    }

    /// Continuation request
    pub fn continue_req() -> String {
        "+ \r\n".to_string()
    }
}
