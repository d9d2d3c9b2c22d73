//! Delivery-time sorting
//!
//! A sort backend decides, per recipient, where an incoming message goes.
//! The `none` driver keeps everything in the target mailbox, the `sieve`
//! driver runs the recipient's active script.

mod sieve;

pub use sieve::{Script, SieveSort};

use async_trait::async_trait;
use mailstore_common::types::UserId;
use mailstore_common::Result;

/// Outcome of sorting one message for one recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortResult {
    /// File into the target mailbox
    pub keep: bool,
    /// Additional mailboxes to file into
    pub fileinto: Vec<String>,
    /// Addresses to forward to
    pub redirect: Vec<String>,
    /// Refuse delivery with this reason
    pub reject: Option<String>,
}

impl Default for SortResult {
    fn default() -> Self {
        Self::keep()
    }
}

impl SortResult {
    /// Plain delivery to the target mailbox
    pub fn keep() -> Self {
        Self {
            keep: true,
            fileinto: Vec::new(),
            redirect: Vec::new(),
            reject: None,
        }
    }

    /// Mailboxes the message ends up in, target first, without duplicates
    pub fn mailboxes(&self, target: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if self.keep && self.reject.is_none() {
            out.push(target.to_string());
        }
        if self.reject.is_none() {
            for mailbox in &self.fileinto {
                if !out.iter().any(|m| m == mailbox) {
                    out.push(mailbox.clone());
                }
            }
        }
        out
    }

    pub fn is_discarded(&self) -> bool {
        self.reject.is_none() && self.mailboxes("").is_empty() && self.redirect.is_empty()
    }
}

/// Per-recipient message sorting
#[async_trait]
pub trait SortBackend: Send + Sync {
    /// Driver name as written in the configuration
    fn name(&self) -> &'static str;

    /// Sieve extensions scripts may `require`, space separated
    fn extensions(&self) -> &'static str {
        ""
    }

    /// Check that a script is acceptable for `user`
    async fn validate(&self, user: UserId, script: &str) -> Result<()>;

    /// Decide what happens to `message` addressed to `user`, whose
    /// delivery target is `mailbox`
    async fn process(&self, user: UserId, message: &[u8], mailbox: &str) -> Result<SortResult>;
}

/// The `none` driver: every message goes to its target mailbox
#[derive(Debug, Default)]
pub struct KeepAll;

#[async_trait]
impl SortBackend for KeepAll {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn validate(&self, _user: UserId, _script: &str) -> Result<()> {
        Ok(())
    }

    async fn process(&self, _user: UserId, _message: &[u8], _mailbox: &str) -> Result<SortResult> {
        Ok(SortResult::keep())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mailboxes() {
        let mut result = SortResult::keep();
        assert_eq!(result.mailboxes("INBOX"), vec!["INBOX"]);

        result.fileinto = vec!["Lists".to_string(), "INBOX".to_string()];
        assert_eq!(result.mailboxes("INBOX"), vec!["INBOX", "Lists"]);

        result.reject = Some("no".to_string());
        assert!(result.mailboxes("INBOX").is_empty());
        assert!(!result.is_discarded());
    }

    #[tokio::test]
    async fn test_keep_all() {
        let result = KeepAll.process(1, b"Subject: x\r\n\r\n", "INBOX").await.unwrap();
        assert_eq!(result, SortResult::keep());
        assert!(!result.is_discarded());
    }
}
