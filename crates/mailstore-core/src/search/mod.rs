//! Search and sort evaluation
//!
//! A search fills a result bitmap with one slot per message of the
//! selected mailbox, slot `msn - 1` telling whether the message matches.
//! Each key is evaluated under a [`Condition`]:
//!
//! - `None` evaluates every position and overwrites it,
//! - `And` evaluates only positions already true,
//! - `Not` evaluates only positions still false.
//!
//! `OR a b` is `a` followed by `b` under `Not`; `NOT k` evaluates `k` on a
//! scratch bitmap and inverts it. Keys that map to stored columns are
//! pushed to the message repository as one predicate, content keys fetch
//! and walk each candidate message.

mod key;
pub mod mime;
mod sort;

pub use key::{SearchKey, SortCriterion, SortField, Strategy};
pub use sort::sort;

use crate::mailbox::MailboxState;
use crate::ordered_set::OrderedSet;
use mailstore_common::types::{Msn, Uid};
use mailstore_common::{Error, Result};
use mailstore_storage::Store;
use mime::Part;
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// How a key combines with the bitmap it is evaluated into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    None,
    And,
    Not,
}

impl Condition {
    fn selects(self, current: bool) -> bool {
        match self {
            Condition::None => true,
            Condition::And => current,
            Condition::Not => !current,
        }
    }
}

/// Evaluate `key` against the selected mailbox into `result`.
///
/// `result` must have exactly one slot per message; otherwise the view is
/// stale and a `Sync` error is returned with `result` untouched. The
/// bitmap is also left untouched when evaluation fails part way.
pub async fn search(
    store: &Store,
    result: &mut [bool],
    key: &SearchKey,
    state: &mut MailboxState,
) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidQuery("empty search".to_string()));
    }
    if result.len() != state.exists() {
        return Err(Error::Sync(format!(
            "working set has {} entries, mailbox has {}",
            result.len(),
            state.exists()
        )));
    }

    let mut bits = result.to_vec();
    let evaluator = Evaluator {
        store,
        state: &*state,
    };
    evaluator.eval(key, Condition::None, &mut bits).await?;
    result.copy_from_slice(&bits);

    debug!(
        mailbox = %state.name,
        matches = bits.iter().filter(|b| **b).count(),
        "Search evaluated"
    );
    state.search = Some(key.clone());
    Ok(())
}

/// Matching MSNs of a bitmap, ascending
pub fn matching_msns(result: &[bool]) -> Vec<Msn> {
    result
        .iter()
        .enumerate()
        .filter(|(_, hit)| **hit)
        .map(|(idx, _)| (idx + 1) as Msn)
        .collect()
}

type EvalFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

struct Evaluator<'a> {
    store: &'a Store,
    state: &'a MailboxState,
}

impl<'a> Evaluator<'a> {
    fn eval<'b>(&'b self, key: &'b SearchKey, cond: Condition, bits: &'b mut [bool]) -> EvalFuture<'b> {
        Box::pin(async move {
            match key {
                SearchKey::And(keys) => {
                    if cond == Condition::And {
                        for k in keys {
                            self.eval(k, Condition::And, bits).await?;
                        }
                    } else {
                        let mut scratch = mask(bits, cond);
                        for k in keys {
                            self.eval(k, Condition::And, &mut scratch).await?;
                        }
                        merge(bits, cond, &scratch);
                    }
                    Ok(())
                }
                SearchKey::Or(a, b) => match cond {
                    Condition::None => {
                        self.eval(a, Condition::None, bits).await?;
                        self.eval(b, Condition::Not, bits).await
                    }
                    Condition::Not => {
                        self.eval(a, Condition::Not, bits).await?;
                        self.eval(b, Condition::Not, bits).await
                    }
                    Condition::And => {
                        let mut left = bits.to_vec();
                        self.eval(a, Condition::And, &mut left).await?;
                        let mut right: Vec<bool> =
                            bits.iter().zip(&left).map(|(b, l)| *b && !*l).collect();
                        self.eval(b, Condition::And, &mut right).await?;
                        for (slot, (l, r)) in bits.iter_mut().zip(left.iter().zip(&right)) {
                            *slot = *l || *r;
                        }
                        Ok(())
                    }
                },
                SearchKey::Not(inner) => {
                    let selected = mask(bits, cond);
                    let mut scratch = selected.clone();
                    self.eval(inner, Condition::And, &mut scratch).await?;
                    for ((slot, sel), hit) in bits.iter_mut().zip(&selected).zip(&scratch) {
                        if *sel {
                            *slot = !*hit;
                        }
                    }
                    Ok(())
                }
                _ => self.eval_leaf(key, cond, bits).await,
            }
        })
    }

    async fn eval_leaf(&self, key: &SearchKey, cond: Condition, bits: &mut [bool]) -> Result<()> {
        match key.strategy() {
            Strategy::State => {
                let exists = self.state.exists() as u64;
                let max_uid = self.state.uids().last().copied().unwrap_or(0);
                for (idx, slot) in bits.iter_mut().enumerate() {
                    if !cond.selects(*slot) {
                        continue;
                    }
                    let uid = self.state.uids()[idx];
                    *slot = match key {
                        SearchKey::All => true,
                        SearchKey::Sequence(set) => set.contains(idx as u64 + 1, exists),
                        SearchKey::Uid(set) => set.contains(uid, max_uid),
                        SearchKey::Flag(flag, set) => self
                            .state
                            .info(uid)
                            .map(|m| flag.get(&m.flags) == *set)
                            .unwrap_or(false),
                        SearchKey::Keyword(keyword, set) => self
                            .state
                            .info(uid)
                            .map(|m| m.flags.keywords.contains(keyword) == *set)
                            .unwrap_or(false),
                        _ => false,
                    };
                }
                Ok(())
            }
            Strategy::Storage => {
                let predicate = key
                    .predicate()
                    .ok_or_else(|| Error::Internal("key has no storage predicate".to_string()))?;
                let uids = self.store.messages.search(self.state.id, &predicate).await?;
                let hits = self.map_to_msns(&uids)?;
                for (idx, slot) in bits.iter_mut().enumerate() {
                    if cond.selects(*slot) {
                        *slot = hits.contains(&((idx + 1) as Msn));
                    }
                }
                Ok(())
            }
            Strategy::Content => {
                for idx in 0..bits.len() {
                    if !cond.selects(bits[idx]) {
                        continue;
                    }
                    let uid = self.state.uids()[idx];
                    let raw = self
                        .store
                        .messages
                        .fetch_raw(self.state.id, uid)
                        .await?
                        .ok_or_else(|| Error::Sync(format!("message {} is gone", uid)))?;
                    let part = Part::parse(&raw).unwrap_or_default();
                    bits[idx] = match key {
                        SearchKey::Body(needle) => part.body_contains(needle),
                        SearchKey::Text(needle) => part.text_contains(needle),
                        _ => false,
                    };
                }
                Ok(())
            }
            Strategy::Composite => Err(Error::Internal("composite key at leaf".to_string())),
        }
    }

    /// Map storage UIDs to MSNs; a UID the view does not know means the
    /// view is stale.
    fn map_to_msns(&self, uids: &[Uid]) -> Result<OrderedSet<Msn>> {
        let mut hits = OrderedSet::default();
        for uid in uids {
            let msn = self
                .state
                .msn_of(*uid)
                .map_err(|_| Error::Sync(format!("uid {} not in view", uid)))?;
            hits.add(msn);
        }
        Ok(hits)
    }
}

/// Positions selected by `cond`, as a fresh bitmap
fn mask(bits: &[bool], cond: Condition) -> Vec<bool> {
    bits.iter().map(|b| cond.selects(*b)).collect()
}

/// Write `scratch` back into the selected positions
fn merge(bits: &mut [bool], cond: Condition, scratch: &[bool]) {
    for (slot, value) in bits.iter_mut().zip(scratch) {
        if cond.selects(*slot) {
            *slot = *value;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sequence::SequenceSet;
    use chrono::{NaiveDate, TimeZone, Utc};
    use mailstore_common::types::{MailboxPermission, MessageFlags};
    use mailstore_storage::predicate::{DateOp, FlagName, SizeOp};
    use mailstore_storage::{MemoryStore, NewMessage};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    pub(crate) struct Fixture {
        pub backing: Arc<MemoryStore>,
        pub store: Store,
        pub state: MailboxState,
    }

    pub(crate) struct Msg {
        pub subject: &'static str,
        pub from: &'static str,
        pub day: u32,
        pub body: &'static str,
        pub flags: &'static [&'static str],
    }

    pub(crate) async fn fixture(messages: &[Msg]) -> Fixture {
        let backing = Arc::new(MemoryStore::new());
        let store = Store::memory(backing.clone());
        let user = store.users.create("joe", "").await.unwrap();
        let inbox = store
            .mailboxes
            .create(user.id, "INBOX", MailboxPermission::ReadWrite)
            .await
            .unwrap();

        for (i, m) in messages.iter().enumerate() {
            let sent = Utc.with_ymd_and_hms(2024, 3, m.day, 9, 0, 0).unwrap();
            let raw = format!(
                "From: {}\r\nSubject: {}\r\nDate: {}\r\n\r\n{}\r\n",
                m.from,
                m.subject,
                sent.to_rfc2822(),
                m.body
            );
            store
                .messages
                .append(NewMessage {
                    mailbox_id: inbox.id,
                    raw: raw.into_bytes(),
                    flags: MessageFlags::from_imap(m.flags),
                    internal_date: Utc.with_ymd_and_hms(2024, 4, 1, 0, i as u32, 0).unwrap(),
                    sent_date: Some(sent),
                    headers: vec![
                        ("from".to_string(), m.from.to_string()),
                        ("subject".to_string(), m.subject.to_string()),
                        ("date".to_string(), sent.to_rfc2822()),
                    ],
                })
                .await
                .unwrap();
        }

        let state = MailboxState::open(&store, inbox.id).await.unwrap();
        Fixture {
            backing,
            store,
            state,
        }
    }

    pub(crate) fn msg(subject: &'static str, day: u32) -> Msg {
        Msg {
            subject,
            from: "alice@example.com",
            day,
            body: "hello",
            flags: &[],
        }
    }

    async fn run(fx: &mut Fixture, key: SearchKey) -> Vec<Msn> {
        let mut result = vec![false; fx.state.exists()];
        search(&fx.store, &mut result, &key, &mut fx.state).await.unwrap();
        matching_msns(&result)
    }

    #[tokio::test]
    async fn test_header_date_on() {
        let mut fx = fixture(&[msg("a", 1), msg("b", 2), msg("c", 3)]).await;
        let key = SearchKey::HeaderDate(DateOp::On, NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(run(&mut fx, key).await, vec![2]);
    }

    #[tokio::test]
    async fn test_sync_error_leaves_result_untouched() {
        let mut fx = fixture(&[
            msg("a", 1),
            msg("b", 1),
            msg("c", 1),
            msg("d", 1),
            msg("e", 1),
            msg("f", 1),
        ])
        .await;
        assert_eq!(fx.state.exists(), 6);

        let mut result = vec![true, false, true, false, true];
        let err = search(&fx.store, &mut result, &SearchKey::All, &mut fx.state)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SYNC_ERROR");
        assert_eq!(result, vec![true, false, true, false, true]);
    }

    #[tokio::test]
    async fn test_empty_search_is_invalid() {
        let mut fx = fixture(&[msg("a", 1)]).await;
        let mut result = vec![false];
        let err = search(&fx.store, &mut result, &SearchKey::And(vec![]), &mut fx.state)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
    }

    #[tokio::test]
    async fn test_boolean_composition() {
        let mut fx = fixture(&[
            Msg { flags: &["\\Seen"], ..msg("invoice 1", 1) },
            msg("invoice 2", 2),
            Msg { flags: &["\\Seen"], ..msg("lunch", 3) },
            msg("party", 4),
        ])
        .await;

        let invoices = SearchKey::Header("subject".into(), "invoice".into());
        let seen = SearchKey::Flag(FlagName::Seen, true);

        let and = SearchKey::And(vec![invoices.clone(), seen.clone()]);
        assert_eq!(run(&mut fx, and).await, vec![1]);

        let or = SearchKey::Or(Box::new(invoices.clone()), Box::new(seen.clone()));
        assert_eq!(run(&mut fx, or).await, vec![1, 2, 3]);

        let not = SearchKey::Not(Box::new(invoices.clone()));
        assert_eq!(run(&mut fx, not).await, vec![3, 4]);

        // OR nested under AND, NOT nested under OR
        let nested = SearchKey::And(vec![
            SearchKey::Sequence(SequenceSet::Range(2, 4)),
            SearchKey::Or(
                Box::new(invoices.clone()),
                Box::new(SearchKey::Not(Box::new(seen))),
            ),
        ]);
        assert_eq!(run(&mut fx, nested).await, vec![2, 4]);

        let and_under_or = SearchKey::Or(
            Box::new(SearchKey::Header("subject".into(), "party".into())),
            Box::new(SearchKey::And(vec![
                invoices,
                SearchKey::Sequence(SequenceSet::Single(1)),
            ])),
        );
        assert_eq!(run(&mut fx, and_under_or).await, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_content_and_size_keys() {
        let mut fx = fixture(&[
            Msg { body: "the quick brown fox", ..msg("a", 1) },
            Msg { body: "lazy dog", ..msg("b", 1) },
        ])
        .await;

        assert_eq!(run(&mut fx, SearchKey::Body("QUICK".into())).await, vec![1]);
        assert_eq!(run(&mut fx, SearchKey::Text("subject".into())).await, vec![] as Vec<Msn>);
        assert_eq!(run(&mut fx, SearchKey::Text("example.com".into())).await, vec![1, 2]);
        assert_eq!(
            run(&mut fx, SearchKey::Size(SizeOp::Larger, 0)).await,
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_uid_keys_and_cache() {
        let mut fx = fixture(&[msg("a", 1), msg("b", 1), msg("c", 1)]).await;
        let last = *fx.state.uids().last().unwrap();
        let key = SearchKey::Uid(SequenceSet::Single(last));
        assert_eq!(run(&mut fx, key.clone()).await, vec![3]);
        assert_eq!(fx.state.search, Some(key));
    }

    #[tokio::test]
    async fn test_stale_view_is_sync_error() {
        let mut fx = fixture(&[msg("a", 1)]).await;
        fx.store
            .messages
            .append(NewMessage {
                mailbox_id: fx.state.id,
                raw: b"Subject: late\r\n\r\nx\r\n".to_vec(),
                flags: MessageFlags::default(),
                internal_date: Utc::now(),
                sent_date: None,
                headers: vec![("subject".to_string(), "late".to_string())],
            })
            .await
            .unwrap();

        let mut result = vec![false; 1];
        let err = search(
            &fx.store,
            &mut result,
            &SearchKey::Header("subject".into(), "".into()),
            &mut fx.state,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "SYNC_ERROR");
        assert_eq!(result, vec![false]);
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let mut fx = fixture(&[msg("a", 1)]).await;
        fx.backing.set_offline(true);
        let mut result = vec![false];
        let err = search(
            &fx.store,
            &mut result,
            &SearchKey::Size(SizeOp::Smaller, 10),
            &mut fx.state,
        )
        .await
        .unwrap_err();
        assert!(err.is_transient());
    }
}
