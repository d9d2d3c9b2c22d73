//! IMAP SORT ordering

use super::key::{SortCriterion, SortField};
use crate::mailbox::MailboxState;
use mailstore_common::types::{Msn, Timestamp, Uid};
use mailstore_common::{Error, Result};
use mailstore_storage::Store;
use std::collections::{BTreeMap, HashMap};

/// Sorts below every printable character, so shorter values order first.
const SEPARATOR: char = '\0';

/// Order the messages selected in `result` by `criteria`.
///
/// Each message gets one composite key built from its per-criterion
/// values followed by its MSN, so ties keep sequence order. The whole
/// ordering is reversed when the first criterion is `REVERSE`.
pub async fn sort(
    store: &Store,
    result: &[bool],
    criteria: &[SortCriterion],
    state: &mut MailboxState,
) -> Result<Vec<Msn>> {
    if result.len() != state.exists() {
        return Err(Error::Sync(format!(
            "working set has {} entries, mailbox has {}",
            result.len(),
            state.exists()
        )));
    }
    let Some(first) = criteria.first() else {
        return Err(Error::InvalidQuery("no sort criteria".to_string()));
    };

    let mut columns = Vec::with_capacity(criteria.len());
    for criterion in criteria {
        columns.push(column(store, state, criterion.field).await?);
    }

    let mut ordered: BTreeMap<String, Msn> = BTreeMap::new();
    for (idx, uid) in state.uids().iter().enumerate() {
        if !result[idx] {
            continue;
        }
        let msn = (idx + 1) as Msn;
        let mut key = String::new();
        for column in &columns {
            key.push_str(column.get(uid).map(String::as_str).unwrap_or(""));
            key.push(SEPARATOR);
        }
        key.push_str(&msn_suffix(msn));
        ordered.insert(key, msn);
    }

    let mut msns: Vec<Msn> = ordered.into_values().collect();
    if first.reverse {
        msns.reverse();
    }
    state.sorted = Some(msns.clone());
    Ok(msns)
}

/// Fixed-width MSN key suffix; ten digits hold every `u32`
fn msn_suffix(msn: Msn) -> String {
    format!("{:010}", msn)
}

/// Sort values of one field for every message in view
async fn column(store: &Store, state: &MailboxState, field: SortField) -> Result<HashMap<Uid, String>> {
    let header = |name: &'static str| async move {
        store.messages.header_values(state.id, name).await
    };

    Ok(match field {
        SortField::Arrival => state
            .uids()
            .iter()
            .filter_map(|uid| state.info(*uid).map(|m| (*uid, timestamp_key(m.internal_date))))
            .collect(),
        SortField::Size => state
            .uids()
            .iter()
            .filter_map(|uid| state.info(*uid).map(|m| (*uid, format!("{:020}", m.size))))
            .collect(),
        SortField::Subject => header("subject")
            .await?
            .into_iter()
            .map(|(uid, v)| (uid, base_subject(&v)))
            .collect(),
        SortField::From => address_column(header("from").await?),
        SortField::To => address_column(header("to").await?),
        SortField::Cc => address_column(header("cc").await?),
        SortField::Date => {
            let sent: HashMap<Uid, String> = header("date")
                .await?
                .into_iter()
                .filter_map(|(uid, v)| {
                    chrono::DateTime::parse_from_rfc2822(v.trim())
                        .ok()
                        .map(|d| (uid, timestamp_key(d.with_timezone(&chrono::Utc))))
                })
                .collect();
            state
                .uids()
                .iter()
                .filter_map(|uid| {
                    sent.get(uid)
                        .cloned()
                        .or_else(|| state.info(*uid).map(|m| timestamp_key(m.internal_date)))
                        .map(|k| (*uid, k))
                })
                .collect()
        }
    })
}

fn address_column(values: Vec<(Uid, String)>) -> HashMap<Uid, String> {
    values
        .into_iter()
        .map(|(uid, v)| (uid, mailbox_of(&v)))
        .collect()
}

/// Fixed-width key that orders like the timestamp, negatives included
fn timestamp_key(ts: Timestamp) -> String {
    format!("{:020}", (ts.timestamp() as u64) ^ (1 << 63))
}

/// Subject with reply and forward prefixes removed, lowercased
pub fn base_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_ascii_lowercase();
        let stripped = ["re:", "fwd:", "fw:"]
            .iter()
            .find(|p| lower.starts_with(*p))
            .map(|p| s[p.len()..].trim_start());
        match stripped {
            Some(rest) => s = rest,
            None => break,
        }
    }
    s.to_lowercase()
}

/// Local part of the first address in a header value, lowercased
pub fn mailbox_of(value: &str) -> String {
    let first = value.split(',').next().unwrap_or("");
    let addr = match (first.find('<'), first.rfind('>')) {
        (Some(start), Some(end)) if start < end => &first[start + 1..end],
        _ => first,
    };
    addr.trim()
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::tests::{fixture, msg, Msg};
    use pretty_assertions::assert_eq;

    fn by(field: SortField, reverse: bool) -> SortCriterion {
        SortCriterion { field, reverse }
    }

    #[test]
    fn test_normalizers() {
        assert_eq!(base_subject("Re: FWD: Lunch"), "lunch");
        assert_eq!(base_subject("Rebooting"), "rebooting");
        assert_eq!(mailbox_of("Alice Smith <Alice@example.com>, bob@x"), "alice");
        assert_eq!(mailbox_of("carol@example.com"), "carol");
    }

    #[test]
    fn test_msn_suffix_orders_every_msn() {
        assert_eq!(msn_suffix(7), "0000000007");
        assert_eq!(msn_suffix(Msn::MAX), "4294967295");
        assert!(msn_suffix(999_999_999) < msn_suffix(1_000_000_000));
    }

    #[tokio::test]
    async fn test_sort_by_subject_keeps_ties_in_sequence_order() {
        let mut fx = fixture(&[
            msg("Re: banana", 1),
            msg("apple", 1),
            msg("cherry", 1),
            msg("banana", 1),
        ])
        .await;
        let all = vec![true; 4];
        let order = sort(&fx.store, &all, &[by(SortField::Subject, false)], &mut fx.state)
            .await
            .unwrap();
        assert_eq!(order, vec![2, 1, 4, 3]);
        assert_eq!(fx.state.sorted, Some(order));
    }

    #[tokio::test]
    async fn test_reverse_date_and_selection() {
        let mut fx = fixture(&[msg("a", 1), msg("b", 3), msg("c", 2), msg("d", 4)]).await;
        let selected = vec![true, true, true, false];
        let order = sort(&fx.store, &selected, &[by(SortField::Date, true)], &mut fx.state)
            .await
            .unwrap();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_reverse_puts_ties_in_descending_sequence_order() {
        let mut fx = fixture(&[msg("b", 1), msg("a", 1), msg("b", 1), msg("a", 1)]).await;
        let order = sort(&fx.store, &[true; 4], &[by(SortField::Subject, true)], &mut fx.state)
            .await
            .unwrap();
        assert_eq!(order, vec![3, 1, 4, 2]);
    }

    #[tokio::test]
    async fn test_secondary_criterion() {
        let mut fx = fixture(&[
            Msg { from: "Zed <zed@example.com>", ..msg("same", 1) },
            Msg { from: "amy@example.com", ..msg("same", 1) },
            Msg { from: "bo@example.com", ..msg("other", 1) },
        ])
        .await;
        let order = sort(
            &fx.store,
            &[true; 3],
            &[by(SortField::Subject, false), by(SortField::From, false)],
            &mut fx.state,
        )
        .await
        .unwrap();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_sort_rejects_bad_input() {
        let mut fx = fixture(&[msg("a", 1), msg("b", 1)]).await;
        let err = sort(&fx.store, &[true], &[by(SortField::Size, false)], &mut fx.state)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SYNC_ERROR");

        let err = sort(&fx.store, &[true, true], &[], &mut fx.state)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
    }
}
