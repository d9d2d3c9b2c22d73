//! Search key tree

use crate::sequence::SequenceSet;
use chrono::NaiveDate;
use mailstore_storage::predicate::{AgeOp, DateOp, FlagName, SearchPredicate, SizeOp};

/// One node of a parsed SEARCH expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKey {
    All,
    /// Every key must match
    And(Vec<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    Not(Box<SearchKey>),
    /// By MSN
    Sequence(SequenceSet),
    /// By UID
    Uid(SequenceSet),
    Flag(FlagName, bool),
    Keyword(String, bool),
    /// SENTBEFORE / SENTON / SENTSINCE
    HeaderDate(DateOp, NaiveDate),
    /// BEFORE / ON / SINCE
    InternalDate(DateOp, NaiveDate),
    /// YOUNGER / OLDER, in seconds
    Age(AgeOp, i64),
    /// Header field containing a string
    Header(String, String),
    Size(SizeOp, u64),
    /// Any body text part containing a string
    Body(String),
    /// Headers or body containing a string
    Text(String),
    /// Backend SQL fragment
    Raw(String),
}

/// Where a key is evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// From the mailbox state alone
    State,
    /// By one query against the message repository
    Storage,
    /// By fetching and walking each candidate message
    Content,
    /// By combining children
    Composite,
}

impl SearchKey {
    pub fn strategy(&self) -> Strategy {
        match self {
            SearchKey::All
            | SearchKey::Sequence(_)
            | SearchKey::Uid(_)
            | SearchKey::Flag(..)
            | SearchKey::Keyword(..) => Strategy::State,
            SearchKey::HeaderDate(..)
            | SearchKey::InternalDate(..)
            | SearchKey::Age(..)
            | SearchKey::Header(..)
            | SearchKey::Size(..)
            | SearchKey::Raw(_) => Strategy::Storage,
            SearchKey::Body(_) | SearchKey::Text(_) => Strategy::Content,
            SearchKey::And(_) | SearchKey::Or(..) | SearchKey::Not(_) => Strategy::Composite,
        }
    }

    /// The storage predicate for a storage-evaluated key
    pub fn predicate(&self) -> Option<SearchPredicate> {
        Some(match self {
            SearchKey::HeaderDate(op, date) => SearchPredicate::HeaderDate { op: *op, date: *date },
            SearchKey::InternalDate(op, date) => {
                SearchPredicate::InternalDate { op: *op, date: *date }
            }
            SearchKey::Age(op, seconds) => SearchPredicate::Age {
                op: *op,
                seconds: *seconds,
            },
            SearchKey::Header(name, value) => SearchPredicate::Header {
                name: name.clone(),
                value: value.clone(),
            },
            SearchKey::Size(op, size) => SearchPredicate::Size { op: *op, size: *size },
            SearchKey::Raw(fragment) => SearchPredicate::Raw(fragment.clone()),
            _ => return None,
        })
    }

    /// An expression with nothing to evaluate
    pub fn is_empty(&self) -> bool {
        matches!(self, SearchKey::And(keys) if keys.is_empty())
    }
}

/// IMAP SORT criteria (RFC 5256)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Arrival,
    Cc,
    Date,
    From,
    Size,
    Subject,
    To,
}

impl SortField {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_uppercase().as_str() {
            "ARRIVAL" => SortField::Arrival,
            "CC" => SortField::Cc,
            "DATE" => SortField::Date,
            "FROM" => SortField::From,
            "SIZE" => SortField::Size,
            "SUBJECT" => SortField::Subject,
            "TO" => SortField::To,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortCriterion {
    pub field: SortField,
    pub reverse: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy() {
        assert_eq!(SearchKey::All.strategy(), Strategy::State);
        assert_eq!(
            SearchKey::Header("subject".into(), "x".into()).strategy(),
            Strategy::Storage
        );
        assert_eq!(SearchKey::Body("x".into()).strategy(), Strategy::Content);
        assert_eq!(
            SearchKey::Not(Box::new(SearchKey::All)).strategy(),
            Strategy::Composite
        );
    }

    #[test]
    fn test_predicate_only_for_storage_keys() {
        assert!(SearchKey::Size(SizeOp::Larger, 10).predicate().is_some());
        assert!(SearchKey::Flag(FlagName::Seen, true).predicate().is_none());
        assert!(SearchKey::And(vec![]).is_empty());
        assert!(!SearchKey::All.is_empty());
    }
}
