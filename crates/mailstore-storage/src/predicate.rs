//! Search predicates pushed down to the storage backend
//!
//! The search engine evaluates most keys itself, but anything that needs
//! stored columns (dates, sizes, headers, flags) becomes a
//! [`SearchPredicate`] answered by the repository. SQL backends render a
//! predicate through a [`Dialect`], which supplies the handful of
//! fragments that differ between databases.

use chrono::NaiveDate;
use mailstore_common::types::MessageFlags;

/// Comparison against a calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOp {
    Before,
    On,
    Since,
}

impl DateOp {
    fn sql(self) -> &'static str {
        match self {
            DateOp::Before => "<",
            DateOp::On => "=",
            DateOp::Since => ">=",
        }
    }

    pub fn matches(self, day: NaiveDate, against: NaiveDate) -> bool {
        match self {
            DateOp::Before => day < against,
            DateOp::On => day == against,
            DateOp::Since => day >= against,
        }
    }
}

/// Comparison against the message size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeOp {
    Larger,
    Smaller,
}

impl SizeOp {
    pub fn matches(self, size: u64, against: u64) -> bool {
        match self {
            SizeOp::Larger => size > against,
            SizeOp::Smaller => size < against,
        }
    }
}

/// Comparison against the age of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeOp {
    /// Arrived at most this many seconds ago
    Younger,
    /// Arrived at least this many seconds ago
    Older,
}

/// Server-stored system flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagName {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Recent,
}

impl FlagName {
    pub fn column(self) -> &'static str {
        match self {
            FlagName::Seen => "seen",
            FlagName::Answered => "answered",
            FlagName::Flagged => "flagged",
            FlagName::Deleted => "deleted",
            FlagName::Draft => "draft",
            FlagName::Recent => "recent",
        }
    }

    pub fn get(self, flags: &MessageFlags) -> bool {
        match self {
            FlagName::Seen => flags.seen,
            FlagName::Answered => flags.answered,
            FlagName::Flagged => flags.flagged,
            FlagName::Deleted => flags.deleted,
            FlagName::Draft => flags.draft,
            FlagName::Recent => flags.recent,
        }
    }
}

/// A condition on stored message metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchPredicate {
    /// Day of the Date header
    HeaderDate { op: DateOp, date: NaiveDate },
    /// Day the server received the message
    InternalDate { op: DateOp, date: NaiveDate },
    /// Seconds since arrival
    Age { op: AgeOp, seconds: i64 },
    /// Header field containing `value`, case-insensitively. An empty
    /// value matches any message carrying the field.
    Header { name: String, value: String },
    Size { op: SizeOp, size: u64 },
    Flag { flag: FlagName, set: bool },
    Keyword { keyword: String, set: bool },
    /// Backend-specific fragment, passed through unchanged
    Raw(String),
}

/// Value bound to a rendered placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindValue {
    Text(String),
    Date(NaiveDate),
    Int(i64),
    Bool(bool),
}

/// SQL text plus the values for its placeholders, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPredicate {
    pub sql: String,
    pub binds: Vec<BindValue>,
}

/// Fragments that vary between SQL databases
pub trait Dialect: Send + Sync {
    /// Placeholder for the n-th bound value (1-based)
    fn placeholder(&self, n: usize) -> String;

    /// Truncate a timestamp expression to a date
    fn to_date(&self, expr: &str) -> String;

    fn current_timestamp(&self) -> &'static str;

    /// `expr` minus the number of seconds bound at `ph`
    fn seconds_before(&self, expr: &str, ph: &str) -> String;

    /// Case-insensitive LIKE
    fn ilike(&self, expr: &str, ph: &str) -> String;

    /// Regular expression match
    fn regex_match(&self, expr: &str, ph: &str) -> String;
}

/// PostgreSQL
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDialect;

impl Dialect for PgDialect {
    fn placeholder(&self, n: usize) -> String {
        format!("${}", n)
    }

    fn to_date(&self, expr: &str) -> String {
        format!("({})::date", expr)
    }

    fn current_timestamp(&self) -> &'static str {
        "NOW()"
    }

    fn seconds_before(&self, expr: &str, ph: &str) -> String {
        format!("{} - ({} * INTERVAL '1 second')", expr, ph)
    }

    fn ilike(&self, expr: &str, ph: &str) -> String {
        format!("{} ILIKE {}", expr, ph)
    }

    fn regex_match(&self, expr: &str, ph: &str) -> String {
        format!("{} ~* {}", expr, ph)
    }
}

/// Escape LIKE metacharacters so `value` matches literally.
pub fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

impl SearchPredicate {
    /// Render against the `messages m` table. Placeholders are numbered
    /// from `first`, so callers can bind their own values ahead of ours.
    pub fn render(&self, dialect: &dyn Dialect, first: usize) -> RenderedPredicate {
        let ph = |offset: usize| dialect.placeholder(first + offset);

        let (sql, binds) = match self {
            SearchPredicate::HeaderDate { op, date } => (
                format!("{} {} {}", dialect.to_date("m.sent_date"), op.sql(), ph(0)),
                vec![BindValue::Date(*date)],
            ),
            SearchPredicate::InternalDate { op, date } => (
                format!("{} {} {}", dialect.to_date("m.internal_date"), op.sql(), ph(0)),
                vec![BindValue::Date(*date)],
            ),
            SearchPredicate::Age { op, seconds } => {
                let cutoff = dialect.seconds_before(dialect.current_timestamp(), &ph(0));
                let cmp = match op {
                    AgeOp::Younger => ">=",
                    AgeOp::Older => "<=",
                };
                (
                    format!("m.internal_date {} {}", cmp, cutoff),
                    vec![BindValue::Int(*seconds)],
                )
            }
            SearchPredicate::Header { name, value } => {
                if value.is_empty() {
                    (
                        format!(
                            "EXISTS (SELECT 1 FROM message_headers h WHERE h.message_id = m.id AND h.name = {})",
                            ph(0)
                        ),
                        vec![BindValue::Text(name.to_ascii_lowercase())],
                    )
                } else {
                    (
                        format!(
                            "EXISTS (SELECT 1 FROM message_headers h WHERE h.message_id = m.id AND h.name = {} AND {})",
                            ph(0),
                            dialect.ilike("h.value", &ph(1))
                        ),
                        vec![
                            BindValue::Text(name.to_ascii_lowercase()),
                            BindValue::Text(format!("%{}%", escape_like(value))),
                        ],
                    )
                }
            }
            SearchPredicate::Size { op, size } => {
                let cmp = match op {
                    SizeOp::Larger => ">",
                    SizeOp::Smaller => "<",
                };
                (
                    format!("m.size {} {}", cmp, ph(0)),
                    vec![BindValue::Int(*size as i64)],
                )
            }
            SearchPredicate::Flag { flag, set } => (
                format!("m.{} = {}", flag.column(), ph(0)),
                vec![BindValue::Bool(*set)],
            ),
            SearchPredicate::Keyword { keyword, set } => (
                format!(
                    "{}EXISTS (SELECT 1 FROM message_keywords k WHERE k.message_id = m.id AND k.keyword = {})",
                    if *set { "" } else { "NOT " },
                    ph(0)
                ),
                vec![BindValue::Text(keyword.clone())],
            ),
            SearchPredicate::Raw(fragment) => (format!("({})", fragment), Vec::new()),
        };

        RenderedPredicate { sql, binds }
    }
}
