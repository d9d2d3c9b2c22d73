//! SEARCH and SORT argument parsing

use super::parser::Token;
use crate::search::{SearchKey, SortCriterion, SortField};
use crate::sequence::SequenceSet;
use chrono::NaiveDate;
use mailstore_storage::predicate::{AgeOp, DateOp, FlagName, SizeOp};

/// Parse the search keys of a SEARCH command, with an optional leading
/// `CHARSET name`. Several keys form an implicit AND.
pub fn parse_search(tokens: &[Token]) -> Result<SearchKey, String> {
    let mut pos = 0;
    if tokens.first().map(|t| t.is_atom("CHARSET")).unwrap_or(false) {
        if tokens.get(1).and_then(Token::text).is_none() {
            return Err("missing charset".to_string());
        }
        pos = 2;
    }

    let mut keys = Vec::new();
    while pos < tokens.len() {
        keys.push(parse_key(tokens, &mut pos)?);
    }

    match keys.len() {
        0 => Err("missing search key".to_string()),
        1 => Ok(keys.remove(0)),
        _ => Ok(SearchKey::And(keys)),
    }
}

/// Parse a parenthesised SORT criteria list
pub fn parse_sort_criteria(tokens: &[Token]) -> Result<Vec<SortCriterion>, String> {
    let mut criteria = Vec::new();
    let mut reverse = false;
    for token in tokens {
        let atom = token.atom().ok_or_else(|| "invalid sort criterion".to_string())?;
        if atom.eq_ignore_ascii_case("REVERSE") {
            reverse = true;
            continue;
        }
        let field =
            SortField::parse(atom).ok_or_else(|| format!("invalid sort criterion {}", atom))?;
        criteria.push(SortCriterion { field, reverse });
        reverse = false;
    }
    if reverse || criteria.is_empty() {
        return Err("incomplete sort criteria".to_string());
    }
    Ok(criteria)
}

/// `d-Mon-yyyy` or `dd-Mon-yyyy`
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let mut parts = s.trim().splitn(3, '-');
    let day: u32 = parts.next()?.parse().ok()?;
    let month = match parts.next()?.to_ascii_lowercase().as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    let year = parts.next()?;
    if year.len() != 4 {
        return None;
    }
    NaiveDate::from_ymd_opt(year.parse().ok()?, month, day)
}

fn parse_key(tokens: &[Token], pos: &mut usize) -> Result<SearchKey, String> {
    let token = tokens
        .get(*pos)
        .ok_or_else(|| "missing search key".to_string())?;
    *pos += 1;

    let atom = match token {
        Token::List(inner) => {
            let mut inner_pos = 0;
            let mut keys = Vec::new();
            while inner_pos < inner.len() {
                keys.push(parse_key(inner, &mut inner_pos)?);
            }
            return match keys.len() {
                0 => Err("empty search group".to_string()),
                1 => Ok(keys.remove(0)),
                _ => Ok(SearchKey::And(keys)),
            };
        }
        Token::Atom(atom) => atom.to_ascii_uppercase(),
        _ => return Err("invalid search key".to_string()),
    };

    let mut text = |what: &str| -> Result<String, String> {
        let value = tokens
            .get(*pos)
            .and_then(Token::text)
            .ok_or_else(|| format!("missing {} argument", what))?;
        *pos += 1;
        Ok(value)
    };

    let key = match atom.as_str() {
        "ALL" => SearchKey::All,
        "ANSWERED" => SearchKey::Flag(FlagName::Answered, true),
        "DELETED" => SearchKey::Flag(FlagName::Deleted, true),
        "DRAFT" => SearchKey::Flag(FlagName::Draft, true),
        "FLAGGED" => SearchKey::Flag(FlagName::Flagged, true),
        "RECENT" => SearchKey::Flag(FlagName::Recent, true),
        "SEEN" => SearchKey::Flag(FlagName::Seen, true),
        "UNANSWERED" => SearchKey::Flag(FlagName::Answered, false),
        "UNDELETED" => SearchKey::Flag(FlagName::Deleted, false),
        "UNDRAFT" => SearchKey::Flag(FlagName::Draft, false),
        "UNFLAGGED" => SearchKey::Flag(FlagName::Flagged, false),
        "UNSEEN" => SearchKey::Flag(FlagName::Seen, false),
        "OLD" => SearchKey::Flag(FlagName::Recent, false),
        "NEW" => SearchKey::And(vec![
            SearchKey::Flag(FlagName::Recent, true),
            SearchKey::Flag(FlagName::Seen, false),
        ]),
        "KEYWORD" => SearchKey::Keyword(text("KEYWORD")?, true),
        "UNKEYWORD" => SearchKey::Keyword(text("UNKEYWORD")?, false),
        "BCC" | "CC" | "FROM" | "SUBJECT" | "TO" => {
            SearchKey::Header(atom.to_ascii_lowercase(), text(&atom)?)
        }
        "HEADER" => {
            let name = text("HEADER")?.to_ascii_lowercase();
            SearchKey::Header(name, text("HEADER")?)
        }
        "BODY" => SearchKey::Body(text("BODY")?),
        "TEXT" => SearchKey::Text(text("TEXT")?),
        "BEFORE" | "ON" | "SINCE" | "SENTBEFORE" | "SENTON" | "SENTSINCE" => {
            let raw = text(&atom)?;
            let date = parse_date(&raw).ok_or_else(|| format!("invalid date {}", raw))?;
            let op = match atom.trim_start_matches("SENT") {
                "BEFORE" => DateOp::Before,
                "ON" => DateOp::On,
                _ => DateOp::Since,
            };
            if atom.starts_with("SENT") {
                SearchKey::HeaderDate(op, date)
            } else {
                SearchKey::InternalDate(op, date)
            }
        }
        "LARGER" | "SMALLER" => {
            let raw = text(&atom)?;
            let size = raw.parse().map_err(|_| format!("invalid size {}", raw))?;
            let op = if atom == "LARGER" {
                SizeOp::Larger
            } else {
                SizeOp::Smaller
            };
            SearchKey::Size(op, size)
        }
        "YOUNGER" | "OLDER" => {
            let raw = text(&atom)?;
            let seconds = raw.parse().map_err(|_| format!("invalid interval {}", raw))?;
            let op = if atom == "YOUNGER" {
                AgeOp::Younger
            } else {
                AgeOp::Older
            };
            SearchKey::Age(op, seconds)
        }
        "UID" => {
            let raw = text("UID")?;
            SearchKey::Uid(SequenceSet::parse(&raw).ok_or_else(|| format!("invalid uid set {}", raw))?)
        }
        "NOT" => SearchKey::Not(Box::new(parse_key(tokens, pos)?)),
        "OR" => {
            let left = parse_key(tokens, pos)?;
            let right = parse_key(tokens, pos)?;
            SearchKey::Or(Box::new(left), Box::new(right))
        }
        other => SearchKey::Sequence(
            SequenceSet::parse(other).ok_or_else(|| format!("invalid search key {}", other))?,
        ),
    };
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::parser::tokenize;
    use pretty_assertions::assert_eq;

    fn search(s: &str) -> Result<SearchKey, String> {
        parse_search(&tokenize(s.as_bytes()).unwrap())
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date("5-Mar-2024"), NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(parse_date("05-mar-2024"), NaiveDate::from_ymd_opt(2024, 3, 5));
        assert_eq!(parse_date("31-Feb-2024"), None);
        assert_eq!(parse_date("5-March-2024"), None);
        assert_eq!(parse_date("5-Mar-24"), None);
    }

    #[test]
    fn test_simple_keys() {
        assert_eq!(search("UNSEEN").unwrap(), SearchKey::Flag(FlagName::Seen, false));
        assert_eq!(
            search("FROM joe SUBJECT \"hello world\"").unwrap(),
            SearchKey::And(vec![
                SearchKey::Header("from".into(), "joe".into()),
                SearchKey::Header("subject".into(), "hello world".into()),
            ])
        );
        assert_eq!(
            search("SENTON \"5-Mar-2024\"").unwrap(),
            SearchKey::HeaderDate(DateOp::On, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap())
        );
        assert_eq!(
            search("CHARSET UTF-8 1:3").unwrap(),
            SearchKey::Sequence(SequenceSet::Range(1, 3))
        );
    }

    #[test]
    fn test_composite_keys() {
        assert_eq!(
            search("OR SEEN (FLAGGED LARGER 100) NOT UID 4:*").unwrap(),
            SearchKey::And(vec![
                SearchKey::Or(
                    Box::new(SearchKey::Flag(FlagName::Seen, true)),
                    Box::new(SearchKey::And(vec![
                        SearchKey::Flag(FlagName::Flagged, true),
                        SearchKey::Size(SizeOp::Larger, 100),
                    ])),
                ),
                SearchKey::Not(Box::new(SearchKey::Uid(SequenceSet::Range(
                    4,
                    crate::sequence::LAST
                )))),
            ])
        );
    }

    #[test]
    fn test_invalid_searches() {
        assert!(search("").is_err());
        assert!(search("BOGUS").is_err());
        assert!(search("SINCE yesterday").is_err());
        assert!(search("OR SEEN").is_err());
        assert!(search("LARGER many").is_err());
    }

    #[test]
    fn test_sort_criteria() {
        let tokens = tokenize(b"REVERSE ARRIVAL SIZE").unwrap();
        assert_eq!(
            parse_sort_criteria(&tokens).unwrap(),
            vec![
                SortCriterion {
                    field: SortField::Arrival,
                    reverse: true
                },
                SortCriterion {
                    field: SortField::Size,
                    reverse: false
                },
            ]
        );
        assert!(parse_sort_criteria(&tokenize(b"REVERSE").unwrap()).is_err());
        assert!(parse_sort_criteria(&[]).is_err());
    }
}
