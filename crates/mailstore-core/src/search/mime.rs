//! Read-only MIME part tree for content searches

use mail_parser::{Message, MessageParser, PartType};

/// One MIME part: its headers, decoded text if it is a text leaf, and
/// its children if it is a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub children: Vec<Part>,
}

impl Part {
    /// Parse a raw message. Returns `None` when nothing could be parsed.
    pub fn parse(raw: &[u8]) -> Option<Part> {
        let message = MessageParser::default().parse(raw)?;
        Some(Self::from_message(&message, 0))
    }

    fn from_message(message: &Message<'_>, id: usize) -> Part {
        let Some(part) = message.parts.get(id) else {
            return Part::default();
        };

        let headers = part
            .headers
            .iter()
            .map(|h| {
                let raw = message
                    .raw_message
                    .get(h.offset_start as usize..h.offset_end as usize)
                    .unwrap_or(b"");
                (h.name.as_str().to_string(), unfold(raw))
            })
            .collect();

        match &part.body {
            PartType::Text(text) | PartType::Html(text) => Part {
                headers,
                body: Some(text.to_string()),
                children: Vec::new(),
            },
            PartType::Multipart(ids) => Part {
                headers,
                body: None,
                children: ids
                    .iter()
                    .map(|child| Self::from_message(message, *child as usize))
                    .collect(),
            },
            PartType::Message(nested) => Part {
                headers,
                body: None,
                children: vec![Self::from_message(nested, 0)],
            },
            PartType::Binary(_) | PartType::InlineBinary(_) => Part {
                headers,
                body: None,
                children: Vec::new(),
            },
        }
    }

    /// Whether any text leaf below this part contains `needle`,
    /// case-insensitively.
    pub fn body_contains(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.walk(&mut |part| {
            part.body
                .as_deref()
                .map(|b| b.to_lowercase().contains(&needle))
                .unwrap_or(false)
        })
    }

    /// Whether any header or text leaf below this part contains `needle`.
    pub fn text_contains(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.walk(&mut |part| {
            part.headers
                .iter()
                .any(|(_, v)| v.to_lowercase().contains(&needle))
                || part
                    .body
                    .as_deref()
                    .map(|b| b.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
    }

    /// Depth-first, stopping at the first part `check` accepts.
    fn walk(&self, check: &mut dyn FnMut(&Part) -> bool) -> bool {
        if check(self) {
            return true;
        }
        self.children.iter().any(|child| child.walk(check))
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Join folded header lines and trim.
fn unfold(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Top-level header fields of a raw message, names lowercased.
pub fn top_level_headers(raw: &[u8]) -> Vec<(String, String)> {
    Part::parse(raw)
        .map(|p| {
            p.headers
                .into_iter()
                .map(|(n, v)| (n.to_ascii_lowercase(), v))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MULTIPART: &[u8] = b"From: Alice <alice@example.com>\r\n\
Subject: Quarterly\r\n\
 report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"xx\"\r\n\
\r\n\
--xx\r\n\
Content-Type: text/plain\r\n\
\r\n\
Numbers look GOOD this time.\r\n\
--xx\r\n\
Content-Type: application/octet-stream\r\n\
\r\n\
needle-in-binary\r\n\
--xx--\r\n";

    #[test]
    fn test_parse_tree() {
        let part = Part::parse(MULTIPART).unwrap();
        assert_eq!(part.header("subject"), Some("Quarterly report"));
        assert_eq!(part.children.len(), 2);
        assert!(part.body.is_none());
    }

    #[test]
    fn test_body_search_walks_children() {
        let part = Part::parse(MULTIPART).unwrap();
        assert!(part.body_contains("look good"));
        assert!(!part.body_contains("quarterly"));
        assert!(!part.body_contains("needle-in-binary"));
    }

    #[test]
    fn test_text_search_includes_headers() {
        let part = Part::parse(MULTIPART).unwrap();
        assert!(part.text_contains("quarterly"));
        assert!(part.text_contains("alice@example"));
        assert!(!part.text_contains("bob"));
    }

    #[test]
    fn test_single_part() {
        let raw = b"Subject: hi\r\n\r\nPlain body\r\n";
        let part = Part::parse(raw).unwrap();
        assert!(part.children.is_empty());
        assert!(part.body_contains("plain"));
        assert_eq!(
            top_level_headers(raw),
            vec![("subject".to_string(), "hi".to_string())]
        );
    }
}
