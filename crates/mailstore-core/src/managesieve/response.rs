//! ManageSieve response generation

/// ManageSieve response builder
pub struct SieveResponse;

impl SieveResponse {
    /// A quoted string, with `"` and `\` escaped
    pub fn quoted(value: &str) -> String {
        let mut out = String::with_capacity(value.len() + 2);
        out.push('"');
        for c in value.chars() {
            if c == '"' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    }

    pub fn ok() -> &'static str {
        "OK\r\n"
    }

    /// OK with a human-readable message
    pub fn ok_with(message: &str) -> String {
        format!("OK {}\r\n", Self::quoted(message))
    }

    pub fn no(message: &str) -> String {
        format!("NO {}\r\n", Self::quoted(message))
    }

    /// NO with a response code such as `QUOTA`
    pub fn no_code(code: &str, message: &str) -> String {
        format!("NO ({}) {}\r\n", code, Self::quoted(message))
    }

    pub fn bye(message: &str) -> String {
        format!("BYE {}\r\n", Self::quoted(message))
    }

    /// Capability listing, sent as the greeting and for CAPABILITY
    pub fn capabilities(implementation: &str, extensions: &str) -> String {
        format!(
            "\"IMPLEMENTATION\" {}\r\n\"SASL\" \"PLAIN\"\r\n\"SIEVE\" {}\r\nOK\r\n",
            Self::quoted(implementation),
            Self::quoted(extensions)
        )
    }

    /// One LISTSCRIPTS line
    pub fn listing(name: &str, active: bool) -> String {
        if active {
            format!("{} ACTIVE\r\n", Self::quoted(name))
        } else {
            format!("{}\r\n", Self::quoted(name))
        }
    }

    /// A script sent back as a literal, followed by OK
    pub fn script(out: &mut Vec<u8>, script: &str) {
        out.extend_from_slice(format!("{{{}}}\r\n", script.len()).as_bytes());
        out.extend_from_slice(script.as_bytes());
        out.extend_from_slice(b"\r\nOK\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_quoting() {
        assert_eq!(SieveResponse::quoted("plain"), "\"plain\"");
        assert_eq!(SieveResponse::quoted("a \"b\" \\c"), "\"a \\\"b\\\" \\\\c\"");
        assert_eq!(
            SieveResponse::no("Script not found."),
            "NO \"Script not found.\"\r\n"
        );
        assert_eq!(
            SieveResponse::no_code("QUOTA", "Quota exceeded"),
            "NO (QUOTA) \"Quota exceeded\"\r\n"
        );
    }

    #[test]
    fn test_capabilities_and_script() {
        assert_eq!(
            SieveResponse::capabilities("mailstore", "fileinto reject"),
            "\"IMPLEMENTATION\" \"mailstore\"\r\n\"SASL\" \"PLAIN\"\r\n\"SIEVE\" \"fileinto reject\"\r\nOK\r\n"
        );
        assert_eq!(SieveResponse::listing("work", true), "\"work\" ACTIVE\r\n");

        let mut out = Vec::new();
        SieveResponse::script(&mut out, "keep;");
        assert_eq!(out, b"{5}\r\nkeep;\r\nOK\r\n".to_vec());
    }
}
