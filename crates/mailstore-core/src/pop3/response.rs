//! POP3 Response generation
//!
//! Generates POP3 response strings for client communication.

/// POP3 Response builder
pub struct Pop3Response;

impl Pop3Response {
    /// Server greeting
    pub fn greeting(banner: &str) -> String {
        format!("+OK {}\r\n", banner)
    }

    /// Positive response
    pub fn ok(message: &str) -> String {
        format!("+OK {}\r\n", message)
    }

    /// Negative response
    pub fn err(message: &str) -> String {
        format!("-ERR {}\r\n", message)
    }

    /// STAT response
    pub fn stat(count: usize, size: u64) -> String {
        format!("+OK {} {}\r\n", count, size)
    }

    /// LIST response header
    pub fn list_header(count: usize, size: u64) -> String {
        format!("+OK {} messages ({} octets)\r\n", count, size)
    }

    /// Scan listing for a single message, or one line of a multi-line
    /// LIST or UIDL answer
    pub fn listing(msg: u32, value: impl std::fmt::Display) -> String {
        format!("{} {}\r\n", msg, value)
    }

    /// CAPA response
    pub fn capabilities() -> String {
        "+OK Capability list follows\r\n\
         USER\r\n\
         TOP\r\n\
         UIDL\r\n\
         RESP-CODES\r\n\
         PIPELINING\r\n\
         IMPLEMENTATION mailstore\r\n\
         .\r\n"
            .to_string()
    }

    /// Multi-line terminator
    pub fn terminator() -> &'static str {
        ".\r\n"
    }

    /// Append `data` as the body of a multi-line response: lines are
    /// CRLF-terminated and byte-stuffed, and the terminator follows.
    pub fn multiline(out: &mut Vec<u8>, data: &[u8]) {
        if !data.is_empty() {
            let data = data.strip_suffix(b"\n").unwrap_or(data);
            for line in data.split(|b| *b == b'\n') {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line.first() == Some(&b'.') {
                    out.push(b'.');
                }
                out.extend_from_slice(line);
                out.extend_from_slice(b"\r\n");
            }
        }
        out.extend_from_slice(Self::terminator().as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_greeting() {
        let greeting = Pop3Response::greeting("mail.example.com mailstore POP3 ready");
        assert_eq!(greeting, "+OK mail.example.com mailstore POP3 ready\r\n");
    }

    #[test]
    fn test_ok_err() {
        assert_eq!(Pop3Response::ok("Success"), "+OK Success\r\n");
        assert_eq!(Pop3Response::err("Failed"), "-ERR Failed\r\n");
        assert_eq!(Pop3Response::stat(5, 1000), "+OK 5 1000\r\n");
        assert_eq!(Pop3Response::listing(2, 120), "2 120\r\n");
    }

    #[test]
    fn test_multiline_byte_stuffing() {
        let mut out = Vec::new();
        Pop3Response::multiline(&mut out, b"Subject: x\r\n\r\n.hidden\nlast");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Subject: x\r\n\r\n..hidden\r\nlast\r\n.\r\n"
        );

        let mut out = Vec::new();
        Pop3Response::multiline(&mut out, b"");
        assert_eq!(out, b".\r\n".to_vec());
    }
}
