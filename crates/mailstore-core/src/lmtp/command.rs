//! LMTP command parsing

/// LMTP command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LmtpCommand {
    Lhlo { domain: String },
    /// MAIL FROM; an empty path is the null sender
    Mail { from: String, size: Option<usize> },
    Rcpt { to: String },
    Data,
    Rset,
    Noop,
    Vrfy { address: String },
    Quit,
}

/// Parse a command line. The error is a complete reply without CRLF.
pub fn parse(line: &str) -> Result<LmtpCommand, String> {
    let line = line.trim();
    let (command, args) = match line.split_once(' ') {
        Some((command, args)) => (command.to_ascii_uppercase(), args.trim()),
        None => (line.to_ascii_uppercase(), ""),
    };

    let command = match command.as_str() {
        "LHLO" if !args.is_empty() => LmtpCommand::Lhlo {
            domain: args.to_string(),
        },
        "LHLO" => return Err("501 5.5.4 LHLO requires a domain".to_string()),
        "HELO" | "EHLO" => return Err("500 5.5.1 Use LHLO".to_string()),
        "MAIL" => {
            let (from, params) = parse_path(args, "FROM:")
                .ok_or_else(|| "501 5.1.7 Bad sender address syntax".to_string())?;
            let size = match param(params, "SIZE") {
                Some(value) => Some(
                    value
                        .parse()
                        .map_err(|_| "501 5.5.4 Invalid SIZE parameter".to_string())?,
                ),
                None => None,
            };
            LmtpCommand::Mail { from, size }
        }
        "RCPT" => match parse_path(args, "TO:") {
            Some((to, _)) if !to.is_empty() => LmtpCommand::Rcpt { to },
            _ => return Err("501 5.1.3 Bad recipient address syntax".to_string()),
        },
        "DATA" => LmtpCommand::Data,
        "RSET" => LmtpCommand::Rset,
        "NOOP" => LmtpCommand::Noop,
        "VRFY" if !args.is_empty() => LmtpCommand::Vrfy {
            address: args.trim_start_matches('<').trim_end_matches('>').to_string(),
        },
        "VRFY" => return Err("501 5.5.4 VRFY requires an address".to_string()),
        "QUIT" => LmtpCommand::Quit,
        _ => return Err("500 5.5.2 Command not recognized".to_string()),
    };
    Ok(command)
}

/// Split `FROM:<path> params` into the path and the parameter string
fn parse_path<'a>(args: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    if args.len() < prefix.len() || !args[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = args[prefix.len()..].trim_start();

    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        return Some((inner[..end].trim().to_string(), inner[end + 1..].trim()));
    }
    let mut parts = rest.splitn(2, ' ');
    let path = parts.next()?.to_string();
    Some((path, parts.next().unwrap_or("").trim()))
}

/// Value of an ESMTP `KEY=value` parameter
fn param<'a>(params: &'a str, key: &str) -> Option<&'a str> {
    params.split_whitespace().find_map(|p| {
        let (k, v) = p.split_once('=')?;
        k.eq_ignore_ascii_case(key).then_some(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse("MAIL FROM:<user@example.com>").unwrap(),
            LmtpCommand::Mail {
                from: "user@example.com".to_string(),
                size: None
            }
        );
        assert_eq!(
            parse("mail from: <user@example.com> SIZE=1024 BODY=8BITMIME").unwrap(),
            LmtpCommand::Mail {
                from: "user@example.com".to_string(),
                size: Some(1024)
            }
        );
        assert_eq!(
            parse("MAIL FROM:<>").unwrap(),
            LmtpCommand::Mail {
                from: String::new(),
                size: None
            }
        );
        assert!(parse("MAIL invalid").is_err());
        assert!(parse("MAIL FROM:<a@b> SIZE=lots").is_err());
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse("RCPT TO:<joe+work@example.com>").unwrap(),
            LmtpCommand::Rcpt {
                to: "joe+work@example.com".to_string()
            }
        );
        assert_eq!(
            parse("RCPT TO: joe@example.com").unwrap(),
            LmtpCommand::Rcpt {
                to: "joe@example.com".to_string()
            }
        );
        assert!(parse("RCPT TO:<>").is_err());
    }

    #[test]
    fn test_parse_other_commands() {
        assert_eq!(
            parse("LHLO client.example.org").unwrap(),
            LmtpCommand::Lhlo {
                domain: "client.example.org".to_string()
            }
        );
        assert_eq!(parse("data").unwrap(), LmtpCommand::Data);
        assert_eq!(parse("EHLO x").unwrap_err(), "500 5.5.1 Use LHLO");
        assert_eq!(parse("EXPN list").unwrap_err(), "500 5.5.2 Command not recognized");
    }
}
