//! Outbound SMTP relay for alias forwards and script redirects

use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use mailstore_common::config::RelayConfig;
use mailstore_common::{Error, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of handing a message to the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayResult {
    Sent,
    /// Worth retrying later
    TemporaryFailure { error: String },
    /// Refused for good
    PermanentFailure { error: String },
}

/// Sends messages to addresses outside the store
#[async_trait]
pub trait Relay: Send + Sync {
    fn name(&self) -> &'static str;

    /// Send `raw` unchanged. An empty `sender` is the null reverse-path.
    async fn send(&self, sender: &str, recipients: &[String], raw: &[u8]) -> RelayResult;
}

/// Relay through a smarthost over SMTP
pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpRelay {
    /// The relay described by `config`, or `None` when no host is set
    pub fn from_config(config: &RelayConfig) -> Result<Option<Self>> {
        let host = match config.host.as_deref() {
            Some(host) if !host.trim().is_empty() => host.trim(),
            _ => return Ok(None),
        };

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| Error::Config(format!("Invalid relay host {}: {}", host, e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };

        let mut builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Some(Self {
            transport: builder.build(),
            host: host.to_string(),
        }))
    }
}

/// SMTP envelope for a relayed message
fn envelope(sender: &str, recipients: &[String]) -> std::result::Result<Envelope, String> {
    let sender = sender.trim().trim_start_matches('<').trim_end_matches('>');
    let from = if sender.is_empty() {
        None
    } else {
        Some(
            sender
                .parse::<Address>()
                .map_err(|e| format!("bad sender {}: {}", sender, e))?,
        )
    };
    let to = recipients
        .iter()
        .map(|r| {
            r.parse::<Address>()
                .map_err(|e| format!("bad recipient {}: {}", r, e))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Envelope::new(from, to).map_err(|e| e.to_string())
}

#[async_trait]
impl Relay for SmtpRelay {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, sender: &str, recipients: &[String], raw: &[u8]) -> RelayResult {
        let envelope = match envelope(sender, recipients) {
            Ok(envelope) => envelope,
            Err(error) => return RelayResult::PermanentFailure { error },
        };

        match self.transport.send_raw(&envelope, raw).await {
            Ok(response) => {
                debug!(relay = %self.host, code = %response.code(), "Relay accepted message");
                RelayResult::Sent
            }
            Err(e) if e.is_permanent() => {
                warn!(relay = %self.host, error = %e, "Relay refused message");
                RelayResult::PermanentFailure {
                    error: e.to_string(),
                }
            }
            Err(e) => {
                warn!(relay = %self.host, error = %e, "Relay failed");
                RelayResult::TemporaryFailure {
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_no_host_means_no_relay() {
        assert!(SmtpRelay::from_config(&RelayConfig::default()).unwrap().is_none());

        let config = RelayConfig {
            host: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(SmtpRelay::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_configured_relay() {
        let config = RelayConfig {
            host: Some("smtp.example.com".to_string()),
            port: 2525,
            ..Default::default()
        };
        let relay = SmtpRelay::from_config(&config).unwrap().unwrap();
        assert_eq!(relay.name(), "smtp");
        assert_eq!(relay.host, "smtp.example.com");
    }

    #[tokio::test]
    async fn test_bad_addresses_fail_permanently() {
        let config = RelayConfig {
            host: Some("127.0.0.1".to_string()),
            port: 1,
            ..Default::default()
        };
        let relay = SmtpRelay::from_config(&config).unwrap().unwrap();
        let result = relay
            .send("a@example.com", &["not an address".to_string()], b"x")
            .await;
        assert!(matches!(result, RelayResult::PermanentFailure { .. }));
    }

    #[test]
    fn test_envelope() {
        let env = envelope("<>", &["far@elsewhere.test".to_string()]).unwrap();
        assert!(env.from().is_none());
        assert_eq!(env.to().len(), 1);

        let env = envelope("<a@example.org>", &["far@elsewhere.test".to_string()]).unwrap();
        assert_eq!(env.from().map(|a| a.to_string()), Some("a@example.org".to_string()));

        assert!(envelope("a@example.org", &[]).is_err());
    }
}
