//! Local delivery: recipient resolution, sorting and mailbox insertion

use crate::acl;
use crate::auth::AuthBackend;
use crate::quota::Quota;
use crate::relay::{Relay, RelayResult};
use crate::search::mime::top_level_headers;
use crate::sort::SortBackend;
use chrono::Utc;
use mailstore_common::config::DeliveryConfig;
use mailstore_common::types::{
    AclRight, EmailAddress, MailboxId, MailboxPermission, MessageFlags, UserId,
};
use mailstore_common::{Error, Result};
use mailstore_storage::{Mailbox, NewMessage, Store};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// DSN status class (RFC 3463)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DsnClass {
    Success = 2,
    TempFail = 4,
    Fail = 5,
}

/// Enhanced status code, `class.subject.detail`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsnStatus {
    pub class: DsnClass,
    pub subject: u8,
    pub detail: u8,
}

impl DsnStatus {
    pub const fn new(class: DsnClass, subject: u8, detail: u8) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    /// 2.1.5 destination address valid
    pub const fn valid() -> Self {
        Self::new(DsnClass::Success, 1, 5)
    }

    /// 2.0.0 delivered
    pub const fn delivered() -> Self {
        Self::new(DsnClass::Success, 0, 0)
    }

    /// 5.1.1 bad destination mailbox address
    pub const fn unknown_user() -> Self {
        Self::new(DsnClass::Fail, 1, 1)
    }

    /// 4.3.0 mail system unavailable
    pub const fn unavailable() -> Self {
        Self::new(DsnClass::TempFail, 3, 0)
    }

    /// 5.7.1 delivery not authorized, message refused
    pub const fn refused() -> Self {
        Self::new(DsnClass::Fail, 7, 1)
    }

    /// 5.3.4 message too big for system
    pub const fn too_big() -> Self {
        Self::new(DsnClass::Fail, 3, 4)
    }

    /// 5.4.4 unable to route
    pub const fn no_route() -> Self {
        Self::new(DsnClass::Fail, 4, 4)
    }

    /// 5.2.2 mailbox full
    pub const fn over_quota() -> Self {
        Self::new(DsnClass::Fail, 2, 2)
    }

    /// 4.4.1 no answer from host
    pub const fn no_answer() -> Self {
        Self::new(DsnClass::TempFail, 4, 1)
    }

    pub fn is_success(&self) -> bool {
        self.class == DsnClass::Success
    }

    /// Reply code that carries this status
    pub fn reply_code(&self) -> u16 {
        match self.class {
            DsnClass::Success => 250,
            DsnClass::TempFail => 451,
            DsnClass::Fail => 550,
        }
    }

    pub fn description(&self) -> &'static str {
        match (self.class, self.subject, self.detail) {
            (DsnClass::Success, 1, 5) => "Destination address valid",
            (DsnClass::Success, _, _) => "Delivered",
            (_, 1, 1) => "Bad destination mailbox address",
            (_, 2, 2) => "Mailbox full",
            (_, 3, 0) => "Mail system unavailable",
            (_, 3, 4) => "Message too big for system",
            (_, 4, 1) => "No answer from host",
            (_, 4, 4) => "Unable to route",
            (_, 4, _) => "Network or routing failure",
            (_, 7, 1) => "Delivery not authorized, message refused",
            _ => "Delivery failed",
        }
    }

    /// The least favourable of two statuses: temporary beats permanent
    /// failure, which beats success.
    pub fn worst(self, other: DsnStatus) -> DsnStatus {
        let rank = |s: &DsnStatus| match s.class {
            DsnClass::TempFail => 2,
            DsnClass::Fail => 1,
            DsnClass::Success => 0,
        };
        if rank(&other) > rank(&self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for DsnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class as u8, self.subject, self.detail)
    }
}

/// One local mailbox owner a recipient maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user_id: UserId,
    /// Mailbox named by a `+detail`, if any
    pub mailbox: Option<String>,
}

/// A resolved envelope recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub targets: Vec<Target>,
    /// Non-local addresses an alias expanded to
    pub forwards: Vec<String>,
    pub status: DsnStatus,
}

impl Recipient {
    fn unknown(address: &str) -> Self {
        Self {
            address: address.to_string(),
            targets: Vec::new(),
            forwards: Vec::new(),
            status: DsnStatus::unknown_user(),
        }
    }
}

/// Resolves recipients and files messages into their mailboxes
pub struct Delivery {
    store: Store,
    auth: Arc<dyn AuthBackend>,
    sort: Arc<dyn SortBackend>,
    relay: Option<Arc<dyn Relay>>,
    config: DeliveryConfig,
}

impl Delivery {
    pub fn new(
        store: Store,
        auth: Arc<dyn AuthBackend>,
        sort: Arc<dyn SortBackend>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            auth,
            sort,
            relay: None,
            config,
        }
    }

    /// Send forwards and redirects to non-local addresses through `relay`.
    /// Without one they fail with 5.4.4.
    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Map an envelope address to local users.
    ///
    /// Tried in order: alias, alias without `+detail`, username, username
    /// without `+detail` (delivering to the detail mailbox), `@domain`
    /// catch-alls from the full domain up through its parents, and the
    /// `user@` catch-all. Unknown addresses get 5.1.1.
    pub async fn resolve(&self, address: &str) -> Result<Recipient> {
        let address = address.trim().trim_start_matches('<').trim_end_matches('>');
        let mut recipient = Recipient::unknown(address);
        let parsed = EmailAddress::parse(address);

        if self.expand_alias(address, None, &mut recipient).await? {
            debug!(address = %address, "Delivering as an alias");
        } else if let Some((stripped, detail)) = parsed.as_ref().and_then(strip_detail) {
            if self.expand_alias(&stripped, Some(&detail), &mut recipient).await? {
                debug!(address = %address, "Delivering as an alias with mailbox");
            } else if let Some(user_id) = self.auth.get_user_id(address).await? {
                recipient.targets.push(Target {
                    user_id,
                    mailbox: None,
                });
            } else if let Some(user_id) = self.auth.get_user_id(&stripped).await? {
                debug!(address = %address, mailbox = %detail, "Delivering as a username with mailbox");
                recipient.targets.push(Target {
                    user_id,
                    mailbox: Some(detail),
                });
            }
        } else if let Some(user_id) = self.auth.get_user_id(address).await? {
            debug!(address = %address, "Delivering as a username");
            recipient.targets.push(Target {
                user_id,
                mailbox: None,
            });
        }

        if recipient.targets.is_empty() && recipient.forwards.is_empty() {
            if let Some(email) = &parsed {
                for catchall in domain_catchalls(&email.domain) {
                    if self.expand_alias(&catchall, None, &mut recipient).await? {
                        debug!(address = %address, catchall = %catchall, "Delivering as a domain catch-all");
                        break;
                    }
                }
                if recipient.targets.is_empty() && recipient.forwards.is_empty() {
                    let userpart = format!("{}@", email.local);
                    if self.expand_alias(&userpart, None, &mut recipient).await? {
                        debug!(address = %address, "Delivering as a userpart catch-all");
                    }
                }
            }
        }

        if !recipient.targets.is_empty() || !recipient.forwards.is_empty() {
            recipient.status = DsnStatus::valid();
        } else {
            info!(address = %address, "Unknown recipient");
        }
        Ok(recipient)
    }

    /// Add the expansion of `alias` to `recipient`. Returns whether the
    /// alias exists.
    async fn expand_alias(
        &self,
        alias: &str,
        detail: Option<&str>,
        recipient: &mut Recipient,
    ) -> Result<bool> {
        let deliver_to = self.store.aliases.resolve(alias).await?;
        if deliver_to.is_empty() {
            return Ok(false);
        }
        for entry in deliver_to {
            match self.auth.get_user_id(&entry).await? {
                Some(user_id) => recipient.targets.push(Target {
                    user_id,
                    mailbox: detail.map(str::to_string),
                }),
                None => recipient.forwards.push(entry),
            }
        }
        Ok(true)
    }

    /// Deliver one message to every target of a resolved recipient.
    /// `sender` is the envelope reverse-path, used when relaying.
    pub async fn deliver(&self, sender: &str, recipient: &Recipient, raw: &[u8]) -> DsnStatus {
        if !recipient.status.is_success() {
            return recipient.status;
        }

        let mut status: Option<DsnStatus> = None;
        if !recipient.forwards.is_empty() {
            debug!(address = %recipient.address, forwards = recipient.forwards.len(), "Forwarding alias");
            status = Some(self.relay(sender, &recipient.forwards, raw).await);
        }

        for target in &recipient.targets {
            let outcome = match self.deliver_to_target(sender, target, raw).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(address = %recipient.address, user_id = target.user_id, error = %e, "Delivery failed");
                    if e.is_transient() {
                        DsnStatus::unavailable()
                    } else {
                        DsnStatus::new(DsnClass::Fail, 0, 0)
                    }
                }
            };
            status = Some(status.map_or(outcome, |s| s.worst(outcome)));
        }

        status.unwrap_or_else(DsnStatus::delivered)
    }

    /// Hand `raw` to the outbound relay for non-local addresses
    async fn relay(&self, sender: &str, recipients: &[String], raw: &[u8]) -> DsnStatus {
        let relay = match &self.relay {
            Some(relay) => relay,
            None => {
                warn!(recipients = ?recipients, "No relay configured for non-local addresses");
                return DsnStatus::no_route();
            }
        };
        match relay.send(sender, recipients, raw).await {
            RelayResult::Sent => {
                info!(relay = relay.name(), recipients = ?recipients, size = raw.len(), "Message relayed");
                DsnStatus::delivered()
            }
            RelayResult::TemporaryFailure { error } => {
                warn!(relay = relay.name(), error = %error, "Relay temporarily failed");
                DsnStatus::no_answer()
            }
            RelayResult::PermanentFailure { error } => {
                warn!(relay = relay.name(), error = %error, "Relay refused message");
                DsnStatus::new(DsnClass::Fail, 4, 0)
            }
        }
    }

    async fn deliver_to_target(&self, sender: &str, target: &Target, raw: &[u8]) -> Result<DsnStatus> {
        let mailbox = target
            .mailbox
            .clone()
            .unwrap_or_else(|| self.config.default_mailbox.clone());

        let result = self.sort.process(target.user_id, raw, &mailbox).await?;
        if let Some(reason) = &result.reject {
            info!(user_id = target.user_id, reason = %reason, "Message rejected by sort script");
            return Ok(DsnStatus::refused());
        }

        let mut status = DsnStatus::delivered();
        for name in result.mailboxes(&mailbox) {
            let outcome = self
                .insert(target.user_id, &name, target.mailbox.is_some(), raw)
                .await?;
            status = status.worst(outcome);
        }

        for address in &result.redirect {
            status = status.worst(self.redirect(sender, address, raw).await?);
        }

        if result.is_discarded() {
            debug!(user_id = target.user_id, "Message discarded by sort script");
        }
        Ok(status)
    }

    /// Redirects to local addresses are delivered without sorting again;
    /// anything else goes to the relay.
    async fn redirect(&self, sender: &str, address: &str, raw: &[u8]) -> Result<DsnStatus> {
        let recipient = self.resolve(address).await?;
        let mut status = DsnStatus::delivered();
        if recipient.targets.is_empty() && recipient.forwards.is_empty() {
            debug!(redirect = %address, "Relaying redirect");
            return Ok(self.relay(sender, &[recipient.address], raw).await);
        }
        if !recipient.forwards.is_empty() {
            status = self.relay(sender, &recipient.forwards, raw).await;
        }
        for target in &recipient.targets {
            let name = target
                .mailbox
                .clone()
                .unwrap_or_else(|| self.config.default_mailbox.clone());
            status = status.worst(
                self.insert(target.user_id, &name, target.mailbox.is_some(), raw)
                    .await?,
            );
        }
        Ok(status)
    }

    /// File `raw` into one of `user`'s mailboxes. A mailbox that is
    /// missing or that the user may not post to falls back to the default
    /// mailbox.
    async fn insert(&self, user: UserId, name: &str, from_detail: bool, raw: &[u8]) -> Result<DsnStatus> {
        let default = self.config.default_mailbox.as_str();
        let mut name = name.to_string();
        let mut from_detail = from_detail;

        loop {
            let can_fall_back = name != default;
            let mailbox = match self.find_or_create(user, &name, from_detail).await? {
                Some(mailbox) => mailbox,
                None if can_fall_back => {
                    debug!(user_id = user, mailbox = %name, "No such mailbox, using default");
                    name = default.to_string();
                    from_detail = false;
                    continue;
                }
                None => return Ok(DsnStatus::new(DsnClass::Fail, 2, 0)),
            };

            if !acl::has_right(&self.store, &mailbox, user, AclRight::Post).await? {
                if !can_fall_back {
                    warn!(user_id = user, mailbox = %name, "No right to post to default mailbox");
                    return Ok(DsnStatus::refused());
                }
                debug!(user_id = user, mailbox = %name, "No right to post, using default");
                name = default.to_string();
                from_detail = false;
                continue;
            }

            let quota = Quota::load(&self.store, mailbox.owner_id).await?;
            if !quota.allows(raw.len() as u64) {
                info!(
                    user_id = mailbox.owner_id,
                    used = quota.usage,
                    limit = quota.limit,
                    size = raw.len(),
                    "Mailbox over quota"
                );
                return Ok(DsnStatus::over_quota());
            }

            let uid = self
                .store
                .messages
                .append(new_message(mailbox.id, raw, MessageFlags::default()))
                .await?;
            info!(user_id = user, mailbox = %mailbox.name, uid = uid, size = raw.len(), "Message delivered");
            return Ok(DsnStatus::delivered());
        }
    }

    async fn find_or_create(&self, user: UserId, name: &str, from_detail: bool) -> Result<Option<Mailbox>> {
        let lookup = if name.eq_ignore_ascii_case("INBOX") { "INBOX" } else { name };
        if let Some(mailbox) = self.store.mailboxes.find_by_name(user, lookup).await? {
            return Ok(Some(mailbox));
        }
        let create = lookup == "INBOX"
            || lookup == self.config.default_mailbox
            || (from_detail && self.config.create_detail_mailbox);
        if !create {
            return Ok(None);
        }
        match self
            .store
            .mailboxes
            .create(user, lookup, MailboxPermission::ReadWrite)
            .await
        {
            Ok(mailbox) => Ok(Some(mailbox)),
            // created concurrently
            Err(Error::Validation(_)) => self.store.mailboxes.find_by_name(user, lookup).await,
            Err(e) => Err(e),
        }
    }
}

/// The address with its `+detail` removed, and the detail
fn strip_detail(email: &EmailAddress) -> Option<(String, String)> {
    match email.split_detail() {
        (user, Some(detail)) => Some((format!("{}@{}", user, email.domain), detail.to_string())),
        _ => None,
    }
}

/// `@sub.example.com`, `@.example.com`, `@.com`
pub fn domain_catchalls(domain: &str) -> Vec<String> {
    let domain = domain.trim_matches('.');
    if domain.is_empty() {
        return Vec::new();
    }
    let mut out = vec![format!("@{}", domain)];
    let mut rest = domain;
    while let Some((_, parent)) = rest.split_once('.') {
        out.push(format!("@.{}", parent));
        rest = parent;
    }
    out
}

/// Build a storable message from raw RFC 5322 bytes
pub fn new_message(mailbox_id: MailboxId, raw: &[u8], flags: MessageFlags) -> NewMessage {
    let headers = top_level_headers(raw);
    let sent_date = headers
        .iter()
        .find(|(n, _)| n == "date")
        .and_then(|(_, v)| chrono::DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|d| d.with_timezone(&Utc));
    NewMessage {
        mailbox_id,
        raw: raw.to_vec(),
        flags,
        internal_date: Utc::now(),
        sent_date,
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DatabaseAuth;
    use crate::sort::{KeepAll, SieveSort};
    use mailstore_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    const RAW: &[u8] = b"From: a@example.org\r\nSubject: hi\r\nDate: Tue, 5 Mar 2024 10:00:00 +0000\r\n\r\nbody\r\n";
    const SENDER: &str = "a@example.org";

    struct RecordingRelay {
        result: RelayResult,
        sent: tokio::sync::Mutex<Vec<(String, Vec<String>)>>,
    }

    impl RecordingRelay {
        fn new(result: RelayResult) -> Arc<Self> {
            Arc::new(Self {
                result,
                sent: tokio::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Relay for RecordingRelay {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, sender: &str, recipients: &[String], _raw: &[u8]) -> RelayResult {
            self.sent
                .lock()
                .await
                .push((sender.to_string(), recipients.to_vec()));
            self.result.clone()
        }
    }

    fn relaying(fx: &Fixture, sieve: bool, relay: Arc<RecordingRelay>) -> Delivery {
        let auth: Arc<dyn AuthBackend> = Arc::new(DatabaseAuth::new(fx.store.clone()));
        let sort: Arc<dyn SortBackend> = if sieve {
            Arc::new(SieveSort::new(fx.store.clone()))
        } else {
            Arc::new(KeepAll)
        };
        Delivery::new(fx.store.clone(), auth, sort, DeliveryConfig::default()).with_relay(relay)
    }

    struct Fixture {
        backing: Arc<MemoryStore>,
        store: Store,
        delivery: Delivery,
        joe: UserId,
        ann: UserId,
    }

    async fn fixture(sieve: bool, config: DeliveryConfig) -> Fixture {
        let backing = Arc::new(MemoryStore::new());
        let store = Store::memory(backing.clone());
        let joe = store.users.create("joe", "").await.unwrap().id;
        let ann = store.users.create("ann@example.com", "").await.unwrap().id;
        store.aliases.create("sales@example.com", "joe").await.unwrap();
        store.aliases.create("@example.net", "ann@example.com").await.unwrap();
        store.aliases.create("@.example.org", "joe").await.unwrap();
        store.aliases.create("postmaster@", "joe").await.unwrap();
        store.aliases.create("list@example.com", "far@elsewhere.test").await.unwrap();

        let auth: Arc<dyn AuthBackend> = Arc::new(DatabaseAuth::new(store.clone()));
        let sort: Arc<dyn SortBackend> = if sieve {
            Arc::new(SieveSort::new(store.clone()))
        } else {
            Arc::new(KeepAll)
        };
        let delivery = Delivery::new(store.clone(), auth, sort, config);
        Fixture {
            backing,
            store,
            delivery,
            joe,
            ann,
        }
    }

    async fn count(store: &Store, user: UserId, mailbox: &str) -> usize {
        match store.mailboxes.find_by_name(user, mailbox).await.unwrap() {
            Some(m) => store.messages.list(m.id).await.unwrap().len(),
            None => 0,
        }
    }

    fn target(user_id: UserId, mailbox: Option<&str>) -> Target {
        Target {
            user_id,
            mailbox: mailbox.map(str::to_string),
        }
    }

    #[test]
    fn test_domain_catchalls() {
        assert_eq!(
            domain_catchalls("sub.example.com"),
            vec!["@sub.example.com", "@.example.com", "@.com"]
        );
        assert_eq!(domain_catchalls("localhost"), vec!["@localhost"]);
    }

    #[test]
    fn test_dsn_status() {
        assert_eq!(DsnStatus::valid().to_string(), "2.1.5");
        assert_eq!(DsnStatus::unknown_user().to_string(), "5.1.1");
        assert_eq!(DsnStatus::unknown_user().reply_code(), 550);
        assert_eq!(
            DsnStatus::delivered().worst(DsnStatus::unknown_user()),
            DsnStatus::unknown_user()
        );
        assert_eq!(
            DsnStatus::unknown_user().worst(DsnStatus::unavailable()),
            DsnStatus::unavailable()
        );
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let fx = fixture(false, DeliveryConfig::default()).await;
        let d = &fx.delivery;

        let r = d.resolve("sales@example.com").await.unwrap();
        assert_eq!(r.targets, vec![target(fx.joe, None)]);
        assert_eq!(r.status, DsnStatus::valid());

        let r = d.resolve("<sales+leads@example.com>").await.unwrap();
        assert_eq!(r.targets, vec![target(fx.joe, Some("leads"))]);

        let r = d.resolve("ann@example.com").await.unwrap();
        assert_eq!(r.targets, vec![target(fx.ann, None)]);

        let r = d.resolve("ann+travel@example.com").await.unwrap();
        assert_eq!(r.targets, vec![target(fx.ann, Some("travel"))]);

        let r = d.resolve("anybody@example.net").await.unwrap();
        assert_eq!(r.targets, vec![target(fx.ann, None)]);

        let r = d.resolve("x@mail.example.org").await.unwrap();
        assert_eq!(r.targets, vec![target(fx.joe, None)]);

        let r = d.resolve("postmaster@unknown.test").await.unwrap();
        assert_eq!(r.targets, vec![target(fx.joe, None)]);

        let r = d.resolve("list@example.com").await.unwrap();
        assert_eq!(r.forwards, vec!["far@elsewhere.test"]);

        let r = d.resolve("nobody@unknown.test").await.unwrap();
        assert_eq!(r.status, DsnStatus::unknown_user());
        assert!(r.targets.is_empty());
    }

    #[tokio::test]
    async fn test_deliver_to_inbox_and_detail() {
        let config = DeliveryConfig {
            create_detail_mailbox: true,
            ..Default::default()
        };
        let fx = fixture(false, config).await;

        let r = fx.delivery.resolve("ann@example.com").await.unwrap();
        assert_eq!(fx.delivery.deliver(SENDER, &r, RAW).await, DsnStatus::delivered());
        assert_eq!(count(&fx.store, fx.ann, "INBOX").await, 1);

        let r = fx.delivery.resolve("ann+travel@example.com").await.unwrap();
        assert!(fx.delivery.deliver(SENDER, &r, RAW).await.is_success());
        assert_eq!(count(&fx.store, fx.ann, "travel").await, 1);

        let unknown = fx.delivery.resolve("nobody@unknown.test").await.unwrap();
        assert_eq!(fx.delivery.deliver(SENDER, &unknown, RAW).await, DsnStatus::unknown_user());
    }

    #[tokio::test]
    async fn test_missing_detail_mailbox_falls_back() {
        let fx = fixture(false, DeliveryConfig::default()).await;
        let r = fx.delivery.resolve("ann+travel@example.com").await.unwrap();
        assert!(fx.delivery.deliver(SENDER, &r, RAW).await.is_success());
        assert_eq!(count(&fx.store, fx.ann, "travel").await, 0);
        assert_eq!(count(&fx.store, fx.ann, "INBOX").await, 1);
    }

    #[tokio::test]
    async fn test_read_only_mailbox_falls_back_to_inbox() {
        let fx = fixture(false, DeliveryConfig::default()).await;
        fx.store
            .mailboxes
            .create(fx.ann, "Frozen", MailboxPermission::ReadOnly)
            .await
            .unwrap();
        let r = fx.delivery.resolve("ann+Frozen@example.com").await.unwrap();
        assert!(fx.delivery.deliver(SENDER, &r, RAW).await.is_success());
        assert_eq!(count(&fx.store, fx.ann, "Frozen").await, 0);
        assert_eq!(count(&fx.store, fx.ann, "INBOX").await, 1);
    }

    #[tokio::test]
    async fn test_sieve_actions() {
        let fx = fixture(true, DeliveryConfig::default()).await;
        fx.store
            .mailboxes
            .create(fx.joe, "Lists", MailboxPermission::ReadWrite)
            .await
            .unwrap();
        fx.store
            .scripts
            .put(
                fx.joe,
                "main",
                r#"if header :is "subject" "hi" { fileinto "Lists"; redirect "ann@example.com"; }"#,
                true,
            )
            .await
            .unwrap();

        let r = fx.delivery.resolve("joe@example.com").await.unwrap();
        assert_eq!(r.status, DsnStatus::unknown_user());

        let r = fx.delivery.resolve("sales@example.com").await.unwrap();
        assert!(fx.delivery.deliver(SENDER, &r, RAW).await.is_success());
        assert_eq!(count(&fx.store, fx.joe, "Lists").await, 1);
        assert_eq!(count(&fx.store, fx.joe, "INBOX").await, 0);
        assert_eq!(count(&fx.store, fx.ann, "INBOX").await, 1);

        fx.store
            .scripts
            .put(fx.joe, "main", "reject \"go away\";", true)
            .await
            .unwrap();
        assert_eq!(fx.delivery.deliver(SENDER, &r, RAW).await, DsnStatus::refused());
    }

    #[tokio::test]
    async fn test_forward_without_relay_is_not_reported_delivered() {
        let fx = fixture(false, DeliveryConfig::default()).await;
        let r = fx.delivery.resolve("list@example.com").await.unwrap();
        assert_eq!(r.status, DsnStatus::valid());

        let status = fx.delivery.deliver(SENDER, &r, RAW).await;
        assert!(!status.is_success());
        assert_eq!(status, DsnStatus::no_route());
        assert_eq!(status.to_string(), "5.4.4");
    }

    #[tokio::test]
    async fn test_forward_goes_through_relay() {
        let fx = fixture(false, DeliveryConfig::default()).await;
        let relay = RecordingRelay::new(RelayResult::Sent);
        let delivery = relaying(&fx, false, relay.clone());

        let r = delivery.resolve("list@example.com").await.unwrap();
        assert_eq!(delivery.deliver(SENDER, &r, RAW).await, DsnStatus::delivered());
        assert_eq!(
            *relay.sent.lock().await,
            vec![(SENDER.to_string(), vec!["far@elsewhere.test".to_string()])]
        );

        let failing = relaying(
            &fx,
            false,
            RecordingRelay::new(RelayResult::TemporaryFailure {
                error: "connection refused".to_string(),
            }),
        );
        assert_eq!(failing.deliver(SENDER, &r, RAW).await, DsnStatus::no_answer());
        assert_eq!(DsnStatus::no_answer().reply_code(), 451);
    }

    #[tokio::test]
    async fn test_sieve_redirect_to_remote_address() {
        let fx = fixture(true, DeliveryConfig::default()).await;
        fx.store
            .scripts
            .put(fx.joe, "main", r#"redirect "far@elsewhere.test"; keep;"#, true)
            .await
            .unwrap();

        let r = fx.delivery.resolve("sales@example.com").await.unwrap();
        assert_eq!(fx.delivery.deliver(SENDER, &r, RAW).await, DsnStatus::no_route());
        assert_eq!(count(&fx.store, fx.joe, "INBOX").await, 1);

        let relay = RecordingRelay::new(RelayResult::Sent);
        let delivery = relaying(&fx, true, relay.clone());
        assert_eq!(delivery.deliver(SENDER, &r, RAW).await, DsnStatus::delivered());
        assert_eq!(
            relay.sent.lock().await[0].1,
            vec!["far@elsewhere.test".to_string()]
        );
        assert_eq!(count(&fx.store, fx.joe, "INBOX").await, 2);
    }

    #[tokio::test]
    async fn test_over_quota_is_refused() {
        let fx = fixture(false, DeliveryConfig::default()).await;
        fx.store
            .users
            .set_max_mail_size(fx.ann, RAW.len() as u64 + 10)
            .await
            .unwrap();

        let r = fx.delivery.resolve("ann@example.com").await.unwrap();
        assert_eq!(fx.delivery.deliver(SENDER, &r, RAW).await, DsnStatus::delivered());

        let status = fx.delivery.deliver(SENDER, &r, RAW).await;
        assert_eq!(status, DsnStatus::over_quota());
        assert_eq!(status.to_string(), "5.2.2");
        assert_eq!(status.reply_code(), 550);
        assert_eq!(count(&fx.store, fx.ann, "INBOX").await, 1);

        fx.store.users.set_max_mail_size(fx.ann, 0).await.unwrap();
        assert!(fx.delivery.deliver(SENDER, &r, RAW).await.is_success());
    }

    #[tokio::test]
    async fn test_storage_outage_is_temporary() {
        let fx = fixture(false, DeliveryConfig::default()).await;
        let r = fx.delivery.resolve("ann@example.com").await.unwrap();
        fx.backing.set_offline(true);
        assert_eq!(fx.delivery.deliver(SENDER, &r, RAW).await, DsnStatus::unavailable());
        assert!(fx.delivery.resolve("ann@example.com").await.is_err());
    }

    #[test]
    fn test_new_message_reads_headers() {
        let msg = new_message(3, RAW, MessageFlags::default());
        assert_eq!(msg.sent_day().unwrap().to_string(), "2024-03-05");
        assert!(msg.headers.contains(&("subject".to_string(), "hi".to_string())));
    }
}
