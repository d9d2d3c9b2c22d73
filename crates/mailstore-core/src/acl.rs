//! Mailbox access control (RFC 4314 rights)

use crate::mailbox::MailboxState;
use mailstore_common::types::{AclMap, AclRight, MailboxId, MailboxPermission, UserId, ANYONE_USER};
use mailstore_common::{Error, Result};
use mailstore_storage::{Mailbox, Store};
use tracing::debug;

/// Anything that identifies a mailbox with its owner and access mode
pub trait AclTarget {
    fn mailbox_id(&self) -> MailboxId;
    fn owner_id(&self) -> UserId;
    fn permission(&self) -> MailboxPermission;
}

impl AclTarget for Mailbox {
    fn mailbox_id(&self) -> MailboxId {
        self.id
    }

    fn owner_id(&self) -> UserId {
        self.owner_id
    }

    fn permission(&self) -> MailboxPermission {
        Mailbox::permission(self)
    }
}

impl AclTarget for MailboxState {
    fn mailbox_id(&self) -> MailboxId {
        self.id
    }

    fn owner_id(&self) -> UserId {
        self.owner_id
    }

    fn permission(&self) -> MailboxPermission {
        self.permission
    }
}

async fn anyone_id(store: &Store) -> Result<Option<UserId>> {
    Ok(store.users.find_by_name(ANYONE_USER).await?.map(|u| u.id))
}

/// Whether `user` holds `right` on the mailbox.
///
/// Rights that modify the mailbox are refused on a read-only mailbox,
/// even for its owner.
pub async fn has_right(
    store: &Store,
    mailbox: &impl AclTarget,
    user: UserId,
    right: AclRight,
) -> Result<bool> {
    if right.requires_write() && mailbox.permission() == MailboxPermission::ReadOnly {
        return Ok(false);
    }
    Ok(myrights(store, mailbox, user).await?.get(right))
}

/// Effective rights: everything for the owner, else the user's own row
/// together with the `anyone` row. A right missing from the user's row
/// is still granted when `anyone` holds it.
pub async fn myrights(store: &Store, mailbox: &impl AclTarget, user: UserId) -> Result<AclMap> {
    if mailbox.owner_id() == user {
        return Ok(AclMap::all());
    }
    let own = store
        .acl
        .get(mailbox.mailbox_id(), user)
        .await?
        .unwrap_or_default();
    let anyone = match anyone_id(store).await? {
        Some(anyone) if anyone != user => store
            .acl
            .get(mailbox.mailbox_id(), anyone)
            .await?
            .unwrap_or_default(),
        _ => AclMap::default(),
    };
    Ok(own.union(&anyone))
}

/// A parsed SETACL modification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RightsChange {
    Add(AclMap),
    Remove(AclMap),
    Replace(AclMap),
}

impl RightsChange {
    /// Parse `[+|-]letters`. Unknown letters reject the whole change.
    pub fn parse(spec: &str) -> Result<Self> {
        let (kind, letters) = match spec.as_bytes().first() {
            Some(b'+') => ('+', &spec[1..]),
            Some(b'-') => ('-', &spec[1..]),
            _ => ('=', spec),
        };
        let mut map = AclMap::default();
        for c in letters.chars() {
            let right = AclRight::from_letter(c)
                .ok_or_else(|| Error::InvalidQuery(format!("unknown right '{}'", c)))?;
            map.set(right, true);
        }
        Ok(match kind {
            '+' => RightsChange::Add(map),
            '-' => RightsChange::Remove(map),
            _ => RightsChange::Replace(map),
        })
    }

    pub fn apply(&self, current: AclMap) -> AclMap {
        let mut out = current;
        for right in AclRight::ALL {
            match self {
                RightsChange::Add(m) if m.get(right) => out.set(right, true),
                RightsChange::Remove(m) if m.get(right) => out.set(right, false),
                RightsChange::Replace(m) => out.set(right, m.get(right)),
                _ => {}
            }
        }
        out
    }
}

/// Apply a SETACL rights string for `user`. A row left without any right
/// is removed.
pub async fn set_rights(store: &Store, mailbox: MailboxId, user: UserId, spec: &str) -> Result<AclMap> {
    let change = RightsChange::parse(spec)?;
    let current = store.acl.get(mailbox, user).await?.unwrap_or_default();
    let updated = change.apply(current);

    if updated.is_empty() {
        store.acl.delete(mailbox, user).await?;
    } else {
        store.acl.set(mailbox, user, &updated).await?;
    }
    debug!(
        mailbox_id = mailbox,
        user_id = user,
        rights = %updated.rights_string(),
        "Rights updated"
    );
    Ok(updated)
}

pub async fn delete_rights(store: &Store, mailbox: MailboxId, user: UserId) -> Result<()> {
    store.acl.delete(mailbox, user).await
}

/// GETACL: the owner with every right first, then each stored identifier
pub async fn list_rights_for_mailbox(
    store: &Store,
    mailbox: &impl AclTarget,
) -> Result<Vec<(String, String)>> {
    let owner = store
        .users
        .get(mailbox.owner_id())
        .await?
        .ok_or_else(|| Error::NotFound(format!("user {}", mailbox.owner_id())))?;

    let mut out = vec![(owner.name.clone(), AclMap::all().rights_string())];
    for (identifier, rights) in store.acl.list(mailbox.mailbox_id()).await? {
        if identifier != owner.name {
            out.push((identifier, rights.rights_string()));
        }
    }
    Ok(out)
}

/// LISTRIGHTS: required rights first, then the rights that may be granted
pub fn listrights(mailbox: &impl AclTarget, user: UserId) -> Vec<String> {
    if mailbox.owner_id() == user {
        return vec![AclMap::all().rights_string()];
    }
    std::iter::once(String::new())
        .chain(AclRight::ALL.iter().map(|r| r.letter().to_string()))
        .collect()
}
