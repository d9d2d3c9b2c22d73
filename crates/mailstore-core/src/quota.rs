//! Per-user storage quota
//!
//! Every user has a single quota root, `""`, covering all mailboxes they
//! own. A limit of 0 means no quota. Messages are charged to the owner of
//! the mailbox they land in.

use mailstore_common::types::UserId;
use mailstore_common::{Error, Result};
use mailstore_storage::Store;

/// The only quota root
pub const QUOTA_ROOT: &str = "";

/// Storage usage against a limit, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub usage: u64,
    pub limit: u64,
}

impl Quota {
    /// Current usage and limit of `user_id`
    pub async fn load(store: &Store, user_id: UserId) -> Result<Self> {
        let user = store
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;
        let usage = store.users.storage_used(user_id).await?;
        Ok(Self {
            usage,
            limit: user.max_mail_size.max(0) as u64,
        })
    }

    pub fn is_limited(&self) -> bool {
        self.limit > 0
    }

    /// Whether `size` more bytes fit under the limit
    pub fn allows(&self, size: u64) -> bool {
        if !self.is_limited() {
            return true;
        }
        self.usage < self.limit && size <= self.limit - self.usage
    }

    /// The STORAGE resource as (usage, limit) in KiB
    pub fn storage_kib(&self) -> (u64, u64) {
        (self.usage / 1024, self.limit / 1024)
    }
}

/// Fail with an `[OVERQUOTA]` validation error unless `size` more bytes
/// fit in `owner`'s quota
pub async fn reserve(store: &Store, owner: UserId, size: u64) -> Result<()> {
    let quota = Quota::load(store, owner).await?;
    if quota.allows(size) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "[OVERQUOTA] quota exceeded ({} of {} bytes used)",
            quota.usage, quota.limit
        )))
    }
}
