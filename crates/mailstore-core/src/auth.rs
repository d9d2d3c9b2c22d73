//! User authentication

use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mailstore_common::types::UserId;
use mailstore_common::{Error, Result};
use mailstore_storage::Store;
use tracing::{debug, warn};

/// Credential checks used by every protocol front end
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Driver name as written in the configuration
    fn name(&self) -> &'static str;

    async fn user_exists(&self, username: &str) -> Result<bool>;

    /// Check a password. Returns the user id on success, `None` for a bad
    /// name or password.
    async fn validate(&self, username: &str, password: &str) -> Result<Option<UserId>>;

    async fn get_user_id(&self, username: &str) -> Result<Option<UserId>>;

    async fn username(&self, user_id: UserId) -> Result<Option<String>>;
}

/// Accounts from the `users` table, argon2 PHC hashes
pub struct DatabaseAuth {
    store: Store,
}

impl DatabaseAuth {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuthBackend for DatabaseAuth {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        Ok(self.get_user_id(username).await?.is_some())
    }

    async fn validate(&self, username: &str, password: &str) -> Result<Option<UserId>> {
        let user = match self.store.users.find_by_name(username).await? {
            Some(user) => user,
            None => {
                debug!(user = %username, "Unknown user");
                return Ok(None);
            }
        };

        if !user.active {
            debug!(user = %username, "User is inactive");
            return Ok(None);
        }

        match verify_password(password, &user.password_hash) {
            Ok(true) => {
                debug!(user = %username, "Authentication successful");
                Ok(Some(user.id))
            }
            Ok(false) => {
                debug!(user = %username, "Invalid password");
                Ok(None)
            }
            Err(e) => {
                warn!(user = %username, error = %e, "Password verification error");
                Ok(None)
            }
        }
    }

    async fn get_user_id(&self, username: &str) -> Result<Option<UserId>> {
        Ok(self
            .store
            .users
            .find_by_name(username)
            .await?
            .filter(|u| u.active)
            .map(|u| u.id))
    }

    async fn username(&self, user_id: UserId) -> Result<Option<String>> {
        Ok(self.store.users.get(user_id).await?.map(|u| u.name))
    }
}

/// Verify a password against an argon2 hash
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| Error::Auth(format!("Invalid password hash: {}", e)))?;

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(_) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(Error::Auth(format!("Password verification error: {}", e))),
    }
}

/// Hash a password with default argon2 parameters and a random salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| Error::Internal(format!("salt: {}", e)))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Internal(format!("hash: {}", e)))
}

/// Decode SASL PLAIN credentials: base64(`[authzid] NUL authcid NUL password`)
pub fn decode_plain(credentials: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(credentials.trim()).ok()?;
    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();

    let (username, password) = match parts.len() {
        2 => (parts[0], parts[1]),
        3 => (parts[1], parts[2]),
        _ => return None,
    };
    Some((
        String::from_utf8_lossy(username).to_string(),
        String::from_utf8_lossy(password).to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailstore_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn backend() -> (DatabaseAuth, UserId) {
        let store = Store::memory(Arc::new(MemoryStore::new()));
        let hash = hash_password("secret").unwrap();
        let user = store.users.create("joe", &hash).await.unwrap();
        (DatabaseAuth::new(store), user.id)
    }

    #[tokio::test]
    async fn test_validate() {
        let (auth, id) = backend().await;
        assert_eq!(auth.validate("joe", "secret").await.unwrap(), Some(id));
        assert_eq!(auth.validate("joe", "wrong").await.unwrap(), None);
        assert_eq!(auth.validate("nobody", "secret").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lookups() {
        let (auth, id) = backend().await;
        assert!(auth.user_exists("joe").await.unwrap());
        assert!(!auth.user_exists("bob").await.unwrap());
        assert_eq!(auth.get_user_id("joe").await.unwrap(), Some(id));
        assert_eq!(auth.username(id).await.unwrap(), Some("joe".to_string()));
        // the pseudo-user cannot log in
        assert!(!auth.user_exists("anyone").await.unwrap());
    }

    #[test]
    fn test_bad_hash_is_an_error() {
        assert!(verify_password("x", "not-a-hash").is_err());
    }

    #[test]
    fn test_decode_plain() {
        let creds = BASE64.encode(b"\0joe\0secret");
        assert_eq!(
            decode_plain(&creds),
            Some(("joe".to_string(), "secret".to_string()))
        );
        let creds = BASE64.encode(b"joe\0secret");
        assert_eq!(
            decode_plain(&creds),
            Some(("joe".to_string(), "secret".to_string()))
        );
        assert_eq!(decode_plain("!!!"), None);
        assert_eq!(decode_plain(&BASE64.encode(b"nopassword")), None);
    }
}
