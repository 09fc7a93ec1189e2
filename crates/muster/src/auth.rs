//! Digest credential and the ACL derived from it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use sha1::{Digest, Sha1};

use crate::store::{AclEntry, Permission};

/// Identity scheme tag for digest authentication.
pub const DIGEST_SCHEME: &str = "digest";

/// Username/password pair authenticated against the store via a one-way
/// digest. The derived ACL depends only on the credential, so it is computed
/// once at construction and cached by the session manager.
#[derive(Debug, Clone)]
pub struct DigestCredential {
    username: String,
    password: String,
}

impl DigestCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Cleartext `user:pass` payload supplied to the store's auth call.
    pub fn auth_payload(&self) -> Bytes {
        Bytes::from(format!("{}:{}", self.username, self.password))
    }

    /// `base64(sha1("user:pass"))`, the digested identity half.
    pub fn digest(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(format!("{}:{}", self.username, self.password).as_bytes());
        STANDARD.encode(hasher.finalize())
    }

    /// Single access-control entry granting full permission to the
    /// authenticated digest identity.
    pub fn acl(&self) -> Vec<AclEntry> {
        vec![AclEntry {
            scheme: DIGEST_SCHEME.to_string(),
            id: format!("{}:{}", self.username, self.digest()),
            perms: Permission::All,
        }]
    }
}
