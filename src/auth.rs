// src/auth.rs
// Per-connection authentication state consulted by the command gateway.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Privilege level a connection holds on a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    ReadOnly,
    ReadWrite,
}

/// Authentication state for one logical client connection.
///
/// Credentials are granted per database; a grant on `admin` extends to every
/// database. Connections from the local host with no users configured are
/// treated as authorized, matching the usual bootstrap path.
pub struct AuthenticationInfo {
    grants: RwLock<HashMap<String, Privilege>>,
    local_host: bool,
}

impl AuthenticationInfo {
    pub fn new() -> Self {
        AuthenticationInfo { grants: RwLock::new(HashMap::new()), local_host: false }
    }

    pub fn local_host() -> Self {
        AuthenticationInfo { grants: RwLock::new(HashMap::new()), local_host: true }
    }

    pub fn is_local_host(&self) -> bool {
        self.local_host
    }

    /// Record a successful login on `db`.
    pub fn authorize(&self, db: &str, privilege: Privilege) {
        self.grants.write().insert(db.to_string(), privilege);
    }

    pub fn logout(&self, db: &str) {
        self.grants.write().remove(db);
    }

    pub fn is_authorized_reads(&self, db: &str) -> bool {
        if self.local_host {
            return true;
        }
        let grants = self.grants.read();
        grants.contains_key(db) || grants.contains_key("admin")
    }

    pub fn is_authorized_writes(&self, db: &str) -> bool {
        if self.local_host {
            return true;
        }
        let grants = self.grants.read();
        matches!(grants.get(db), Some(Privilege::ReadWrite))
            || matches!(grants.get("admin"), Some(Privilege::ReadWrite))
    }
}

impl Default for AuthenticationInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_by_default() {
        let auth = AuthenticationInfo::new();
        assert!(!auth.is_authorized_reads("test"));
        assert!(!auth.is_authorized_writes("test"));
    }

    #[test]
    fn test_local_host_is_authorized() {
        let auth = AuthenticationInfo::local_host();
        assert!(auth.is_local_host());
        assert!(auth.is_authorized_reads("test"));
        assert!(auth.is_authorized_writes("test"));
    }

    #[test]
    fn test_read_only_grant() {
        let auth = AuthenticationInfo::new();
        auth.authorize("test", Privilege::ReadOnly);
        assert!(auth.is_authorized_reads("test"));
        assert!(!auth.is_authorized_writes("test"));
        assert!(!auth.is_authorized_reads("other"));
    }

    #[test]
    fn test_admin_grant_extends_everywhere() {
        let auth = AuthenticationInfo::new();
        auth.authorize("admin", Privilege::ReadWrite);
        assert!(auth.is_authorized_reads("test"));
        assert!(auth.is_authorized_writes("test"));
    }

    #[test]
    fn test_logout_revokes() {
        let auth = AuthenticationInfo::new();
        auth.authorize("test", Privilege::ReadWrite);
        auth.logout("test");
        assert!(!auth.is_authorized_reads("test"));
    }
}
