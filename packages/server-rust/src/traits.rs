use ldapd_core::{AuthState, Dn, LdapResult, Operation};

use crate::error::BackendError;
use crate::password::StoredPassword;

/// Executes operations against directory data.
/// Implementations: in-memory (tests, harness); persistent stores plug in here.
///
/// Calls are synchronous and may block. The core runs each call on a worker
/// thread and never holds a connection lock across it.
pub trait Backend: Send + Sync {
    /// Execute a non-bind, non-abandon operation as `auth`.
    ///
    /// Long-running implementations should poll `operation.is_cancelled()`
    /// and return `BackendError::Canceled` when it is set.
    fn execute(&self, operation: &Operation, auth: &AuthState) -> Result<LdapResult, BackendError>;
}

/// Resolves bind names to user records during authentication.
pub trait IdentityMapper: Send + Sync {
    /// Look up a user by login name (the `uid` attribute in most directories).
    fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, BackendError>;

    /// Look up a user by distinguished name.
    fn find_by_dn(&self, dn: &Dn) -> Result<Option<UserRecord>, BackendError>;
}

/// Rights that change what a bind may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    /// May bind with an authorization identity other than its own.
    ProxiedAuth,
}

impl Privilege {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProxiedAuth => "proxied-auth",
        }
    }

    /// Parses a `ds-privilege-name` value. Unknown names yield `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        name.trim()
            .eq_ignore_ascii_case("proxied-auth")
            .then_some(Self::ProxiedAuth)
    }
}

/// Authentication view of a directory user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub dn: Dn,
    /// Login name, used by digest schemes that bind the secret to it.
    pub username: String,
    pub passwords: Vec<StoredPassword>,
    pub privileges: Vec<Privilege>,
}

impl UserRecord {
    #[must_use]
    pub fn has_privilege(&self, privilege: Privilege) -> bool {
        self.privileges.contains(&privilege)
    }

    /// True if any stored password accepts `candidate`.
    #[must_use]
    pub fn verify_password(&self, candidate: &[u8]) -> bool {
        self.passwords
            .iter()
            .any(|stored| stored.verify(&self.username, candidate))
    }
}
