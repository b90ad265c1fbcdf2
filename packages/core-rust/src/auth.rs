//! Per-connection authentication state.

use std::fmt;

use crate::dn::Dn;

/// Progress of a bind negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindPhase {
    Initial,
    ChallengeIssued,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindState {
    Idle,
    BindInProgress { mechanism: String, phase: BindPhase },
    Authenticated,
}

/// Who a connection is, as seen by operations executing on it.
///
/// Snapshots are immutable; the dispatcher publishes a new snapshot on each
/// transition and workers read whichever one is current when they dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    identity: Option<Dn>,
    authorization_identity: Option<Dn>,
    bind_state: BindState,
}

impl AuthState {
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            identity: None,
            authorization_identity: None,
            bind_state: BindState::Idle,
        }
    }

    /// A completed bind. `authorization` defaults to the authenticated identity.
    #[must_use]
    pub fn authenticated(identity: Dn, authorization: Option<Dn>) -> Self {
        let authorization_identity = authorization.unwrap_or_else(|| identity.clone());
        Self {
            identity: Some(identity),
            authorization_identity: Some(authorization_identity),
            bind_state: BindState::Authenticated,
        }
    }

    /// Same identity, with a negotiation in progress.
    #[must_use]
    pub fn with_bind_in_progress(&self, mechanism: &str, phase: BindPhase) -> Self {
        Self {
            identity: self.identity.clone(),
            authorization_identity: self.authorization_identity.clone(),
            bind_state: BindState::BindInProgress {
                mechanism: mechanism.to_string(),
                phase,
            },
        }
    }

    /// Same identity, with no negotiation in progress.
    #[must_use]
    pub fn settled(&self) -> Self {
        let bind_state = if self.identity.is_some() {
            BindState::Authenticated
        } else {
            BindState::Idle
        };
        Self {
            identity: self.identity.clone(),
            authorization_identity: self.authorization_identity.clone(),
            bind_state,
        }
    }

    /// The authenticated identity; `None` means anonymous.
    #[must_use]
    pub fn identity(&self) -> Option<&Dn> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn authorization_identity(&self) -> Option<&Dn> {
        self.authorization_identity.as_ref()
    }

    /// The identity access decisions should use.
    #[must_use]
    pub fn effective_identity(&self) -> Option<&Dn> {
        self.authorization_identity
            .as_ref()
            .or(self.identity.as_ref())
    }

    #[must_use]
    pub fn bind_state(&self) -> &BindState {
        &self.bind_state
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.identity.is_none()
    }

    #[must_use]
    pub fn is_bind_in_progress(&self) -> bool {
        matches!(self.bind_state, BindState::BindInProgress { .. })
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.identity, &self.authorization_identity) {
            (None, _) => f.write_str("anonymous"),
            (Some(id), Some(authz)) if id != authz => write!(f, "{id} as {authz}"),
            (Some(id), _) => write!(f, "{id}"),
        }
    }
}
