//! Bind negotiation engine.
//!
//! A [`BindStateMachine`] wraps one [`SaslMechanism`] instance for the
//! lifetime of a single bind negotiation:
//!
//! ```text
//! Initial --challenge--> ChallengeIssued --response--> Terminal
//!    \_________________single step_______________________/
//! ```
//!
//! Mechanisms are created by name from a [`MechanismRegistry`] of factories.
//! Names that are unknown or disabled resolve to a mechanism that fails with
//! `authMethodNotSupported`, so even those binds complete through the same
//! terminal path.

pub mod digest_md5;
pub mod directives;
pub mod plain;
pub mod simple;

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use ldapd_core::{BindPhase, BindRequest, Dn, SIMPLE_MECHANISM};

use crate::config::SaslConfig;
use crate::error::{BindError, ConfigError};
use crate::traits::{IdentityMapper, Privilege, UserRecord};

pub use digest_md5::{DigestMd5, DigestMd5Client};
pub use directives::{DirectiveError, Directives};
pub use plain::Plain;
pub use simple::Simple;

// ---------------------------------------------------------------------------
// Mechanism trait
// ---------------------------------------------------------------------------

/// Collaborators available to a mechanism step.
pub struct BindContext<'a> {
    pub identities: &'a dyn IdentityMapper,
    pub sasl: &'a SaslConfig,
}

/// Non-failing outcome of one mechanism step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindStep {
    /// Send `challenge` with `saslBindInProgress` and wait for the next bind.
    Continue { challenge: Bytes },
    /// Negotiation succeeded. `identity` is `None` for an anonymous simple bind.
    Authenticated {
        identity: Option<Dn>,
        authorization: Option<Dn>,
        server_credentials: Option<Bytes>,
    },
}

/// One authentication mechanism, instantiated per negotiation.
pub trait SaslMechanism: Send {
    fn name(&self) -> &str;

    /// Consume the client's next bind request.
    ///
    /// # Errors
    ///
    /// Any `BindError` ends the negotiation.
    fn step(&mut self, ctx: &BindContext<'_>, request: &BindRequest) -> Result<BindStep, BindError>;
}

/// Stands in for unknown and disabled mechanisms.
#[derive(Debug)]
struct Unsupported {
    name: String,
}

impl SaslMechanism for Unsupported {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self, _ctx: &BindContext<'_>, _request: &BindRequest) -> Result<BindStep, BindError> {
        Err(BindError::UnsupportedMechanism(self.name.clone()))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub type MechanismFactory = Arc<dyn Fn() -> Box<dyn SaslMechanism> + Send + Sync>;

/// Mechanism factories keyed by upper-case name.
#[derive(Clone)]
pub struct MechanismRegistry {
    factories: HashMap<String, MechanismFactory>,
}

impl MechanismRegistry {
    /// A registry with no mechanisms besides simple bind.
    #[must_use]
    pub fn empty() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(SIMPLE_MECHANISM, Arc::new(|| Box::new(Simple)));
        registry
    }

    /// Simple bind, PLAIN, and DIGEST-MD5.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("PLAIN", Arc::new(|| Box::new(Plain::new())));
        registry.register("DIGEST-MD5", Arc::new(|| Box::new(DigestMd5::new())));
        registry
    }

    /// Adds or replaces a factory.
    pub fn register(&mut self, name: &str, factory: MechanismFactory) {
        self.factories.insert(name.to_ascii_uppercase(), factory);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_uppercase())
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every enabled mechanism must have a factory.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownMechanism` naming the first unknown entry.
    pub fn validate(&self, config: &SaslConfig) -> Result<(), ConfigError> {
        match config.enabled_mechanisms.iter().find(|m| !self.contains(m)) {
            Some(unknown) => Err(ConfigError::UnknownMechanism(unknown.clone())),
            None => Ok(()),
        }
    }

    /// Instantiates `name`. Simple bind is always available; other names
    /// must be both registered and enabled.
    #[must_use]
    pub fn create(&self, name: &str, config: &SaslConfig) -> Box<dyn SaslMechanism> {
        let key = name.to_ascii_uppercase();
        let enabled = key == SIMPLE_MECHANISM || config.is_enabled(&key);
        match self.factories.get(&key) {
            Some(factory) if enabled => factory(),
            _ => Box::new(Unsupported {
                name: name.to_string(),
            }),
        }
    }
}

impl Default for MechanismRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismRegistry")
            .field("mechanisms", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// BindStateMachine
// ---------------------------------------------------------------------------

/// Result of driving the state machine one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Continue {
        challenge: Bytes,
    },
    Success {
        identity: Option<Dn>,
        authorization: Option<Dn>,
        server_credentials: Option<Bytes>,
    },
    Failure(BindError),
}

impl BindOutcome {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Continue { .. })
    }
}

/// Drives one negotiation. Once terminal, every further step is a protocol error.
pub struct BindStateMachine {
    mechanism: Box<dyn SaslMechanism>,
    phase: BindPhase,
}

impl BindStateMachine {
    #[must_use]
    pub fn new(mechanism: Box<dyn SaslMechanism>) -> Self {
        Self {
            mechanism,
            phase: BindPhase::Initial,
        }
    }

    #[must_use]
    pub fn mechanism_name(&self) -> &str {
        self.mechanism.name()
    }

    #[must_use]
    pub fn phase(&self) -> BindPhase {
        self.phase
    }

    /// Runs one mechanism step. A panic inside the mechanism is caught and
    /// becomes a terminal internal failure.
    pub fn step(&mut self, ctx: &BindContext<'_>, request: &BindRequest) -> BindOutcome {
        if self.phase == BindPhase::Terminal {
            return BindOutcome::Failure(BindError::protocol(
                "bind negotiation has already completed",
            ));
        }

        let mechanism = &mut self.mechanism;
        let result = catch_unwind(AssertUnwindSafe(|| mechanism.step(ctx, request)));

        let outcome = match result {
            Ok(Ok(BindStep::Continue { challenge })) => BindOutcome::Continue { challenge },
            Ok(Ok(BindStep::Authenticated {
                identity,
                authorization,
                server_credentials,
            })) => BindOutcome::Success {
                identity,
                authorization,
                server_credentials,
            },
            Ok(Err(err)) => BindOutcome::Failure(err),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    mechanism = self.mechanism.name(),
                    panic = %message,
                    "SASL mechanism panicked"
                );
                BindOutcome::Failure(BindError::Internal(message))
            }
        };

        self.phase = if outcome.is_terminal() {
            BindPhase::Terminal
        } else {
            BindPhase::ChallengeIssued
        };
        outcome
    }
}

impl fmt::Debug for BindStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindStateMachine")
            .field("mechanism", &self.mechanism.name())
            .field("phase", &self.phase)
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Identity helpers shared by mechanisms
// ---------------------------------------------------------------------------

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// Resolves an identity in `dn:<dn>`, `u:<name>`, or bare-name form.
///
/// A DN that does not parse resolves to nothing.
pub(crate) fn resolve_identity(
    ctx: &BindContext<'_>,
    id: &str,
) -> Result<Option<UserRecord>, BindError> {
    let lookup = if let Some(dn) = strip_prefix_ignore_case(id, "dn:") {
        let Ok(dn) = Dn::parse(dn.trim()) else {
            return Ok(None);
        };
        ctx.identities.find_by_dn(&dn)
    } else {
        let name = strip_prefix_ignore_case(id, "u:").unwrap_or(id);
        ctx.identities.find_by_username(name)
    };
    lookup.map_err(|err| {
        tracing::error!(error = %err, "identity lookup failed during bind");
        BindError::Internal(err.to_string())
    })
}

/// Checks a requested authorization identity against the authenticated user.
///
/// Returns `None` when the request names the user itself.
pub(crate) fn resolve_authorization(
    ctx: &BindContext<'_>,
    authenticated: &UserRecord,
    authzid: &str,
) -> Result<Option<Dn>, BindError> {
    if authzid.trim().is_empty() {
        return Err(BindError::invalid("empty authorization identity"));
    }
    let target = resolve_identity(ctx, authzid)?;
    if target
        .as_ref()
        .is_some_and(|t| t.dn == authenticated.dn)
    {
        return Ok(None);
    }
    if !authenticated.has_privilege(Privilege::ProxiedAuth) {
        return Err(BindError::invalid("proxied authorization not permitted"));
    }
    match target {
        Some(target) => Ok(Some(target.dn)),
        None => Err(BindError::invalid("unknown authorization identity")),
    }
}
