//! Decoded client requests, one variant per LDAP operation.
//!
//! The protocol layer produces these from wire bytes; the core never sees
//! BER. Fields carry only what the dispatcher, the bind engine, and the
//! backend collaborator need.

use std::fmt;

use bytes::Bytes;

use crate::dn::Dn;
use crate::entry::Entry;
use crate::filter::Filter;
use crate::operation::MessageId;

/// Operation discriminant, used for routing and as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Bind,
    Search,
    Add,
    Modify,
    Delete,
    Compare,
    Extended,
    Abandon,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Search => "search",
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Compare => "compare",
            Self::Extended => "extended",
            Self::Abandon => "abandon",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bind(BindRequest),
    Search(SearchRequest),
    Add(AddRequest),
    Modify(ModifyRequest),
    Delete(DeleteRequest),
    Compare(CompareRequest),
    Extended(ExtendedRequest),
    Abandon(AbandonRequest),
}

impl Request {
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Bind(_) => OperationKind::Bind,
            Self::Search(_) => OperationKind::Search,
            Self::Add(_) => OperationKind::Add,
            Self::Modify(_) => OperationKind::Modify,
            Self::Delete(_) => OperationKind::Delete,
            Self::Compare(_) => OperationKind::Compare,
            Self::Extended(_) => OperationKind::Extended,
            Self::Abandon(_) => OperationKind::Abandon,
        }
    }
}

/// Mechanism name reported for simple (non-SASL) binds.
pub const SIMPLE_MECHANISM: &str = "SIMPLE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuth {
    Simple(Bytes),
    Sasl {
        mechanism: String,
        /// `None` when the client sent no credentials field at all.
        credentials: Option<Bytes>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    /// The bind name exactly as sent; it may not be a valid DN.
    pub name: String,
    pub auth: BindAuth,
}

impl BindRequest {
    #[must_use]
    pub fn simple(name: impl Into<String>, password: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            auth: BindAuth::Simple(password.into()),
        }
    }

    #[must_use]
    pub fn sasl(mechanism: impl Into<String>, credentials: Option<Bytes>) -> Self {
        Self {
            name: String::new(),
            auth: BindAuth::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }

    /// The SASL mechanism name, or [`SIMPLE_MECHANISM`] for simple binds.
    #[must_use]
    pub fn mechanism(&self) -> &str {
        match &self.auth {
            BindAuth::Simple(_) => SIMPLE_MECHANISM,
            BindAuth::Sasl { mechanism, .. } => mechanism,
        }
    }

    #[must_use]
    pub fn is_sasl(&self) -> bool {
        matches!(self.auth, BindAuth::Sasl { .. })
    }

    /// SASL credentials; always `None` for simple binds.
    #[must_use]
    pub fn sasl_credentials(&self) -> Option<&[u8]> {
        match &self.auth {
            BindAuth::Sasl {
                credentials: Some(credentials),
                ..
            } => Some(credentials),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: Dn,
    pub scope: SearchScope,
    pub filter: Filter,
    /// Requested attributes; empty means all user attributes.
    pub attributes: Vec<String>,
    /// Zero means no client-requested limit.
    pub size_limit: usize,
}

impl SearchRequest {
    #[must_use]
    pub fn new(base: Dn, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base,
            scope,
            filter,
            attributes: Vec::new(),
            size_limit: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: Entry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationType {
    Add,
    Delete,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub kind: ModificationType,
    pub attribute: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: Dn,
    pub changes: Vec<Modification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub dn: Dn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: Dn,
    pub attribute: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub oid: String,
    pub value: Option<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbandonRequest {
    pub target: MessageId,
}
