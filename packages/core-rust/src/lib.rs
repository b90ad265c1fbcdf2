//! `ldapd` core data model: operations, entries, distinguished names, auth state and result codes.

pub mod auth;
pub mod condition;
pub mod dn;
pub mod entry;
pub mod filter;
pub mod operation;
pub mod request;
pub mod result;

pub use auth::{AuthState, BindPhase, BindState};
pub use condition::ConditionResult;
pub use dn::{Dn, DnError, Rdn};
pub use entry::Entry;
pub use filter::{AttributeMatcher, Filter};
pub use operation::{ConnectionId, MessageId, Operation};
pub use request::{
    AbandonRequest, AddRequest, BindAuth, BindRequest, CompareRequest, DeleteRequest,
    ExtendedRequest, Modification, ModificationType, ModifyRequest, OperationKind, Request,
    SearchRequest, SearchScope, SIMPLE_MECHANISM,
};
pub use result::{LdapResult, ResultCode};
