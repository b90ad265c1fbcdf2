//! LDAP result codes and the result object handed back to the protocol layer.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::entry::Entry;
use crate::operation::MessageId;

/// The subset of RFC 4511 result codes this server core can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    SaslBindInProgress,
    NoSuchAttribute,
    NoSuchObject,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    NotAllowedOnNonLeaf,
    EntryAlreadyExists,
    Other,
    Canceled,
}

impl ResultCode {
    /// Numeric value as carried on the wire.
    #[must_use]
    pub const fn value(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::OperationsError => 1,
            Self::ProtocolError => 2,
            Self::SizeLimitExceeded => 4,
            Self::CompareFalse => 5,
            Self::CompareTrue => 6,
            Self::AuthMethodNotSupported => 7,
            Self::SaslBindInProgress => 14,
            Self::NoSuchAttribute => 16,
            Self::NoSuchObject => 32,
            Self::InvalidCredentials => 49,
            Self::InsufficientAccessRights => 50,
            Self::Busy => 51,
            Self::Unavailable => 52,
            Self::UnwillingToPerform => 53,
            Self::NotAllowedOnNonLeaf => 66,
            Self::EntryAlreadyExists => 68,
            Self::Other => 80,
            Self::Canceled => 118,
        }
    }

    /// Stable lower-camel-case name, used as a metrics label.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::OperationsError => "operationsError",
            Self::ProtocolError => "protocolError",
            Self::SizeLimitExceeded => "sizeLimitExceeded",
            Self::CompareFalse => "compareFalse",
            Self::CompareTrue => "compareTrue",
            Self::AuthMethodNotSupported => "authMethodNotSupported",
            Self::SaslBindInProgress => "saslBindInProgress",
            Self::NoSuchAttribute => "noSuchAttribute",
            Self::NoSuchObject => "noSuchObject",
            Self::InvalidCredentials => "invalidCredentials",
            Self::InsufficientAccessRights => "insufficientAccessRights",
            Self::Busy => "busy",
            Self::Unavailable => "unavailable",
            Self::UnwillingToPerform => "unwillingToPerform",
            Self::NotAllowedOnNonLeaf => "notAllowedOnNonLeaf",
            Self::EntryAlreadyExists => "entryAlreadyExists",
            Self::Other => "other",
            Self::Canceled => "canceled",
        }
    }

    /// Success-class codes: the operation did what was asked, including a
    /// compare that answered false and a bind that wants another round.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(
            self,
            Self::Success | Self::CompareFalse | Self::CompareTrue | Self::SaslBindInProgress
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.value())
    }
}

/// Terminal result of one operation, delivered to the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub message_id: MessageId,
    pub code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    /// Server SASL credentials (challenge or `rspauth`) on bind responses.
    pub server_sasl_credentials: Option<Bytes>,
    /// Extended operation response name.
    pub response_name: Option<String>,
    /// Extended operation response value.
    pub response_value: Option<Bytes>,
    /// Search result entries, in the order the backend produced them.
    pub entries: Vec<Entry>,
}

impl LdapResult {
    #[must_use]
    pub fn new(message_id: MessageId, code: ResultCode) -> Self {
        Self {
            message_id,
            code,
            matched_dn: String::new(),
            diagnostic_message: String::new(),
            server_sasl_credentials: None,
            response_name: None,
            response_value: None,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn success(message_id: MessageId) -> Self {
        Self::new(message_id, ResultCode::Success)
    }

    #[must_use]
    pub fn with_diagnostic(mut self, message: impl Into<String>) -> Self {
        self.diagnostic_message = message.into();
        self
    }

    #[must_use]
    pub fn with_matched_dn(mut self, dn: impl Into<String>) -> Self {
        self.matched_dn = dn.into();
        self
    }

    #[must_use]
    pub fn with_sasl_credentials(mut self, credentials: Bytes) -> Self {
        self.server_sasl_credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_entries(mut self, entries: Vec<Entry>) -> Self {
        self.entries = entries;
        self
    }

    #[must_use]
    pub fn with_response(mut self, name: Option<String>, value: Option<Bytes>) -> Self {
        self.response_name = name;
        self.response_value = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_match_rfc_4511() {
        assert_eq!(ResultCode::Success.value(), 0);
        assert_eq!(ResultCode::SaslBindInProgress.value(), 14);
        assert_eq!(ResultCode::InvalidCredentials.value(), 49);
        assert_eq!(ResultCode::Busy.value(), 51);
        assert_eq!(ResultCode::Canceled.value(), 118);
    }

    #[test]
    fn success_class() {
        assert!(ResultCode::SaslBindInProgress.is_success());
        assert!(ResultCode::CompareFalse.is_success());
        assert!(!ResultCode::ProtocolError.is_success());
        assert!(!ResultCode::Canceled.is_success());
    }

    #[test]
    fn builder_sets_fields() {
        let result = LdapResult::new(MessageId(7), ResultCode::InvalidCredentials)
            .with_diagnostic("invalid credentials")
            .with_sasl_credentials(Bytes::from_static(b"x"));
        assert_eq!(result.message_id, MessageId(7));
        assert_eq!(result.diagnostic_message, "invalid credentials");
        assert_eq!(result.server_sasl_credentials.as_deref(), Some(&b"x"[..]));
        assert!(result.entries.is_empty());
    }

    #[test]
    fn display_includes_name_and_value() {
        assert_eq!(ResultCode::ProtocolError.to_string(), "protocolError (2)");
    }
}
