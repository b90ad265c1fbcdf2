//! SASL PLAIN (RFC 4616): `[authzid] NUL authcid NUL passwd`.

use bytes::Bytes;
use ldapd_core::BindRequest;

use super::{resolve_authorization, resolve_identity, BindContext, BindStep, SaslMechanism};
use crate::error::BindError;

#[derive(Debug, Default)]
pub struct Plain {
    challenged: bool,
}

impl Plain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn step(&mut self, ctx: &BindContext<'_>, request: &BindRequest) -> Result<BindStep, BindError> {
        let Some(credentials) = request.sasl_credentials() else {
            if self.challenged {
                return Err(BindError::protocol("PLAIN response carried no credentials"));
            }
            self.challenged = true;
            return Ok(BindStep::Continue {
                challenge: Bytes::new(),
            });
        };

        let malformed = || BindError::protocol("malformed PLAIN credentials");
        let text = std::str::from_utf8(credentials).map_err(|_| malformed())?;
        let mut parts = text.split('\0');
        let (Some(authzid), Some(authcid), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        if authcid.is_empty() || password.is_empty() {
            return Err(malformed());
        }

        let user = resolve_identity(ctx, authcid)?.ok_or(BindError::invalid("unknown user"))?;
        if !user.verify_password(password.as_bytes()) {
            return Err(BindError::invalid("password mismatch"));
        }
        // An empty authzid means "act as myself".
        let authorization = if authzid.is_empty() {
            None
        } else {
            resolve_authorization(ctx, &user, authzid)?
        };

        Ok(BindStep::Authenticated {
            identity: Some(user.dn),
            authorization,
            server_credentials: None,
        })
    }
}
