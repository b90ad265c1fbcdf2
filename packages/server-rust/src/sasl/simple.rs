//! LDAP simple bind (RFC 4513 §5.1): a DN and a password in one step.

use ldapd_core::{BindAuth, BindRequest, Dn, SIMPLE_MECHANISM};

use super::{BindContext, BindStep, SaslMechanism};
use crate::error::BindError;

#[derive(Debug, Default)]
pub struct Simple;

impl SaslMechanism for Simple {
    fn name(&self) -> &str {
        SIMPLE_MECHANISM
    }

    fn step(&mut self, ctx: &BindContext<'_>, request: &BindRequest) -> Result<BindStep, BindError> {
        let BindAuth::Simple(password) = &request.auth else {
            return Err(BindError::protocol("SASL credentials sent to simple bind"));
        };
        let name = request.name.trim();

        match (name.is_empty(), password.is_empty()) {
            (true, true) => {
                return Ok(BindStep::Authenticated {
                    identity: None,
                    authorization: None,
                    server_credentials: None,
                })
            }
            (false, true) => {
                return Err(BindError::Unwilling(
                    "unauthenticated binds are not allowed".to_string(),
                ))
            }
            (true, false) => return Err(BindError::invalid("password without bind name")),
            (false, false) => {}
        }

        let Ok(dn) = Dn::parse(name) else {
            return Err(BindError::invalid("bind name is not a DN"));
        };
        let user = ctx
            .identities
            .find_by_dn(&dn)
            .map_err(|err| BindError::Internal(err.to_string()))?
            .ok_or(BindError::invalid("unknown bind DN"))?;
        if !user.verify_password(password) {
            return Err(BindError::invalid("password mismatch"));
        }
        Ok(BindStep::Authenticated {
            identity: Some(user.dn),
            authorization: None,
            server_credentials: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SaslConfig;
    use crate::password::StoredPassword;
    use crate::sasl::test_support::Users;

    fn run(name: &str, password: &str) -> Result<BindStep, BindError> {
        let users = Users::default().with("alice", StoredPassword::ssha256("pw", b"salt"), false);
        let config = SaslConfig::default();
        let ctx = BindContext {
            identities: &users,
            sasl: &config,
        };
        Simple.step(&ctx, &BindRequest::simple(name, password.as_bytes().to_vec()))
    }

    #[test]
    fn anonymous_bind() {
        let step = run("", "").unwrap();
        assert!(matches!(step, BindStep::Authenticated { identity: None, .. }));
    }

    #[test]
    fn name_without_password_is_refused() {
        let err = run("uid=alice,ou=people,o=test", "").unwrap_err();
        assert!(matches!(err, BindError::Unwilling(_)));
    }

    #[test]
    fn verifies_against_stored_hash() {
        let step = run("uid=alice,ou=people,o=test", "pw").unwrap();
        assert!(matches!(
            step,
            BindStep::Authenticated { identity: Some(ref dn), .. } if dn.to_string() == "uid=alice,ou=people,o=test"
        ));
    }

    #[test]
    fn failures_are_invalid_credentials() {
        for (name, password) in [
            ("uid=alice,ou=people,o=test", "wrong"),
            ("uid=bob,ou=people,o=test", "pw"),
            ("garbage", "pw"),
            ("", "pw"),
        ] {
            let err = run(name, password).unwrap_err();
            assert!(matches!(err, BindError::InvalidCredentials { .. }), "{name}");
        }
    }
}
