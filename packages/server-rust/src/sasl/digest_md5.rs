//! SASL DIGEST-MD5 (RFC 2831), initial authentication with `qop=auth` only.
//!
//! Two rounds: the first bind carries no credentials and receives a fresh
//! challenge; the second carries the digest-response. The identity named by
//! `username` is resolved before the digest is checked, and the check uses
//! the stored `H(username:realm:password)` so no cleartext comparison happens.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use ldapd_core::BindRequest;
use subtle::ConstantTimeEq;

use super::directives::{push_quoted, push_token, Directives};
use super::{resolve_authorization, resolve_identity, BindContext, BindStep, SaslMechanism};
use crate::error::BindError;
use crate::password::md5_of;

const NONCE_BYTES: usize = 16;
const DIGEST_URI_SERVICE: &str = "ldap/";

#[derive(Debug)]
enum State {
    Initial,
    Challenged { nonce: String, realm: String },
    Done,
}

#[derive(Debug)]
pub struct DigestMd5 {
    state: State,
}

impl DigestMd5 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Initial,
        }
    }

    fn challenge(&mut self, ctx: &BindContext<'_>) -> BindStep {
        let nonce_bytes: [u8; NONCE_BYTES] = rand::random();
        let nonce = BASE64.encode(nonce_bytes);
        let realm = ctx.sasl.effective_realm().to_string();

        let mut challenge = String::new();
        push_quoted(&mut challenge, "realm", &realm);
        push_quoted(&mut challenge, "nonce", &nonce);
        push_quoted(&mut challenge, "qop", "auth");
        push_token(&mut challenge, "charset", "utf-8");
        push_token(&mut challenge, "algorithm", "md5-sess");

        self.state = State::Challenged { nonce, realm };
        BindStep::Continue {
            challenge: Bytes::from(challenge),
        }
    }

    fn verify_response(
        ctx: &BindContext<'_>,
        nonce: &str,
        realm: &str,
        credentials: &[u8],
    ) -> Result<BindStep, BindError> {
        let text = std::str::from_utf8(credentials)
            .map_err(|_| BindError::protocol("digest-response is not valid UTF-8"))?;
        let directives = Directives::parse(text)
            .map_err(|err| BindError::protocol(format!("malformed digest-response: {err}")))?;
        let response = DigestResponse::from_directives(&directives)?;

        if let Some(charset) = directives.get("charset") {
            if !charset.eq_ignore_ascii_case("utf-8") {
                return Err(BindError::protocol("unsupported charset"));
            }
        }
        match response.qop {
            "auth" => {}
            _ => return Err(BindError::protocol("unsupported qop")),
        }
        let nonce_count = u32::from_str_radix(response.nc, 16)
            .ok()
            .filter(|_| response.nc.len() == 8)
            .ok_or_else(|| BindError::protocol("malformed nonce count"))?;
        if response.response.len() != 32 || hex::decode(response.response).is_err() {
            return Err(BindError::protocol("malformed response digest"));
        }

        // From here on, every failure looks the same to the client.
        let response_realm = response.realm.unwrap_or("");
        if response.realm.is_some_and(|r| r != realm) {
            return Err(BindError::invalid("realm mismatch"));
        }
        if !bool::from(response.nonce.as_bytes().ct_eq(nonce.as_bytes())) {
            return Err(BindError::invalid("nonce mismatch"));
        }
        if nonce_count != 1 {
            return Err(BindError::invalid("nonce count must be 1"));
        }
        check_digest_uri(response.digest_uri, ctx.sasl.server_fqdn.as_deref())?;

        let user = resolve_identity(ctx, response.username)?
            .ok_or(BindError::invalid("unknown user"))?;
        let secret = user
            .passwords
            .iter()
            .find_map(|stored| stored.digest_md5_secret(response.username, response_realm))
            .ok_or(BindError::invalid("no usable stored credential"))?;

        let expected = response_value(
            &secret,
            nonce,
            response.cnonce,
            response.authzid,
            response.nc,
            response.qop,
            "AUTHENTICATE",
            response.digest_uri,
        );
        let provided = response.response.to_ascii_lowercase();
        if !bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            return Err(BindError::invalid("digest mismatch"));
        }

        let authorization = match response.authzid {
            Some(authzid) => resolve_authorization(ctx, &user, authzid)?,
            None => None,
        };

        let rspauth = response_value(
            &secret,
            nonce,
            response.cnonce,
            response.authzid,
            response.nc,
            response.qop,
            "",
            response.digest_uri,
        );
        Ok(BindStep::Authenticated {
            identity: Some(user.dn),
            authorization,
            server_credentials: Some(Bytes::from(format!("rspauth={rspauth}"))),
        })
    }
}

impl Default for DigestMd5 {
    fn default() -> Self {
        Self::new()
    }
}

impl SaslMechanism for DigestMd5 {
    fn name(&self) -> &str {
        "DIGEST-MD5"
    }

    fn step(&mut self, ctx: &BindContext<'_>, request: &BindRequest) -> Result<BindStep, BindError> {
        let credentials = request.sasl_credentials().filter(|c| !c.is_empty());
        match std::mem::replace(&mut self.state, State::Done) {
            State::Initial => match credentials {
                None => Ok(self.challenge(ctx)),
                Some(_) => Err(BindError::protocol(
                    "initial DIGEST-MD5 request must not carry credentials",
                )),
            },
            State::Challenged { nonce, realm } => match credentials {
                Some(credentials) => Self::verify_response(ctx, &nonce, &realm, credentials),
                None => Err(BindError::protocol("expected a digest-response")),
            },
            State::Done => Err(BindError::protocol("DIGEST-MD5 negotiation already finished")),
        }
    }
}

/// Borrowed view of the directives a digest-response must carry.
struct DigestResponse<'a> {
    username: &'a str,
    realm: Option<&'a str>,
    nonce: &'a str,
    cnonce: &'a str,
    nc: &'a str,
    qop: &'a str,
    digest_uri: &'a str,
    response: &'a str,
    authzid: Option<&'a str>,
}

impl<'a> DigestResponse<'a> {
    fn from_directives(d: &'a Directives) -> Result<Self, BindError> {
        let required = |name: &'static str| {
            d.get(name)
                .ok_or_else(|| BindError::protocol(format!("digest-response lacks {name}")))
        };
        let cnonce = required("cnonce")?;
        if cnonce.is_empty() {
            return Err(BindError::protocol("empty cnonce"));
        }
        Ok(Self {
            username: required("username")?,
            realm: d.get("realm"),
            nonce: required("nonce")?,
            cnonce,
            nc: required("nc")?,
            qop: d.get("qop").unwrap_or("auth"),
            digest_uri: required("digest-uri")?,
            response: required("response")?,
            authzid: d.get("authzid"),
        })
    }
}

fn check_digest_uri(uri: &str, server_fqdn: Option<&str>) -> Result<(), BindError> {
    let Some(rest) = uri.strip_prefix(DIGEST_URI_SERVICE) else {
        return Err(BindError::invalid("digest-uri names another service"));
    };
    let host = rest.split('/').next().unwrap_or_default();
    match server_fqdn {
        Some(fqdn) if !host.eq_ignore_ascii_case(fqdn) => {
            Err(BindError::invalid("digest-uri names another host"))
        }
        _ => Ok(()),
    }
}

/// `response-value` of RFC 2831 §2.1.2.1. `a2_prefix` is `"AUTHENTICATE"`
/// for the client's response and empty for the server's `rspauth`.
#[allow(clippy::too_many_arguments)]
fn response_value(
    secret: &[u8; 16],
    nonce: &str,
    cnonce: &str,
    authzid: Option<&str>,
    nc: &str,
    qop: &str,
    a2_prefix: &str,
    digest_uri: &str,
) -> String {
    let mut a1: Vec<u8> = secret.to_vec();
    a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
    if let Some(authzid) = authzid {
        a1.push(b':');
        a1.extend_from_slice(authzid.as_bytes());
    }
    let ha1 = hex::encode(md5_of(&[a1.as_slice()]));
    let ha2 = hex::encode(md5_of(&[a2_prefix.as_bytes(), b":", digest_uri.as_bytes()]));
    hex::encode(md5_of(&[
        ha1.as_bytes(),
        b":",
        nonce.as_bytes(),
        b":",
        nc.as_bytes(),
        b":",
        cnonce.as_bytes(),
        b":",
        qop.as_bytes(),
        b":",
        ha2.as_bytes(),
    ]))
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Builds digest-responses to server challenges. Used by tests and the load harness.
#[derive(Debug, Clone)]
pub struct DigestMd5Client {
    username: String,
    password: String,
    host: String,
    authzid: Option<String>,
    cnonce: Option<String>,
}

impl DigestMd5Client {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
            authzid: None,
            cnonce: None,
        }
    }

    #[must_use]
    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }

    /// Fixes the client nonce instead of generating one per response.
    #[must_use]
    pub fn with_cnonce(mut self, cnonce: impl Into<String>) -> Self {
        self.cnonce = Some(cnonce.into());
        self
    }

    /// Answers `challenge`.
    ///
    /// # Errors
    ///
    /// Returns `BindError::Protocol` if the challenge is unparseable or lacks a nonce.
    pub fn respond(&self, challenge: &[u8]) -> Result<Bytes, BindError> {
        let text = std::str::from_utf8(challenge)
            .map_err(|_| BindError::protocol("challenge is not valid UTF-8"))?;
        let directives = Directives::parse(text)
            .map_err(|err| BindError::protocol(format!("malformed challenge: {err}")))?;
        let nonce = directives
            .get("nonce")
            .ok_or_else(|| BindError::protocol("challenge lacks nonce"))?;
        let realm = directives.get("realm").unwrap_or("");

        let cnonce = self
            .cnonce
            .clone()
            .unwrap_or_else(|| BASE64.encode(rand::random::<[u8; NONCE_BYTES]>()));
        let nc = "00000001";
        let digest_uri = format!("{DIGEST_URI_SERVICE}{}", self.host);
        let secret = md5_of(&[
            self.username.as_bytes(),
            b":",
            realm.as_bytes(),
            b":",
            self.password.as_bytes(),
        ]);
        let response = response_value(
            &secret,
            nonce,
            &cnonce,
            self.authzid.as_deref(),
            nc,
            "auth",
            "AUTHENTICATE",
            &digest_uri,
        );

        let mut out = String::new();
        push_token(&mut out, "charset", "utf-8");
        push_quoted(&mut out, "username", &self.username);
        push_quoted(&mut out, "realm", realm);
        push_quoted(&mut out, "nonce", nonce);
        push_token(&mut out, "nc", nc);
        push_quoted(&mut out, "cnonce", &cnonce);
        push_quoted(&mut out, "digest-uri", &digest_uri);
        push_token(&mut out, "response", &response);
        push_token(&mut out, "qop", "auth");
        if let Some(authzid) = &self.authzid {
            push_quoted(&mut out, "authzid", authzid);
        }
        Ok(Bytes::from(out))
    }
}
