//! Stored password schemes (`userPassword` values with a `{SCHEME}` prefix).
//!
//! | Scheme         | Payload                          | Reversible |
//! |----------------|----------------------------------|------------|
//! | `{CLEAR}`      | the password                     | yes        |
//! | `{SSHA256}`    | base64(SHA-256(pw + salt) + salt)| no         |
//! | `{DIGEST-MD5}` | `realm:hex(MD5(user:realm:pw))`  | no         |
//!
//! A value without a prefix is treated as `{CLEAR}`. All comparisons are
//! constant time.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::Md5;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const SHA256_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PasswordError {
    #[error("unknown password storage scheme: {0}")]
    UnknownScheme(String),
    #[error("malformed {scheme} value: {reason}")]
    Malformed {
        scheme: &'static str,
        reason: &'static str,
    },
}

#[derive(Clone, PartialEq, Eq)]
pub enum StoredPassword {
    Clear(String),
    SaltedSha256 {
        digest: [u8; SHA256_LEN],
        salt: Vec<u8>,
    },
    /// Pre-digested DIGEST-MD5 secret `H(username:realm:password)`.
    DigestMd5 { realm: String, secret: [u8; 16] },
}

// Keeps secrets out of logs.
impl std::fmt::Debug for StoredPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.scheme())
    }
}

impl StoredPassword {
    /// Parses a stored `userPassword` value.
    ///
    /// # Errors
    ///
    /// Returns `PasswordError` for an unrecognised scheme or an undecodable payload.
    pub fn parse(value: &str) -> Result<Self, PasswordError> {
        let Some((scheme, payload)) = value
            .strip_prefix('{')
            .and_then(|rest| rest.split_once('}'))
        else {
            return Ok(Self::Clear(value.to_string()));
        };

        match scheme.to_ascii_uppercase().as_str() {
            "CLEAR" => Ok(Self::Clear(payload.to_string())),
            "SSHA256" => {
                let raw = BASE64.decode(payload).map_err(|_| PasswordError::Malformed {
                    scheme: "{SSHA256}",
                    reason: "invalid base64",
                })?;
                if raw.len() <= SHA256_LEN {
                    return Err(PasswordError::Malformed {
                        scheme: "{SSHA256}",
                        reason: "missing salt",
                    });
                }
                let (digest, salt) = raw.split_at(SHA256_LEN);
                let mut fixed = [0u8; SHA256_LEN];
                fixed.copy_from_slice(digest);
                Ok(Self::SaltedSha256 {
                    digest: fixed,
                    salt: salt.to_vec(),
                })
            }
            "DIGEST-MD5" => {
                let malformed = |reason| PasswordError::Malformed {
                    scheme: "{DIGEST-MD5}",
                    reason,
                };
                let (realm, hex_secret) =
                    payload.rsplit_once(':').ok_or(malformed("missing realm"))?;
                let bytes = hex::decode(hex_secret).map_err(|_| malformed("invalid hex"))?;
                let secret: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| malformed("secret must be 16 bytes"))?;
                Ok(Self::DigestMd5 {
                    realm: realm.to_string(),
                    secret,
                })
            }
            other => Err(PasswordError::UnknownScheme(other.to_string())),
        }
    }

    /// Salted SHA-256 with the given salt.
    #[must_use]
    pub fn ssha256(password: &str, salt: &[u8]) -> Self {
        Self::SaltedSha256 {
            digest: salted_sha256(password.as_bytes(), salt),
            salt: salt.to_vec(),
        }
    }

    /// Salted SHA-256 with a fresh random 16-byte salt.
    #[must_use]
    pub fn ssha256_random(password: &str) -> Self {
        let salt: [u8; 16] = rand::random();
        Self::ssha256(password, &salt)
    }

    #[must_use]
    pub fn digest_md5(username: &str, realm: &str, password: &str) -> Self {
        Self::DigestMd5 {
            realm: realm.to_string(),
            secret: digest_md5_secret(username, realm, password.as_bytes()),
        }
    }

    #[must_use]
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Clear(_) => "{CLEAR}",
            Self::SaltedSha256 { .. } => "{SSHA256}",
            Self::DigestMd5 { .. } => "{DIGEST-MD5}",
        }
    }

    /// The stored form, prefix included.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Clear(password) => format!("{{CLEAR}}{password}"),
            Self::SaltedSha256 { digest, salt } => {
                let mut raw = digest.to_vec();
                raw.extend_from_slice(salt);
                format!("{{SSHA256}}{}", BASE64.encode(raw))
            }
            Self::DigestMd5 { realm, secret } => {
                format!("{{DIGEST-MD5}}{realm}:{}", hex::encode(secret))
            }
        }
    }

    /// Checks a cleartext candidate. `username` is only used by the
    /// DIGEST-MD5 scheme, whose secret is bound to the login name.
    #[must_use]
    pub fn verify(&self, username: &str, candidate: &[u8]) -> bool {
        match self {
            Self::Clear(password) => password.as_bytes().ct_eq(candidate).into(),
            Self::SaltedSha256 { digest, salt } => {
                salted_sha256(candidate, salt)[..].ct_eq(&digest[..]).into()
            }
            Self::DigestMd5 { realm, secret } => digest_md5_secret(username, realm, candidate)[..]
                .ct_eq(&secret[..])
                .into(),
        }
    }

    /// `H(username:realm:password)` if this stored form can produce it.
    ///
    /// One-way hashes cannot; a pre-digested secret only can for its own realm.
    #[must_use]
    pub fn digest_md5_secret(&self, username: &str, realm: &str) -> Option<[u8; 16]> {
        match self {
            Self::Clear(password) => Some(digest_md5_secret(username, realm, password.as_bytes())),
            Self::DigestMd5 {
                realm: stored_realm,
                secret,
            } if stored_realm == realm => Some(*secret),
            _ => None,
        }
    }
}

fn salted_sha256(password: &[u8], salt: &[u8]) -> [u8; SHA256_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(salt);
    hasher.finalize().into()
}

fn digest_md5_secret(username: &str, realm: &str, password: &[u8]) -> [u8; 16] {
    md5_of(&[username.as_bytes(), b":", realm.as_bytes(), b":", password])
}

/// MD5 over the concatenation of `parts`.
pub(crate) fn md5_of(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprefixed_values_are_clear() {
        let stored = StoredPassword::parse("secret").unwrap();
        assert_eq!(stored, StoredPassword::Clear("secret".into()));
        assert!(stored.verify("u", b"secret"));
        assert!(!stored.verify("u", b"Secret"));
    }

    #[test]
    fn ssha256_encode_parse_verify() {
        let stored = StoredPassword::ssha256("hunter2", b"0123456789abcdef");
        let parsed = StoredPassword::parse(&stored.encode()).unwrap();
        assert_eq!(parsed, stored);
        assert!(parsed.verify("ignored", b"hunter2"));
        assert!(!parsed.verify("ignored", b"hunter3"));
        assert_eq!(parsed.digest_md5_secret("u", "realm"), None);
    }

    #[test]
    fn random_salts_differ() {
        let a = StoredPassword::ssha256_random("pw");
        let b = StoredPassword::ssha256_random("pw");
        assert_ne!(a, b);
        assert!(a.verify("", b"pw") && b.verify("", b"pw"));
    }

    #[test]
    fn digest_md5_scheme_is_realm_bound() {
        let stored = StoredPassword::digest_md5("chris", "elwood.innosoft.com", "secret");
        let parsed = StoredPassword::parse(&stored.encode()).unwrap();
        assert_eq!(parsed, stored);
        assert!(parsed.verify("chris", b"secret"));
        assert!(!parsed.verify("other", b"secret"));
        assert!(parsed.digest_md5_secret("chris", "elwood.innosoft.com").is_some());
        assert!(parsed.digest_md5_secret("chris", "other.realm").is_none());

        let clear = StoredPassword::Clear("secret".into());
        assert_eq!(
            clear.digest_md5_secret("chris", "elwood.innosoft.com"),
            parsed.digest_md5_secret("chris", "elwood.innosoft.com")
        );
    }

    #[test]
    fn malformed_values() {
        assert!(matches!(
            StoredPassword::parse("{MD4}abc"),
            Err(PasswordError::UnknownScheme(_))
        ));
        assert!(matches!(
            StoredPassword::parse("{SSHA256}!!!"),
            Err(PasswordError::Malformed { .. })
        ));
        assert!(matches!(
            StoredPassword::parse("{DIGEST-MD5}realm:abcd"),
            Err(PasswordError::Malformed { .. })
        ));
    }

    #[test]
    fn debug_hides_secret() {
        let stored = StoredPassword::Clear("topsecret".into());
        assert_eq!(format!("{stored:?}"), "{CLEAR}");
    }
}
