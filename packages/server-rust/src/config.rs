//! Server configuration: worker pool sizing, admission policy, bind policy,
//! SASL settings, and logging.
//!
//! Every field has a default, so an empty JSON object is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest accepted worker thread count (2^31 - 1).
pub const MAX_WORKER_THREADS: u32 = i32::MAX as u32;

/// Default capacity of a bounded work queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Top-level configuration for the request-processing core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Target number of worker threads. Valid range is `1..=MAX_WORKER_THREADS`.
    pub worker_threads: u32,
    /// Work queue admission policy.
    pub admission: QueuePolicy,
    /// What a failed bind does to the connection's identity.
    pub failed_bind: FailedBindPolicy,
    /// SASL mechanism settings.
    pub sasl: SaslConfig,
    /// How long shutdown waits for running operations before giving up.
    pub drain_timeout_ms: u64,
    /// Log output settings.
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            admission: QueuePolicy::default(),
            failed_bind: FailedBindPolicy::default(),
            sasl: SaslConfig::default(),
            drain_timeout_ms: 30_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and any error
    /// `validate` reports.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` if the file cannot be read, otherwise as
    /// [`ServerConfig::from_json`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_worker_threads(u64::from(self.worker_threads))?;
        if let QueuePolicy::Bounded { capacity: 0 } = self.admission {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.sasl.enabled_mechanisms.iter().any(|m| m.trim().is_empty()) {
            return Err(ConfigError::UnknownMechanism(String::new()));
        }
        Ok(())
    }
}

/// Rejects worker counts outside `1..=MAX_WORKER_THREADS`.
///
/// # Errors
///
/// Returns `ConfigError::WorkerThreads` when `value` is out of range.
pub fn validate_worker_threads(value: u64) -> Result<u32, ConfigError> {
    match u32::try_from(value) {
        Ok(n) if (1..=MAX_WORKER_THREADS).contains(&n) => Ok(n),
        _ => Err(ConfigError::WorkerThreads {
            value,
            max: MAX_WORKER_THREADS,
        }),
    }
}

fn default_worker_threads() -> u32 {
    std::thread::available_parallelism()
        .ok()
        .and_then(|n| u32::try_from(n.get() * 2).ok())
        .unwrap_or(8)
}

/// Work queue admission policy.
///
/// `Unbounded` accepts every operation and can grow without limit under
/// sustained overload; it exists for compatibility with older deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QueuePolicy {
    Unbounded,
    Bounded { capacity: usize },
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::Bounded {
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl QueuePolicy {
    /// `None` when unbounded.
    #[must_use]
    pub fn capacity(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Bounded { capacity } => Some(capacity),
        }
    }
}

/// Identity a connection ends up with after a bind fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedBindPolicy {
    /// Keep whatever identity the connection had before the bind.
    #[default]
    RetainPrevious,
    /// Drop back to anonymous.
    ResetToAnonymous,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaslConfig {
    /// Mechanisms clients may request. Simple binds are always available.
    pub enabled_mechanisms: Vec<String>,
    /// DIGEST-MD5 realm. Defaults to `server_fqdn`, then `"ldapd"`.
    pub realm: Option<String>,
    /// When set, the DIGEST-MD5 `digest-uri` host must equal this name.
    pub server_fqdn: Option<String>,
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            enabled_mechanisms: vec!["DIGEST-MD5".to_string(), "PLAIN".to_string()],
            realm: None,
            server_fqdn: None,
        }
    }
}

impl SaslConfig {
    /// The realm offered in DIGEST-MD5 challenges.
    #[must_use]
    pub fn effective_realm(&self) -> &str {
        self.realm
            .as_deref()
            .or(self.server_fqdn.as_deref())
            .unwrap_or("ldapd")
    }

    /// Case-insensitive membership test.
    #[must_use]
    pub fn is_enabled(&self, mechanism: &str) -> bool {
        self.enabled_mechanisms
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mechanism))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(
            config.admission,
            QueuePolicy::Bounded {
                capacity: DEFAULT_QUEUE_CAPACITY
            }
        );
        assert_eq!(config.failed_bind, FailedBindPolicy::RetainPrevious);
        assert!(config.sasl.is_enabled("digest-md5"));
        config.validate().unwrap();
    }

    #[test]
    fn empty_object_uses_defaults() {
        let config = ServerConfig::from_json("{}").unwrap();
        assert_eq!(config.drain_timeout_ms, 30_000);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn parses_every_section() {
        let config = ServerConfig::from_json(
            r#"{
                "worker_threads": 3,
                "admission": {"mode": "unbounded"},
                "failed_bind": "reset_to_anonymous",
                "sasl": {"enabled_mechanisms": ["PLAIN"], "realm": "example.com"},
                "logging": {"filter": "debug", "json": true}
            }"#,
        )
        .unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.admission, QueuePolicy::Unbounded);
        assert_eq!(config.admission.capacity(), None);
        assert_eq!(config.failed_bind, FailedBindPolicy::ResetToAnonymous);
        assert!(!config.sasl.is_enabled("DIGEST-MD5"));
        assert_eq!(config.sasl.effective_realm(), "example.com");
        assert!(config.logging.json);
    }

    #[test]
    fn rejects_zero_workers() {
        let err = ServerConfig::from_json(r#"{"worker_threads": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::WorkerThreads { value: 0, .. }));
    }

    #[test]
    fn worker_thread_range() {
        assert_eq!(validate_worker_threads(1).unwrap(), 1);
        assert_eq!(
            validate_worker_threads(u64::from(MAX_WORKER_THREADS)).unwrap(),
            MAX_WORKER_THREADS
        );
        assert!(validate_worker_threads(0).is_err());
        assert!(validate_worker_threads(1 << 31).is_err());
    }

    #[test]
    fn rejects_zero_capacity() {
        let err =
            ServerConfig::from_json(r#"{"admission": {"mode": "bounded", "capacity": 0}}"#)
                .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroCapacity));
    }

    #[test]
    fn realm_falls_back_to_fqdn() {
        let sasl = SaslConfig {
            server_fqdn: Some("ldap.example.com".into()),
            ..SaslConfig::default()
        };
        assert_eq!(sasl.effective_realm(), "ldap.example.com");
        assert_eq!(SaslConfig::default().effective_realm(), "ldapd");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"worker_threads": 5}}"#).unwrap();
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.worker_threads, 5);

        let missing = ServerConfig::load(file.path().with_extension("missing")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = ServerConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
