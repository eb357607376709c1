//! Configuration structures for the realm directory access layer.
//!
//! [`RealmConfig`] describes where the directory lives, which part of the tree belongs to the
//! realm and how connections are secured. It can be built in code or loaded from a JSON file.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;
use validator::{Validate, ValidationError};

/// Configuration of one realm.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RealmConfig {
    /// Directory server URI (`ldap://`, `ldaps://` or `ldapi://`)
    #[validate(custom(function = "validate_ldap_uri"))]
    pub ldap_uri: String,

    /// Base DN of the realm tree
    #[validate(length(min = 1))]
    pub basedn: String,

    /// Fully qualified host name of the directory server
    #[validate(length(min = 1, max = 253))]
    pub host: String,

    /// Primary DNS domain of the realm
    #[serde(default)]
    pub domain: String,

    /// Kerberos realm name
    #[serde(default)]
    pub realm: String,

    /// Whether to verify TLS certificates
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,

    /// Optional path to custom CA certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_ca_cert: Option<PathBuf>,

    /// Connection timeout in seconds
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Per-operation timeout in seconds
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Minimum security strength factor configured for the local transport
    #[serde(default)]
    pub min_ssf: u32,

    /// Maximum security strength factor configured for the local transport
    #[serde(default)]
    pub max_ssf: u32,
}

const fn default_tls_verify() -> bool {
    true
}

const fn default_connection_timeout_secs() -> u64 {
    10
}

const fn default_operation_timeout_secs() -> u64 {
    15
}

fn validate_ldap_uri(uri: &str) -> Result<(), ValidationError> {
    let url = Url::parse(uri).map_err(|_| ValidationError::new("ldap_uri"))?;
    match url.scheme() {
        "ldap" | "ldaps" | "ldapi" => Ok(()),
        _ => Err(ValidationError::new("ldap_uri_scheme")),
    }
}

impl RealmConfig {
    /// Create a new realm configuration with required parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is invalid or validation fails.
    pub fn new(
        ldap_uri: impl Into<String>,
        basedn: impl Into<String>,
        host: impl Into<String>,
    ) -> Result<Self, Error> {
        let config = Self {
            ldap_uri: ldap_uri.into(),
            basedn: basedn.into(),
            host: host.into(),
            domain: String::new(),
            realm: String::new(),
            tls_verify: default_tls_verify(),
            tls_ca_cert: None,
            connection_timeout_secs: default_connection_timeout_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            min_ssf: 0,
            max_ssf: 0,
        };

        config
            .validate()
            .map_err(|e| Error::ConfigError(format!("Invalid configuration: {e}")))?;

        Ok(config)
    }

    /// Load and validate a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config
            .validate()
            .map_err(|e| Error::ConfigError(format!("Invalid configuration: {e}")))?;
        Ok(config)
    }

    /// Set the primary DNS domain.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the Kerberos realm.
    #[must_use]
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Set whether to verify TLS certificates.
    #[must_use]
    pub const fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Set custom CA certificate path.
    #[must_use]
    pub fn with_ca_cert(mut self, path: PathBuf) -> Self {
        self.tls_ca_cert = Some(path);
        self
    }

    /// Set connection timeout in seconds.
    #[must_use]
    pub const fn with_connection_timeout(mut self, seconds: u64) -> Self {
        self.connection_timeout_secs = seconds;
        self
    }

    /// Set operation timeout in seconds.
    #[must_use]
    pub const fn with_operation_timeout(mut self, seconds: u64) -> Self {
        self.operation_timeout_secs = seconds;
        self
    }

    /// Set the local SSF bounds.
    #[must_use]
    pub const fn with_ssf(mut self, min_ssf: u32, max_ssf: u32) -> Self {
        self.min_ssf = min_ssf;
        self.max_ssf = max_ssf;
        self
    }

    /// Get the connection timeout as a Duration.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get the operation timeout as a Duration.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Parse the directory URI.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI cannot be parsed.
    pub fn parse_ldap_uri(&self) -> Result<Url, Error> {
        Url::parse(&self.ldap_uri)
            .map_err(|e| Error::ConfigError(format!("Invalid directory URI: {e}")))
    }
}
