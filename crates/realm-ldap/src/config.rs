//! Typed view of the realm configuration used by the directory backend.

use crate::{dn::DistinguishedName, session::TransportSecurity, Result};
use realm_core::{Error, RealmConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default connection timeout (seconds).
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;
/// Default operation timeout (seconds).
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 15;

/// How the directory URI reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScheme {
    /// Cleartext TCP (`ldap://`).
    Ldap,
    /// TLS from the first byte (`ldaps://`).
    Ldaps,
    /// Local UNIX socket (`ldapi://`).
    Ldapi,
}

impl TransportScheme {
    /// Returns true if the transport is confidential without further negotiation.
    #[must_use]
    pub const fn is_secure(self) -> bool {
        matches!(self, Self::Ldaps | Self::Ldapi)
    }
}

/// Security strength factor bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SsfPolicy {
    /// Minimum acceptable SSF.
    pub min: u32,
    /// Maximum SSF.
    pub max: u32,
}

impl SsfPolicy {
    /// Lowest SSF a bound session may run with.
    pub const MINIMUM: u32 = 56;

    /// Raises the bounds so that the session is at least [`Self::MINIMUM`] strong.
    #[must_use]
    pub const fn enforce_minimum(self) -> Self {
        let min = if self.min < Self::MINIMUM {
            Self::MINIMUM
        } else {
            self.min
        };
        let max = if self.max < min { min } else { self.max };
        Self { min, max }
    }
}

/// Directory backend configuration derived from a [`RealmConfig`].
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    uri: String,
    scheme: TransportScheme,
    base_dn: DistinguishedName,
    host: String,
    domain: String,
    realm: String,
    tls_verify: bool,
    tls_ca_cert: Option<PathBuf>,
    connection_timeout_secs: u64,
    operation_timeout_secs: u64,
    ssf: SsfPolicy,
}

impl DirectoryConfig {
    /// Creates a configuration with default timeouts and TLS verification.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is invalid or uses an unknown scheme.
    pub fn new(
        uri: impl Into<String>,
        base_dn: DistinguishedName,
        host: impl Into<String>,
    ) -> Result<Self> {
        let uri = uri.into();
        let scheme = parse_scheme(&uri)?;
        Ok(Self {
            uri,
            scheme,
            base_dn,
            host: host.into(),
            domain: String::new(),
            realm: String::new(),
            tls_verify: true,
            tls_ca_cert: None,
            connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            ssf: SsfPolicy::default(),
        })
    }

    /// Derives the backend configuration from the realm configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI or the base DN cannot be parsed.
    pub fn from_realm(config: &RealmConfig) -> Result<Self> {
        let base_dn = DistinguishedName::parse(&config.basedn)?;
        let mut directory = Self::new(config.ldap_uri.clone(), base_dn, config.host.clone())?
            .with_tls_verification(config.tls_verify)
            .with_connection_timeout_secs(config.connection_timeout_secs)
            .with_operation_timeout_secs(config.operation_timeout_secs)
            .with_ssf(SsfPolicy {
                min: config.min_ssf,
                max: config.max_ssf,
            });
        directory.domain.clone_from(&config.domain);
        directory.realm.clone_from(&config.realm);
        directory.tls_ca_cert.clone_from(&config.tls_ca_cert);
        Ok(directory)
    }

    /// Returns the directory URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the transport scheme of the URI.
    #[must_use]
    pub const fn scheme(&self) -> TransportScheme {
        self.scheme
    }

    /// Returns the base distinguished name of the realm.
    #[must_use]
    pub const fn base_dn(&self) -> &DistinguishedName {
        &self.base_dn
    }

    /// Returns the directory server host name.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the primary DNS domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Returns the Kerberos realm.
    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Returns whether TLS certificate verification is enabled.
    #[must_use]
    pub const fn tls_verify(&self) -> bool {
        self.tls_verify
    }

    /// Optional custom CA certificate path.
    #[must_use]
    pub fn tls_ca_cert(&self) -> Option<&Path> {
        self.tls_ca_cert.as_deref()
    }

    /// Returns the connection timeout duration.
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Returns the operation timeout duration.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Returns the configured SSF bounds, before the minimum is enforced.
    #[must_use]
    pub const fn ssf(&self) -> SsfPolicy {
        self.ssf
    }

    /// Sets the primary DNS domain.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub const fn with_tls_verification(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Overrides the connection timeout in seconds.
    #[must_use]
    pub const fn with_connection_timeout_secs(mut self, seconds: u64) -> Self {
        self.connection_timeout_secs = seconds;
        self
    }

    /// Overrides the operation timeout in seconds.
    #[must_use]
    pub const fn with_operation_timeout_secs(mut self, seconds: u64) -> Self {
        self.operation_timeout_secs = seconds;
        self
    }

    /// Overrides the local SSF bounds.
    #[must_use]
    pub const fn with_ssf(mut self, ssf: SsfPolicy) -> Self {
        self.ssf = ssf;
        self
    }

    /// Chooses transport protection for a bind.
    ///
    /// The SSF minimum is always enforced. Cleartext URIs are upgraded with StartTLS unless
    /// the bind negotiates its own confidentiality layer (GSSAPI).
    #[must_use]
    pub fn transport_security(&self, gssapi: bool) -> TransportSecurity {
        let ssf = self.ssf.enforce_minimum();
        TransportSecurity {
            starttls: self.scheme == TransportScheme::Ldap && !gssapi,
            min_ssf: ssf.min,
            max_ssf: ssf.max,
        }
    }
}

fn parse_scheme(uri: &str) -> Result<TransportScheme> {
    let url = url::Url::parse(uri)?;
    match url.scheme() {
        "ldap" => Ok(TransportScheme::Ldap),
        "ldaps" => Ok(TransportScheme::Ldaps),
        "ldapi" => Ok(TransportScheme::Ldapi),
        other => Err(Error::ConfigError(format!(
            "unsupported directory URI scheme: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DistinguishedName {
        DistinguishedName::parse("dc=example,dc=com").unwrap()
    }

    #[test]
    fn ssf_minimum_raises_both_bounds() {
        let policy = SsfPolicy { min: 0, max: 0 }.enforce_minimum();
        assert_eq!(policy, SsfPolicy { min: 56, max: 56 });

        let policy = SsfPolicy { min: 0, max: 256 }.enforce_minimum();
        assert_eq!(policy, SsfPolicy { min: 56, max: 256 });

        let policy = SsfPolicy { min: 128, max: 64 }.enforce_minimum();
        assert_eq!(policy, SsfPolicy { min: 128, max: 128 });
    }

    #[test]
    fn scheme_classification() {
        let ldap = DirectoryConfig::new("ldap://ipa.example.com", base(), "ipa").unwrap();
        assert_eq!(ldap.scheme(), TransportScheme::Ldap);
        assert!(!ldap.scheme().is_secure());

        let ldapi = DirectoryConfig::new(
            "ldapi://%2fvar%2frun%2fslapd-EXAMPLE-COM.socket",
            base(),
            "ipa",
        )
        .unwrap();
        assert!(ldapi.scheme().is_secure());

        assert!(matches!(
            DirectoryConfig::new("http://ipa.example.com", base(), "ipa"),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn starttls_only_for_cleartext_non_gssapi() {
        let ldap = DirectoryConfig::new("ldap://ipa.example.com", base(), "ipa").unwrap();
        assert!(ldap.transport_security(false).starttls);
        assert!(!ldap.transport_security(true).starttls);
        assert_eq!(ldap.transport_security(true).min_ssf, 56);

        let ldaps = DirectoryConfig::new("ldaps://ipa.example.com", base(), "ipa").unwrap();
        assert!(!ldaps.transport_security(false).starttls);
    }

    #[test]
    fn from_realm_config() {
        let realm = RealmConfig::new("ldaps://ipa.example.com", "dc=example,dc=com", "ipa.example.com")
            .unwrap()
            .with_domain("example.com")
            .with_realm("EXAMPLE.COM")
            .with_operation_timeout(30)
            .with_ssf(0, 256);

        let config = DirectoryConfig::from_realm(&realm).unwrap();
        assert_eq!(config.base_dn(), &base());
        assert_eq!(config.host(), "ipa.example.com");
        assert_eq!(config.domain(), "example.com");
        assert_eq!(config.realm(), "EXAMPLE.COM");
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
        assert_eq!(config.ssf(), SsfPolicy { min: 0, max: 256 });
        assert!(config.tls_verify());
    }

    #[test]
    fn from_realm_rejects_bad_base_dn() {
        let mut realm =
            RealmConfig::new("ldap://ipa.example.com", "dc=example,dc=com", "ipa").unwrap();
        realm.basedn = "not a dn".to_string();
        assert!(matches!(
            DirectoryConfig::from_realm(&realm),
            Err(Error::InvalidSyntax(_))
        ));
    }
}
