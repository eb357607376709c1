//! Directory transport seam and its `ldap3` implementation.
//!
//! Everything above this module talks to the directory through [`LdapConnector`] and
//! [`LdapSession`]. Result codes are translated into [`realm_core::Error`] here, except for the
//! limit codes of a search which are reported as truncation.

use crate::{config::DirectoryConfig, Result};
use async_trait::async_trait;
use ldap3::{
    adapters::PagedResults, controls::RawControl, exop::PasswordModify, LdapConnAsync,
    LdapConnSettings, LdapError, Mod, Scope, SearchEntry, SearchOptions,
};
use native_tls::{Certificate, TlsConnector};
use realm_core::error::result_code;
use realm_core::Error;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Page size used for paged searches.
pub const PAGE_SIZE: i32 = 100;

/// Attribute list requesting no attributes at all (RFC 4511).
pub const NO_ATTRIBUTES: &str = "1.1";

/// Represents the search scope for LDAP queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// One level below the base.
    OneLevel,
    /// Entire subtree.
    #[default]
    Subtree,
}

impl From<SearchScope> for Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }
}

/// A server control attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerControl {
    /// Control OID.
    pub oid: String,
    /// Whether the server must reject the operation if it does not support the control.
    pub critical: bool,
    /// Encoded control value.
    pub value: Option<Vec<u8>>,
}

impl From<&ServerControl> for RawControl {
    fn from(control: &ServerControl) -> Self {
        RawControl {
            ctype: control.oid.clone(),
            crit: control.critical,
            val: control.value.clone(),
        }
    }
}

/// Raw LDAP entry as exchanged with the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Textual attributes.
    pub attributes: Vec<(String, Vec<String>)>,
    /// Binary attributes.
    pub binary_attributes: Vec<(String, Vec<Vec<u8>>)>,
}

impl LdapEntry {
    /// Returns the values of the attribute (case-insensitive) if present.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, values)| values.as_slice())
    }
}

/// Parameters of one search operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Search base.
    pub base_dn: String,
    /// Search scope.
    pub scope: SearchScope,
    /// LDAP filter.
    pub filter: String,
    /// Requested attributes; empty requests all user attributes.
    pub attributes: Vec<String>,
    /// Server-side time limit in seconds, 0 for none.
    pub time_limit: i32,
    /// Server-side size limit, 0 for none.
    pub size_limit: i32,
    /// Collect continuation references instead of dropping them.
    pub fetch_referrals: bool,
    /// Use the simple paged results control.
    pub paged: bool,
    /// Server controls to attach.
    pub controls: Vec<ServerControl>,
}

/// Result of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Returned entries.
    pub entries: Vec<LdapEntry>,
    /// Continuation references, when requested.
    pub referrals: Vec<String>,
    /// The server stopped early because a time, size or administrative limit was hit.
    pub truncated: bool,
}

/// LDAP modification request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryModification {
    /// Add attribute values.
    Add {
        /// Attribute to modify.
        attribute: String,
        /// Values to add.
        values: Vec<String>,
    },
    /// Delete attribute values.
    Delete {
        /// Attribute to modify.
        attribute: String,
        /// Values to delete (empty removes attribute).
        values: Vec<String>,
    },
    /// Replace attribute values.
    Replace {
        /// Attribute to modify.
        attribute: String,
        /// Replacement values (empty removes attribute).
        values: Vec<String>,
    },
}

/// How the transport must protect the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSecurity {
    /// Upgrade a cleartext connection with StartTLS before binding.
    pub starttls: bool,
    /// Minimum acceptable security strength factor.
    pub min_ssf: u32,
    /// Maximum security strength factor.
    pub max_ssf: u32,
}

/// One session with a directory server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LdapSession: Send {
    /// Simple bind; the empty DN binds anonymously.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;
    /// SASL EXTERNAL bind; the server maps the identity from the peer credentials.
    ///
    /// No authorization identity is sent on the wire, `authzid` only names the local
    /// account the bind is expected to map to.
    async fn sasl_external_bind(&mut self, authzid: &str) -> Result<()>;
    /// SASL GSSAPI bind using the credential cache `ccache_name`; empty uses the default cache.
    async fn sasl_gssapi_bind(&mut self, ccache_name: &str, server_fqdn: &str) -> Result<()>;
    /// Search.
    async fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome>;
    /// Add an entry.
    async fn add(&mut self, entry: &LdapEntry, controls: &[ServerControl]) -> Result<()>;
    /// Modify an entry.
    async fn modify(
        &mut self,
        dn: &str,
        modifications: &[DirectoryModification],
        controls: &[ServerControl],
    ) -> Result<()>;
    /// Delete an entry.
    async fn delete(&mut self, dn: &str, controls: &[ServerControl]) -> Result<()>;
    /// Password modify extended operation; an empty `old_password` is omitted.
    async fn password_modify(
        &mut self,
        dn: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()>;
    /// Unbind and close.
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens transport sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LdapConnector: Send + Sync {
    /// Opens a session protected according to `security`.
    async fn connect(&self, security: &TransportSecurity) -> Result<Box<dyn LdapSession>>;
}

/// Real LDAP connector backed by `ldap3`.
pub struct RealLdapConnector {
    config: Arc<DirectoryConfig>,
}

impl RealLdapConnector {
    /// Creates a new connector instance.
    #[must_use]
    pub fn new(config: Arc<DirectoryConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LdapConnector for RealLdapConnector {
    async fn connect(&self, security: &TransportSecurity) -> Result<Box<dyn LdapSession>> {
        let settings = build_ldap_settings(&self.config, security)?;
        debug!(
            uri = self.config.uri(),
            starttls = security.starttls,
            min_ssf = security.min_ssf,
            max_ssf = security.max_ssf,
            "connecting to directory"
        );
        let (conn, ldap) = LdapConnAsync::with_settings(settings, self.config.uri())
            .await
            .map_err(|err| Error::ConnectError(err.to_string()))?;
        ldap3::drive!(conn);
        Ok(Box::new(RealLdapSession {
            inner: ldap,
            operation_timeout: self.config.operation_timeout(),
        }))
    }
}

struct RealLdapSession {
    inner: ldap3::Ldap,
    operation_timeout: Duration,
}

impl RealLdapSession {
    async fn run_search(&mut self, request: &SearchRequest) -> Result<SearchOutcome> {
        let options = SearchOptions::new()
            .sizelimit(request.size_limit)
            .timelimit(request.time_limit);
        let controls: Vec<RawControl> = request.controls.iter().map(RawControl::from).collect();
        let mut outcome = SearchOutcome::default();

        let result = if request.paged {
            let adapter: PagedResults<String, Vec<String>> = PagedResults::new(PAGE_SIZE);
            let handle = self.inner.with_search_options(options);
            if !controls.is_empty() {
                handle.with_controls(controls);
            }
            let mut stream = handle
                .streaming_search_with(
                    adapter,
                    &request.base_dn,
                    request.scope.into(),
                    &request.filter,
                    request.attributes.clone(),
                )
                .await
                .map_err(map_ldap_error)?;
            while let Some(entry) = stream.next().await.map_err(map_ldap_error)? {
                collect_entry(entry, request.fetch_referrals, &mut outcome);
            }
            stream.finish().await
        } else {
            let handle = self.inner.with_search_options(options);
            if !controls.is_empty() {
                handle.with_controls(controls);
            }
            let ldap3::SearchResult(entries, result) = handle
                .search(
                    &request.base_dn,
                    request.scope.into(),
                    &request.filter,
                    request.attributes.clone(),
                )
                .await
                .map_err(map_ldap_error)?;
            for entry in entries {
                collect_entry(entry, request.fetch_referrals, &mut outcome);
            }
            result
        };

        outcome.truncated = search_status(result.rc, &result.text)?;
        if request.fetch_referrals {
            outcome.referrals.extend(result.refs);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl LdapSession for RealLdapSession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let result = timeout(self.operation_timeout, self.inner.simple_bind(dn, password))
            .await
            .map_err(|_| Error::Timeout("bind timed out".to_string()))?
            .map_err(map_bind_error)?;
        ensure_success(result.rc, result.text)
    }

    async fn sasl_external_bind(&mut self, authzid: &str) -> Result<()> {
        debug!(authzid, "SASL EXTERNAL bind");
        let result = timeout(self.operation_timeout, self.inner.sasl_external_bind())
            .await
            .map_err(|_| Error::Timeout("bind timed out".to_string()))?
            .map_err(map_bind_error)?;
        ensure_success(result.rc, result.text)
    }

    #[cfg(feature = "gssapi")]
    async fn sasl_gssapi_bind(&mut self, ccache_name: &str, server_fqdn: &str) -> Result<()> {
        // The GSSAPI library picks the cache up from the environment.
        if !ccache_name.is_empty() {
            std::env::set_var("KRB5CCNAME", ccache_name);
        }
        let result = timeout(
            self.operation_timeout,
            self.inner.sasl_gssapi_bind(server_fqdn),
        )
        .await
        .map_err(|_| Error::Timeout("bind timed out".to_string()))?
        .map_err(map_bind_error)?;
        ensure_success(result.rc, result.text)
    }

    #[cfg(not(feature = "gssapi"))]
    async fn sasl_gssapi_bind(&mut self, ccache_name: &str, _server_fqdn: &str) -> Result<()> {
        Err(Error::BindError(format!(
            "cannot use credential cache {ccache_name}: built without GSSAPI support"
        )))
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome> {
        match search_deadline(request.time_limit, self.operation_timeout) {
            Some(deadline) => timeout(deadline, self.run_search(request))
                .await
                .map_err(|_| Error::Timeout("search timed out".to_string()))?,
            None => self.run_search(request).await,
        }
    }

    async fn add(&mut self, entry: &LdapEntry, controls: &[ServerControl]) -> Result<()> {
        let mut attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = entry
            .attributes
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(name, values)| {
                (
                    name.as_bytes().to_vec(),
                    values.iter().map(|v| v.as_bytes().to_vec()).collect(),
                )
            })
            .collect();
        attrs.extend(
            entry
                .binary_attributes
                .iter()
                .filter(|(_, values)| !values.is_empty())
                .map(|(name, values)| {
                    (name.as_bytes().to_vec(), values.iter().cloned().collect())
                }),
        );

        let handle = &mut self.inner;
        if !controls.is_empty() {
            handle.with_controls(controls.iter().map(RawControl::from).collect::<Vec<_>>());
        }
        let result = timeout(self.operation_timeout, handle.add(&entry.dn, attrs))
            .await
            .map_err(|_| Error::Timeout("add timed out".to_string()))?
            .map_err(map_ldap_error)?;
        ensure_success(result.rc, result.text)
    }

    async fn modify(
        &mut self,
        dn: &str,
        modifications: &[DirectoryModification],
        controls: &[ServerControl],
    ) -> Result<()> {
        let mods = modifications
            .iter()
            .map(|m| match m {
                DirectoryModification::Add { attribute, values } => Mod::Add(
                    attribute.clone(),
                    values.iter().cloned().collect::<HashSet<_>>(),
                ),
                DirectoryModification::Delete { attribute, values } => Mod::Delete(
                    attribute.clone(),
                    values.iter().cloned().collect::<HashSet<_>>(),
                ),
                DirectoryModification::Replace { attribute, values } => Mod::Replace(
                    attribute.clone(),
                    values.iter().cloned().collect::<HashSet<_>>(),
                ),
            })
            .collect::<Vec<_>>();

        let handle = &mut self.inner;
        if !controls.is_empty() {
            handle.with_controls(controls.iter().map(RawControl::from).collect::<Vec<_>>());
        }
        let result = timeout(self.operation_timeout, handle.modify(dn, mods))
            .await
            .map_err(|_| Error::Timeout("modify timed out".to_string()))?
            .map_err(map_ldap_error)?;
        ensure_success(result.rc, result.text)
    }

    async fn delete(&mut self, dn: &str, controls: &[ServerControl]) -> Result<()> {
        let handle = &mut self.inner;
        if !controls.is_empty() {
            handle.with_controls(controls.iter().map(RawControl::from).collect::<Vec<_>>());
        }
        let result = timeout(self.operation_timeout, handle.delete(dn))
            .await
            .map_err(|_| Error::Timeout("delete timed out".to_string()))?
            .map_err(map_ldap_error)?;
        ensure_success(result.rc, result.text)
    }

    async fn password_modify(
        &mut self,
        dn: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let exop = PasswordModify {
            user_id: Some(dn),
            old_pass: (!old_password.is_empty()).then_some(old_password),
            new_pass: Some(new_password),
        };
        let result = timeout(self.operation_timeout, self.inner.extended(exop))
            .await
            .map_err(|_| Error::Timeout("password change timed out".to_string()))?
            .map_err(map_ldap_error)?;
        exop_status(result)
    }

    async fn unbind(&mut self) -> Result<()> {
        timeout(self.operation_timeout, self.inner.unbind())
            .await
            .map_err(|_| Error::Timeout("unbind timed out".to_string()))?
            .map_err(map_ldap_error)
    }
}

fn build_ldap_settings(
    config: &DirectoryConfig,
    security: &TransportSecurity,
) -> Result<LdapConnSettings> {
    let mut settings = LdapConnSettings::new()
        .set_conn_timeout(config.connection_timeout())
        .set_starttls(security.starttls);

    if !config.tls_verify() {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to construct TLS connector: {err}"))
            })?;
        settings = settings.set_connector(connector).set_no_tls_verify(true);
    } else if let Some(cert_path) = config.tls_ca_cert() {
        let pem = fs::read(cert_path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read CA certificate {}: {err}",
                cert_path.display()
            ))
        })?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|err| Error::ConfigError(format!("invalid CA certificate: {err}")))?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| Error::ConfigError(format!("failed to load CA certificate: {err}")))?;
        settings = settings.set_connector(connector);
    }

    Ok(settings)
}

fn collect_entry(entry: ldap3::ResultEntry, fetch_referrals: bool, outcome: &mut SearchOutcome) {
    if entry.is_ref() {
        if fetch_referrals {
            outcome.referrals.extend(ldap3::parse_refs(entry.0));
        }
        return;
    }
    if entry.is_intermediate() {
        return;
    }
    let entry = SearchEntry::construct(entry);
    outcome.entries.push(LdapEntry {
        dn: entry.dn,
        attributes: sorted(entry.attrs),
        binary_attributes: sorted(entry.bin_attrs),
    });
}

fn sorted<V>(map: HashMap<String, V>) -> Vec<(String, V)> {
    let mut pairs: Vec<(String, V)> = map.into_iter().collect();
    pairs.sort_by(|a, b| a.0.to_ascii_lowercase().cmp(&b.0.to_ascii_lowercase()));
    pairs
}

/// Client-side deadline for a search with the server time limit `time_limit`.
///
/// The server enforces the limit and reports a hit as truncation, so the client only waits
/// `operation_timeout` past it. An unlimited search has no client deadline.
pub(crate) fn search_deadline(time_limit: i32, operation_timeout: Duration) -> Option<Duration> {
    let seconds = u64::try_from(time_limit).ok().filter(|seconds| *seconds > 0)?;
    Some(Duration::from_secs(seconds) + operation_timeout)
}

/// Interprets the final result code of a search: `Ok(true)` for a truncated result.
pub(crate) fn search_status(rc: u32, text: &str) -> Result<bool> {
    match rc {
        result_code::SUCCESS => Ok(false),
        rc if result_code::is_limit_exceeded(rc) => Ok(true),
        // Referral: the entries returned so far are complete for this server.
        10 => Ok(false),
        rc => Err(Error::from_result_code(rc, text)),
    }
}

fn exop_status(result: ldap3::result::ExopResult) -> Result<()> {
    let ldap3::result::ExopResult(_, result) = result;
    ensure_success(result.rc, result.text)
}

fn ensure_success(rc: u32, text: String) -> Result<()> {
    if rc == result_code::SUCCESS {
        Ok(())
    } else {
        Err(Error::from_result_code(rc, text))
    }
}

fn map_ldap_error(err: LdapError) -> Error {
    match err {
        LdapError::LdapResult { result } => Error::from_result_code(result.rc, result.text),
        other => Error::ConnectError(other.to_string()),
    }
}

fn map_bind_error(err: LdapError) -> Error {
    match err {
        LdapError::LdapResult { result } => Error::from_result_code(result.rc, result.text),
        LdapError::Io { .. } => Error::ConnectError(err.to_string()),
        other => Error::BindError(other.to_string()),
    }
}
