//! Directory backend: searches, entry reads and writes, and the helpers built on them.

use crate::{
    config::DirectoryConfig,
    context::RequestContext,
    dn::DistinguishedName,
    entry::{AttributeMap, Entry},
    filter::{combine_filters, make_filter_from_attr, MatchRule, MATCH_EVERYTHING},
    session::{
        DirectoryModification, LdapConnector, LdapEntry, RealLdapConnector, SearchRequest,
        SearchScope, NO_ATTRIBUTES,
    },
    Result,
};
use realm_core::Error;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use tracing::{debug, warn};

/// Server-wide search time limit attribute of the configuration entry.
pub const CONFIG_TIME_LIMIT: &str = "ipasearchtimelimit";
/// Server-wide search size limit attribute of the configuration entry.
pub const CONFIG_SIZE_LIMIT: &str = "ipasearchrecordslimit";
/// Time limit used when the configuration does not provide one (seconds).
pub const DEFAULT_TIME_LIMIT: i32 = 2;
/// Size limit used when the configuration does not provide one (unlimited).
pub const DEFAULT_SIZE_LIMIT: i32 = 0;

/// Virtual attribute listing members reachable through nested groups.
pub const MEMBER_INDIRECT: &str = "memberindirect";
/// Virtual attribute listing groups an entry belongs to only through nesting.
pub const MEMBEROF_INDIRECT: &str = "memberofindirect";

const ACCOUNT_LOCK: &str = "nsaccountlock";

/// Parameters of [`DirectoryBackend::find_entries`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FindOptions {
    filter: Option<String>,
    attributes: Vec<String>,
    base_dn: Option<DistinguishedName>,
    scope: SearchScope,
    time_limit: Option<i32>,
    size_limit: Option<i32>,
    fetch_referrals: bool,
    paged: bool,
}

impl FindOptions {
    /// Subtree search below the realm base DN returning all user attributes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the search filter.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Sets the attributes to return; `memberindirect` and `memberofindirect` are computed.
    #[must_use]
    pub fn with_attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = attributes.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the search base.
    #[must_use]
    pub fn with_base_dn(mut self, base_dn: DistinguishedName) -> Self {
        self.base_dn = Some(base_dn);
        self
    }

    /// Sets the search scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the time limit in seconds instead of the configured one.
    #[must_use]
    pub const fn with_time_limit(mut self, seconds: i32) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    /// Sets the size limit instead of the configured one.
    #[must_use]
    pub const fn with_size_limit(mut self, entries: i32) -> Self {
        self.size_limit = Some(entries);
        self
    }

    /// Collects continuation references.
    #[must_use]
    pub const fn with_referrals(mut self, fetch: bool) -> Self {
        self.fetch_referrals = fetch;
        self
    }

    /// Uses the simple paged results control.
    #[must_use]
    pub const fn with_paging(mut self, paged: bool) -> Self {
        self.paged = paged;
        self
    }
}

/// Entries returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    /// Matching entries, possibly incomplete.
    pub entries: Vec<Entry>,
    /// The server stopped early on a time, size or administrative limit.
    pub truncated: bool,
    /// Continuation references, when requested.
    pub referrals: Vec<String>,
}

/// Access to the realm directory.
///
/// The backend itself is stateless apart from its configuration; every operation runs on the
/// connection held by the [`RequestContext`] it is given.
pub struct DirectoryBackend {
    config: Arc<DirectoryConfig>,
    connector: Box<dyn LdapConnector>,
}

impl DirectoryBackend {
    /// Creates a backend talking to the configured directory server.
    #[must_use]
    pub fn new(config: DirectoryConfig) -> Self {
        let config = Arc::new(config);
        let connector = Box::new(RealLdapConnector::new(config.clone()));
        Self { config, connector }
    }

    /// Creates a backend with a custom transport.
    #[must_use]
    pub fn with_connector(config: DirectoryConfig, connector: Box<dyn LdapConnector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
        }
    }

    /// Backend configuration.
    #[must_use]
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Realm base DN.
    #[must_use]
    pub fn base_dn(&self) -> &DistinguishedName {
        self.config.base_dn()
    }

    pub(crate) fn connector(&self) -> &dyn LdapConnector {
        self.connector.as_ref()
    }

    /// DN of the realm configuration entry.
    #[must_use]
    pub fn config_dn(&self) -> DistinguishedName {
        DistinguishedName::from_rdns([("cn", "ipaconfig"), ("cn", "etc")]).join(self.base_dn())
    }

    /// DN of the user private group definition.
    #[must_use]
    pub fn upg_definition_dn(&self) -> DistinguishedName {
        DistinguishedName::from_rdns([
            ("cn", "UPG Definition"),
            ("cn", "Definitions"),
            ("cn", "Managed Entries"),
            ("cn", "etc"),
        ])
        .join(self.base_dn())
    }

    /// Runs one search on the context's connection without any post-processing.
    ///
    /// An empty, complete result is [`Error::NotFound`].
    pub(crate) async fn search_once(
        &self,
        ctx: &mut RequestContext,
        request: SearchRequest,
    ) -> Result<SearchResult> {
        let outcome = ctx.connection_mut().search(request).await?;
        if outcome.entries.is_empty() && !outcome.truncated {
            return Err(Error::NotFound("no such entry".to_string()));
        }
        let entries = outcome
            .entries
            .into_iter()
            .map(entry_from_ldap)
            .collect::<Result<Vec<_>>>()?;
        Ok(SearchResult {
            entries,
            truncated: outcome.truncated,
            referrals: outcome.referrals,
        })
    }

    /// Searches the directory.
    ///
    /// Missing limits are taken from the configuration entry. `memberindirect` and
    /// `memberofindirect` are never sent to the server; when requested they are computed
    /// for every returned entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing matched and the search was complete, and
    /// [`Error::LimitsExceeded`] if a membership search was truncated.
    ///
    /// # Panics
    ///
    /// Panics if the context is unbound.
    pub async fn find_entries(
        &self,
        ctx: &mut RequestContext,
        options: FindOptions,
    ) -> Result<SearchResult> {
        let (time_limit, size_limit) = self.search_limits(ctx, &options).await?;

        let mut attributes = options.attributes;
        let want_indirect = take_attribute(&mut attributes, MEMBER_INDIRECT);
        let want_indirect_of = take_attribute(&mut attributes, MEMBEROF_INDIRECT);
        // The resolvers work from the direct relations, fetch them when not requested.
        let mut fetched_only = Vec::new();
        if want_indirect && !requests_attribute(&attributes, "member") {
            attributes.push("member".to_string());
            fetched_only.push("member");
        }
        if want_indirect_of && !requests_attribute(&attributes, "memberof") {
            attributes.push("memberof".to_string());
            fetched_only.push("memberof");
        }

        let request = SearchRequest {
            base_dn: options
                .base_dn
                .as_ref()
                .unwrap_or_else(|| self.base_dn())
                .to_string(),
            scope: options.scope,
            filter: options
                .filter
                .filter(|f| !f.is_empty())
                .unwrap_or_else(|| MATCH_EVERYTHING.to_string()),
            attributes,
            time_limit,
            size_limit,
            fetch_referrals: options.fetch_referrals,
            paged: options.paged,
            controls: Vec::new(),
        };
        let mut result = self.search_once(ctx, request).await?;

        if want_indirect || want_indirect_of {
            for entry in &mut result.entries {
                if want_indirect {
                    self.process_memberindirect(ctx, entry, time_limit, size_limit)
                        .await?;
                }
                if want_indirect_of {
                    self.process_memberofindirect(ctx, entry, time_limit, size_limit)
                        .await?;
                }
                for name in &fetched_only {
                    entry.remove(name);
                }
                // Computed values are part of what was read, not pending changes.
                entry.mark_persisted();
            }
        }

        Ok(result)
    }

    pub(crate) async fn search_limits(
        &self,
        ctx: &mut RequestContext,
        options: &FindOptions,
    ) -> Result<(i32, i32)> {
        if let (Some(time), Some(size)) = (options.time_limit, options.size_limit) {
            return Ok((time, size));
        }
        let (config_time, config_size) = match self.get_config_entry(ctx, &[]).await {
            Ok(config) => (
                limit_value(&config, CONFIG_TIME_LIMIT).unwrap_or(DEFAULT_TIME_LIMIT),
                limit_value(&config, CONFIG_SIZE_LIMIT).unwrap_or(DEFAULT_SIZE_LIMIT),
            ),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                warn!(error = %err, "cannot read configuration entry, using default limits");
                (DEFAULT_TIME_LIMIT, DEFAULT_SIZE_LIMIT)
            }
        };
        Ok((
            options.time_limit.unwrap_or(config_time),
            options.size_limit.unwrap_or(config_size),
        ))
    }

    /// Reads one entry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry does not exist.
    pub async fn get_entry(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        attributes: &[&str],
    ) -> Result<Entry> {
        let result = self
            .find_entries(
                ctx,
                FindOptions::new()
                    .with_base_dn(dn.clone())
                    .with_scope(SearchScope::Base)
                    .with_attributes(attributes),
            )
            .await?;
        single_entry(result)
    }

    /// Finds the single entry of `object_class` whose `attribute` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`], [`Error::SingleMatchExpected`] when several entries
    /// match, or [`Error::LimitsExceeded`] when the search was truncated.
    pub async fn find_entry_by_attr(
        &self,
        ctx: &mut RequestContext,
        attribute: &str,
        value: &str,
        object_class: &str,
        attributes: &[&str],
        base_dn: Option<&DistinguishedName>,
    ) -> Result<Entry> {
        let filter = combine_filters(
            &[
                make_filter_from_attr(attribute, &[value], MatchRule::All, true),
                make_filter_from_attr("objectclass", &[object_class], MatchRule::All, true),
            ],
            MatchRule::All,
        );
        let mut options = FindOptions::new()
            .with_filter(filter)
            .with_attributes(attributes);
        if let Some(base_dn) = base_dn {
            options = options.with_base_dn(base_dn.clone());
        }
        single_entry(self.find_entries(ctx, options).await?)
    }

    /// Returns the realm configuration entry.
    ///
    /// The entry is cached in the context for the current connection. A missing entry is
    /// replaced by an in-memory one; missing search limits are filled with their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LimitsExceeded`] if the read was truncated.
    pub async fn get_config_entry(
        &self,
        ctx: &mut RequestContext,
        attributes: &[&str],
    ) -> Result<Entry> {
        if let Some(entry) = ctx.cached_config() {
            return Ok(entry.clone());
        }

        let dn = self.config_dn();
        let request = SearchRequest {
            base_dn: dn.to_string(),
            scope: SearchScope::Base,
            filter: MATCH_EVERYTHING.to_string(),
            attributes: attributes.iter().map(ToString::to_string).collect(),
            time_limit: 2,
            size_limit: 10,
            fetch_referrals: false,
            paged: false,
            controls: Vec::new(),
        };
        let mut entry = match self.search_once(ctx, request).await {
            Ok(result) if result.truncated => return Err(Error::LimitsExceeded),
            Ok(result) => result
                .entries
                .into_iter()
                .next()
                .unwrap_or_else(|| Entry::new(dn.clone())),
            Err(Error::NotFound(_)) => {
                warn!(dn = %dn, "configuration entry not found, using defaults");
                Entry::new(dn)
            }
            Err(err) => return Err(err),
        };

        if !entry.contains(CONFIG_TIME_LIMIT) {
            entry.set(CONFIG_TIME_LIMIT, DEFAULT_TIME_LIMIT.to_string());
        }
        if !entry.contains(CONFIG_SIZE_LIMIT) {
            entry.set(CONFIG_SIZE_LIMIT, DEFAULT_SIZE_LIMIT.to_string());
        }
        ctx.cache_config(entry.clone());
        Ok(entry)
    }

    /// Returns true if user private groups are enabled.
    ///
    /// # Errors
    ///
    /// Only transport-level failures are reported; a missing definition is `false`.
    pub async fn has_upg(&self, ctx: &mut RequestContext) -> Result<bool> {
        let dn = self.upg_definition_dn();
        let entry = match self.get_entry(ctx, &dn, &["*"]).await {
            Ok(entry) => entry,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(entry
            .first("originfilter")
            .is_some_and(|filter| !filter.to_ascii_lowercase().contains("objectclass=disable")))
    }

    /// Creates `entry` in the directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEntry`] if the entry already exists.
    pub async fn add_entry(&self, ctx: &mut RequestContext, entry: &mut Entry) -> Result<()> {
        let ldap_entry = LdapEntry {
            dn: entry.dn().to_string(),
            attributes: entry
                .attributes()
                .iter()
                .map(|(name, values)| (name.to_string(), values.to_vec()))
                .collect(),
            binary_attributes: entry
                .binary_attributes()
                .iter()
                .map(|(name, values)| (name.to_string(), values.to_vec()))
                .collect(),
        };
        ctx.connection_mut().add(&ldap_entry).await?;
        entry.mark_persisted();
        Ok(())
    }

    /// Writes the changes made to `entry` since it was read. Nothing is sent if nothing changed.
    ///
    /// # Errors
    ///
    /// Returns the translated server error.
    pub async fn update_entry(&self, ctx: &mut RequestContext, entry: &mut Entry) -> Result<()> {
        let modifications = entry.modifications();
        if modifications.is_empty() {
            debug!(dn = %entry.dn(), "no changes to write");
            return Ok(());
        }
        ctx.connection_mut()
            .modify(entry.dn(), &modifications)
            .await?;
        entry.mark_persisted();
        Ok(())
    }

    /// Deletes the entry at `dn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::NotAllowedOnNonLeaf`] as reported by the server.
    pub async fn delete_entry(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
    ) -> Result<()> {
        ctx.connection_mut().delete(dn).await
    }

    /// Sets the password of `dn`.
    ///
    /// A non-empty `old_password` is verified with a separate simple bind first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AclError`] if the old password is wrong.
    pub async fn modify_password(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        new_password: &SecretString,
        old_password: Option<&SecretString>,
    ) -> Result<()> {
        let old_password = old_password.map_or("", |p| p.expose_secret());
        if !old_password.is_empty() {
            let security = self.config.transport_security(false);
            let mut session = self.connector.connect(&security).await?;
            let verified = session.simple_bind(dn.as_str(), old_password).await;
            if let Err(err) = session.unbind().await {
                debug!(error = %err, "unbind after password check");
            }
            verified.map_err(|err| match err {
                Error::BindError(message) => Error::AclError(message),
                other => other,
            })?;
        }

        ctx.connection_mut()
            .password_modify(dn, old_password, new_password.expose_secret())
            .await
    }

    /// Adds `dn` to the `member_attr` attribute of `group_dn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `dn` does not exist, [`Error::SameGroupError`] when
    /// adding a group to itself without `allow_same`, and [`Error::AlreadyGroupMember`].
    pub async fn add_entry_to_group(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        group_dn: &DistinguishedName,
        member_attr: &str,
        allow_same: bool,
    ) -> Result<()> {
        debug!(dn = %dn, group_dn = %group_dn, member_attr, "add_entry_to_group");

        let entry = self.get_entry(ctx, dn, &[NO_ATTRIBUTES]).await?;
        let dn = entry.dn();
        if dn == group_dn && !allow_same {
            return Err(Error::SameGroupError);
        }

        let modification = DirectoryModification::Add {
            attribute: member_attr.to_string(),
            values: vec![dn.to_string()],
        };
        match ctx.connection_mut().modify(group_dn, &[modification]).await {
            Err(Error::DuplicateEntry(_) | Error::DatabaseError { .. }) => {
                Err(Error::AlreadyGroupMember)
            }
            other => other,
        }
    }

    /// Removes `dn` from the `member_attr` attribute of `group_dn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotGroupMember`] if `dn` is not a member.
    pub async fn remove_entry_from_group(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        group_dn: &DistinguishedName,
        member_attr: &str,
    ) -> Result<()> {
        debug!(dn = %dn, group_dn = %group_dn, member_attr, "remove_entry_from_group");

        let modification = DirectoryModification::Delete {
            attribute: member_attr.to_string(),
            values: vec![dn.to_string()],
        };
        match ctx.connection_mut().modify(group_dn, &[modification]).await {
            Err(Error::MidairCollision(_)) => Err(Error::NotGroupMember),
            other => other,
        }
    }

    /// Locks or unlocks the account at `dn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyActive`] or [`Error::AlreadyInactive`] without writing anything
    /// when the entry is already in the requested state.
    pub async fn set_entry_active(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        active: bool,
    ) -> Result<()> {
        let mut entry = self.get_entry(ctx, dn, &[ACCOUNT_LOCK]).await?;
        let locked = entry
            .first(ACCOUNT_LOCK)
            .unwrap_or("false")
            .to_ascii_lowercase();
        if active && locked == "false" {
            return Err(Error::AlreadyActive);
        }
        if !active && locked == "true" {
            return Err(Error::AlreadyInactive);
        }

        entry.set(ACCOUNT_LOCK, if active { "FALSE" } else { "TRUE" });
        self.update_entry(ctx, &mut entry).await
    }

    /// Unlocks the account at `dn`.
    ///
    /// # Errors
    ///
    /// See [`DirectoryBackend::set_entry_active`].
    pub async fn activate_entry(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
    ) -> Result<()> {
        self.set_entry_active(ctx, dn, true).await
    }

    /// Locks the account at `dn`.
    ///
    /// # Errors
    ///
    /// See [`DirectoryBackend::set_entry_active`].
    pub async fn deactivate_entry(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
    ) -> Result<()> {
        self.set_entry_active(ctx, dn, false).await
    }

    /// Removes the Kerberos keys of `dn` without reading them.
    ///
    /// # Errors
    ///
    /// Returns the translated server error.
    pub async fn remove_principal_key(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
    ) -> Result<()> {
        let modifications = [
            DirectoryModification::Replace {
                attribute: "krbprincipalkey".to_string(),
                values: Vec::new(),
            },
            DirectoryModification::Replace {
                attribute: "krblastpwdchange".to_string(),
                values: Vec::new(),
            },
        ];
        ctx.connection_mut().modify(dn, &modifications).await
    }
}

fn entry_from_ldap(entry: LdapEntry) -> Result<Entry> {
    let dn = if entry.dn.is_empty() {
        DistinguishedName::default()
    } else {
        DistinguishedName::parse(&entry.dn)?
    };
    let mut attrs = AttributeMap::new();
    for (name, values) in entry.attributes {
        attrs.insert(&name, values);
    }
    let mut bin_attrs = AttributeMap::new();
    for (name, values) in entry.binary_attributes {
        bin_attrs.insert(&name, values);
    }
    Ok(Entry::from_search(dn, attrs, bin_attrs))
}

pub(crate) fn single_entry(result: SearchResult) -> Result<Entry> {
    if result.entries.len() > 1 {
        return Err(Error::SingleMatchExpected {
            found: result.entries.len(),
        });
    }
    if result.truncated {
        return Err(Error::LimitsExceeded);
    }
    result
        .entries
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound("no such entry".to_string()))
}

fn take_attribute(attributes: &mut Vec<String>, name: &str) -> bool {
    let before = attributes.len();
    attributes.retain(|attribute| !attribute.eq_ignore_ascii_case(name));
    attributes.len() != before
}

fn requests_attribute(attributes: &[String], name: &str) -> bool {
    attributes.is_empty()
        || attributes
            .iter()
            .any(|attribute| attribute == "*" || attribute.eq_ignore_ascii_case(name))
}

fn limit_value(config: &Entry, attribute: &str) -> Option<i32> {
    config
        .first(attribute)
        .and_then(|value| value.trim().parse::<i32>().ok())
        .map(|value| value.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockLdapConnector, MockLdapSession, SearchOutcome};
    use crate::test_support::{
        backend, bound_context, directory_config, dn, is_config_search, ldap_entry,
    };

    fn user_dn() -> DistinguishedName {
        dn("uid=tuser,cn=users,cn=accounts,dc=example,dc=com")
    }

    fn group_dn() -> DistinguishedName {
        dn("cn=admins,cn=groups,cn=accounts,dc=example,dc=com")
    }

    #[tokio::test]
    async fn find_entries_uses_configured_limits_once() {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(is_config_search)
            .times(1)
            .returning(|_| {
                Ok(SearchOutcome {
                    entries: vec![ldap_entry(
                        "cn=ipaconfig,cn=etc,dc=example,dc=com",
                        &[(CONFIG_TIME_LIMIT, &["5"]), (CONFIG_SIZE_LIMIT, &["100"])],
                    )],
                    ..SearchOutcome::default()
                })
            });
        session
            .expect_search()
            .withf(|request: &SearchRequest| {
                !is_config_search(request)
                    && request.time_limit == 5
                    && request.size_limit == 100
                    && request.base_dn == "dc=example,dc=com"
                    && request.filter == "(uid=tuser)"
            })
            .times(2)
            .returning(|_| {
                Ok(SearchOutcome {
                    entries: vec![ldap_entry(
                        "uid=tuser,cn=users,cn=accounts,dc=example,dc=com",
                        &[("uid", &["tuser"])],
                    )],
                    ..SearchOutcome::default()
                })
            });

        let backend = backend();
        let mut ctx = bound_context(session);
        for _ in 0..2 {
            let result = backend
                .find_entries(&mut ctx, FindOptions::new().with_filter("(uid=tuser)"))
                .await
                .unwrap();
            assert_eq!(result.entries.len(), 1);
            assert!(!result.truncated);
        }
    }

    #[tokio::test]
    async fn missing_config_entry_gives_defaults() {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(is_config_search)
            .times(1)
            .returning(|_| Err(Error::NotFound("no such entry".to_string())));

        let backend = backend();
        let mut ctx = bound_context(session);
        let config = backend.get_config_entry(&mut ctx, &[]).await.unwrap();
        assert_eq!(config.dn(), &backend.config_dn());
        assert_eq!(config.values(CONFIG_TIME_LIMIT), ["2"]);
        assert_eq!(config.values(CONFIG_SIZE_LIMIT), ["0"]);

        // Served from the context cache.
        let again = backend.get_config_entry(&mut ctx, &[]).await.unwrap();
        assert_eq!(again, config);
    }

    #[tokio::test]
    async fn unreadable_config_falls_back_to_hard_defaults() {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(is_config_search)
            .returning(|_| Err(Error::AclError("anonymous access denied".to_string())));
        session
            .expect_search()
            .withf(|request: &SearchRequest| {
                !is_config_search(request) && request.time_limit == 2 && request.size_limit == 0
            })
            .returning(|_| {
                Ok(SearchOutcome {
                    entries: vec![ldap_entry("cn=x,dc=example,dc=com", &[])],
                    ..SearchOutcome::default()
                })
            });

        let backend = backend();
        let mut ctx = bound_context(session);
        backend
            .find_entries(&mut ctx, FindOptions::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn truncated_search_returns_partial_entries() {
        let mut session = MockLdapSession::new();
        session.expect_search().returning(|_| {
            Ok(SearchOutcome {
                entries: vec![ldap_entry("uid=a,dc=example,dc=com", &[])],
                truncated: true,
                ..SearchOutcome::default()
            })
        });

        let backend = backend();
        let mut ctx = bound_context(session);
        let result = backend
            .find_entries(
                &mut ctx,
                FindOptions::new().with_time_limit(1).with_size_limit(1),
            )
            .await
            .unwrap();
        assert!(result.truncated);
        assert_eq!(result.entries.len(), 1);
    }

    #[tokio::test]
    async fn empty_complete_search_is_not_found() {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(|request: &SearchRequest| request.filter == "(objectClass=*)")
            .returning(|_| Ok(SearchOutcome::default()));

        let backend = backend();
        let mut ctx = bound_context(session);
        let result = backend
            .find_entries(
                &mut ctx,
                FindOptions::new().with_time_limit(2).with_size_limit(0),
            )
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn virtual_attributes_never_reach_the_wire() {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(|request: &SearchRequest| request.scope == SearchScope::Base)
            .returning(|request| {
                assert_eq!(request.attributes, vec!["cn", "member"]);
                Ok(SearchOutcome {
                    entries: vec![ldap_entry(
                        "cn=admins,cn=groups,cn=accounts,dc=example,dc=com",
                        &[("cn", &["admins"])],
                    )],
                    ..SearchOutcome::default()
                })
            });
        session
            .expect_search()
            .withf(|request: &SearchRequest| request.scope == SearchScope::Subtree)
            .returning(|_| Err(Error::NotFound("no such entry".to_string())));

        let backend = backend();
        let mut ctx = bound_context(session);
        let entry = backend
            .find_entries(
                &mut ctx,
                FindOptions::new()
                    .with_base_dn(group_dn())
                    .with_scope(SearchScope::Base)
                    .with_attributes(&["cn", "memberindirect"])
                    .with_time_limit(2)
                    .with_size_limit(0),
            )
            .await
            .unwrap()
            .entries
            .remove(0);
        assert_eq!(entry.values("cn"), ["admins"]);
        assert!(!entry.contains("member"));
        assert!(!entry.contains(MEMBER_INDIRECT));
    }

    #[tokio::test]
    async fn find_entry_by_attr_requires_single_match() {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(|request: &SearchRequest| {
                request.filter
                    == "(&(krbprincipalname=admin@EXAMPLE.COM)(objectclass=krbPrincipalAux))"
            })
            .returning(|_| {
                Ok(SearchOutcome {
                    entries: vec![
                        ldap_entry("uid=a,dc=example,dc=com", &[]),
                        ldap_entry("uid=b,dc=example,dc=com", &[]),
                    ],
                    ..SearchOutcome::default()
                })
            });
        session
            .expect_search()
            .withf(is_config_search)
            .returning(|_| Err(Error::NotFound(String::new())));

        let backend = backend();
        let mut ctx = bound_context(session);
        let result = backend
            .find_entry_by_attr(
                &mut ctx,
                "krbprincipalname",
                "admin@EXAMPLE.COM",
                "krbPrincipalAux",
                &[],
                None,
            )
            .await;
        assert_eq!(result, Err(Error::SingleMatchExpected { found: 2 }));
    }

    fn upg_session(origin_filter: Option<&'static str>) -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(is_config_search)
            .returning(|_| Err(Error::NotFound(String::new())));
        session
            .expect_search()
            .withf(|request: &SearchRequest| request.base_dn.starts_with("cn=UPG Definition"))
            .returning(move |_| match origin_filter {
                None => Err(Error::NotFound(String::new())),
                Some("") => Ok(SearchOutcome {
                    entries: vec![ldap_entry(
                        "cn=UPG Definition,cn=Definitions,cn=Managed Entries,cn=etc,dc=example,dc=com",
                        &[("cn", &["UPG Definition"])],
                    )],
                    ..SearchOutcome::default()
                }),
                Some(filter) => Ok(SearchOutcome {
                    entries: vec![ldap_entry(
                        "cn=UPG Definition,cn=Definitions,cn=Managed Entries,cn=etc,dc=example,dc=com",
                        &[("originFilter", &[filter])],
                    )],
                    ..SearchOutcome::default()
                }),
            });
        session
    }

    #[tokio::test]
    async fn has_upg_predicate() {
        let backend = backend();

        let mut ctx = bound_context(upg_session(Some(
            "(&(objectclass=posixAccount)(!(description=__no_upg__)))",
        )));
        assert!(backend.has_upg(&mut ctx).await.unwrap());

        let mut ctx = bound_context(upg_session(Some(
            "(&(objectclass=disable)(objectclass=posixAccount))",
        )));
        assert!(!backend.has_upg(&mut ctx).await.unwrap());

        let mut ctx = bound_context(upg_session(Some("")));
        assert!(!backend.has_upg(&mut ctx).await.unwrap());

        let mut ctx = bound_context(upg_session(None));
        assert!(!backend.has_upg(&mut ctx).await.unwrap());
    }

    fn lock_state_session(lock: Option<&'static str>) -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(is_config_search)
            .returning(|_| Err(Error::NotFound(String::new())));
        session
            .expect_search()
            .withf(|request: &SearchRequest| request.attributes == vec![ACCOUNT_LOCK])
            .returning(move |_| {
                let mut entry =
                    ldap_entry("uid=tuser,cn=users,cn=accounts,dc=example,dc=com", &[]);
                if let Some(value) = lock {
                    entry
                        .attributes
                        .push((ACCOUNT_LOCK.to_string(), vec![value.to_string()]));
                }
                Ok(SearchOutcome {
                    entries: vec![entry],
                    ..SearchOutcome::default()
                })
            });
        session
    }

    #[tokio::test]
    async fn activating_active_entry_writes_nothing() {
        let mut session = lock_state_session(None);
        session.expect_modify().never();

        let backend = backend();
        let mut ctx = bound_context(session);
        let result = backend.set_entry_active(&mut ctx, &user_dn(), true).await;
        assert_eq!(result, Err(Error::AlreadyActive));
    }

    #[tokio::test]
    async fn deactivating_locked_entry_writes_nothing() {
        let mut session = lock_state_session(Some("TRUE"));
        session.expect_modify().never();

        let backend = backend();
        let mut ctx = bound_context(session);
        let result = backend.deactivate_entry(&mut ctx, &user_dn()).await;
        assert_eq!(result, Err(Error::AlreadyInactive));
    }

    #[tokio::test]
    async fn deactivate_sets_account_lock() {
        let mut session = lock_state_session(Some("false"));
        session
            .expect_modify()
            .withf(|dn, modifications, _| {
                dn == "uid=tuser,cn=users,cn=accounts,dc=example,dc=com"
                    && modifications
                        == [DirectoryModification::Replace {
                            attribute: ACCOUNT_LOCK.to_string(),
                            values: vec!["TRUE".to_string()],
                        }]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let backend = backend();
        let mut ctx = bound_context(session);
        backend.deactivate_entry(&mut ctx, &user_dn()).await.unwrap();
    }

    #[tokio::test]
    async fn activate_unlocks_entry() {
        let mut session = lock_state_session(Some("TRUE"));
        session
            .expect_modify()
            .withf(|_, modifications, _| {
                modifications
                    == [DirectoryModification::Replace {
                        attribute: ACCOUNT_LOCK.to_string(),
                        values: vec!["FALSE".to_string()],
                    }]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let backend = backend();
        let mut ctx = bound_context(session);
        backend.activate_entry(&mut ctx, &user_dn()).await.unwrap();
    }

    fn member_session() -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(is_config_search)
            .returning(|_| Err(Error::NotFound(String::new())));
        session
            .expect_search()
            .withf(|request: &SearchRequest| request.attributes == vec![NO_ATTRIBUTES])
            .returning(|request| {
                Ok(SearchOutcome {
                    entries: vec![ldap_entry(&request.base_dn, &[])],
                    ..SearchOutcome::default()
                })
            });
        session
    }

    #[tokio::test]
    async fn add_to_group_adds_member_value() {
        let mut session = member_session();
        session
            .expect_modify()
            .withf(|dn, modifications, _| {
                dn == "cn=admins,cn=groups,cn=accounts,dc=example,dc=com"
                    && modifications
                        == [DirectoryModification::Add {
                            attribute: "member".to_string(),
                            values: vec!["uid=tuser,cn=users,cn=accounts,dc=example,dc=com"
                                .to_string()],
                        }]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let backend = backend();
        let mut ctx = bound_context(session);
        backend
            .add_entry_to_group(&mut ctx, &user_dn(), &group_dn(), "member", false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_to_group_twice_is_already_member() {
        let mut session = member_session();
        session
            .expect_modify()
            .returning(|_, _, _| Err(Error::from_result_code(20, "value exists")));

        let backend = backend();
        let mut ctx = bound_context(session);
        let result = backend
            .add_entry_to_group(&mut ctx, &user_dn(), &group_dn(), "member", false)
            .await;
        assert_eq!(result, Err(Error::AlreadyGroupMember));
    }

    #[tokio::test]
    async fn group_cannot_contain_itself() {
        let mut session = member_session();
        session.expect_modify().never();

        let backend = backend();
        let mut ctx = bound_context(session);
        let result = backend
            .add_entry_to_group(&mut ctx, &group_dn(), &group_dn(), "member", false)
            .await;
        assert_eq!(result, Err(Error::SameGroupError));
    }

    #[tokio::test]
    async fn remove_non_member_is_not_group_member() {
        let mut session = MockLdapSession::new();
        session
            .expect_modify()
            .withf(|_, modifications, _| {
                matches!(
                    &modifications[0],
                    DirectoryModification::Delete { attribute, .. } if attribute == "member"
                )
            })
            .returning(|_, _, _| Err(Error::from_result_code(16, "no such value")));

        let backend = backend();
        let mut ctx = bound_context(session);
        let result = backend
            .remove_entry_from_group(&mut ctx, &user_dn(), &group_dn(), "member")
            .await;
        assert_eq!(result, Err(Error::NotGroupMember));
    }

    #[tokio::test]
    async fn remove_principal_key_replaces_blind() {
        let mut session = MockLdapSession::new();
        session
            .expect_modify()
            .withf(|_, modifications, _| {
                modifications
                    == [
                        DirectoryModification::Replace {
                            attribute: "krbprincipalkey".to_string(),
                            values: Vec::new(),
                        },
                        DirectoryModification::Replace {
                            attribute: "krblastpwdchange".to_string(),
                            values: Vec::new(),
                        },
                    ]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let backend = backend();
        let mut ctx = bound_context(session);
        backend.remove_principal_key(&mut ctx, &user_dn()).await.unwrap();
    }

    #[tokio::test]
    async fn update_without_changes_is_noop() {
        let mut session = MockLdapSession::new();
        session.expect_modify().never();
        session.expect_search().returning(|_| {
            Ok(SearchOutcome {
                entries: vec![ldap_entry(
                    "uid=tuser,cn=users,cn=accounts,dc=example,dc=com",
                    &[("cn", &["Test User"])],
                )],
                ..SearchOutcome::default()
            })
        });

        let backend = backend();
        let mut ctx = bound_context(session);
        let mut entry = backend
            .find_entries(
                &mut ctx,
                FindOptions::new().with_time_limit(2).with_size_limit(0),
            )
            .await
            .unwrap()
            .entries
            .remove(0);
        backend.update_entry(&mut ctx, &mut entry).await.unwrap();
    }

    #[tokio::test]
    async fn modify_password_verifies_old_password() {
        let mut checker = MockLdapSession::new();
        checker
            .expect_simple_bind()
            .withf(|dn, password| {
                dn == "uid=tuser,cn=users,cn=accounts,dc=example,dc=com" && password == "wrong"
            })
            .returning(|_, _| Err(Error::from_result_code(49, "invalid credentials")));
        checker.expect_unbind().times(1).returning(|| Ok(()));
        let mut connector = MockLdapConnector::new();
        connector
            .expect_connect()
            .return_once(move |_| Ok(Box::new(checker)));

        let mut session = MockLdapSession::new();
        session.expect_password_modify().never();

        let backend = DirectoryBackend::with_connector(directory_config(), Box::new(connector));
        let mut ctx = bound_context(session);
        let result = backend
            .modify_password(
                &mut ctx,
                &user_dn(),
                &SecretString::from("new".to_string()),
                Some(&SecretString::from("wrong".to_string())),
            )
            .await;
        assert!(matches!(result, Err(Error::AclError(_))));
    }

    #[tokio::test]
    async fn modify_password_without_old_password() {
        let mut session = MockLdapSession::new();
        session
            .expect_password_modify()
            .withf(|dn, old, new| {
                dn == "uid=tuser,cn=users,cn=accounts,dc=example,dc=com"
                    && old.is_empty()
                    && new == "Secret123"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let backend = backend();
        let mut ctx = bound_context(session);
        backend
            .modify_password(
                &mut ctx,
                &user_dn(),
                &SecretString::from("Secret123".to_string()),
                None,
            )
            .await
            .unwrap();
    }
}
