//! Effective rights of the bound principal, read with the Get Effective Rights control.

use crate::{
    backend::{single_entry, DirectoryBackend, FindOptions},
    context::RequestContext,
    dn::DistinguishedName,
    entry::Entry,
    session::{SearchScope, ServerControl, NO_ATTRIBUTES},
    Result,
};
use realm_core::Error;
use tracing::debug;

/// OID of the Get Effective Rights request control.
pub const GET_EFFECTIVE_RIGHTS_OID: &str = "1.3.6.1.4.1.42.2.27.9.5.2";
/// Attribute carrying per-attribute rights in a rights response.
pub const ATTRIBUTE_LEVEL_RIGHTS: &str = "attributelevelrights";
/// Attribute carrying entry rights in a rights response.
pub const ENTRY_LEVEL_RIGHTS: &str = "entrylevelrights";

/// What the principal may do with one attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeRights {
    /// Values can be read.
    pub read: bool,
    /// Values can be written.
    pub write: bool,
}

impl AttributeRights {
    fn parse(rights: &str) -> Self {
        Self {
            read: rights.contains('r'),
            write: rights.contains('w'),
        }
    }
}

/// What the principal may do with the entry itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryRights {
    /// Children can be added.
    pub add: bool,
    /// The entry can be deleted.
    pub delete: bool,
    /// The entry can be renamed.
    pub rename: bool,
    /// The entry is visible.
    pub view: bool,
}

impl EntryRights {
    fn parse(rights: &str) -> Self {
        Self {
            add: rights.contains('a'),
            delete: rights.contains('d'),
            rename: rights.contains('n'),
            view: rights.contains('v'),
        }
    }
}

/// Rights of one principal on one entry. Never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveRights {
    attributes: Vec<(String, AttributeRights)>,
    entry: EntryRights,
}

impl EffectiveRights {
    /// Parses the rights attributes of a rights response. Missing attributes grant nothing.
    #[must_use]
    pub fn from_entry(entry: &Entry) -> Self {
        let attributes = entry
            .values(ATTRIBUTE_LEVEL_RIGHTS)
            .iter()
            .flat_map(|value| value.split(','))
            .filter_map(|pair| pair.trim().split_once(':'))
            .map(|(name, rights)| {
                (
                    name.trim().to_ascii_lowercase(),
                    AttributeRights::parse(rights.trim()),
                )
            })
            .collect();
        let entry = entry
            .first(ENTRY_LEVEL_RIGHTS)
            .map(EntryRights::parse)
            .unwrap_or_default();
        Self { attributes, entry }
    }

    /// Rights on `attribute`; an attribute the response does not list grants nothing.
    #[must_use]
    pub fn attribute(&self, attribute: &str) -> AttributeRights {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, rights)| *rights)
            .unwrap_or_default()
    }

    /// Attributes listed in the response, in response order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, AttributeRights)> + '_ {
        self.attributes
            .iter()
            .map(|(name, rights)| (name.as_str(), *rights))
    }

    /// Entry-level rights.
    #[must_use]
    pub const fn entry(&self) -> EntryRights {
        self.entry
    }
}

impl DirectoryBackend {
    /// Reads `dn` with the rights of the context's principal attached.
    ///
    /// The returned entry carries `attributeLevelRights` and `entryLevelRights`. The
    /// control is removed from the connection before this returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the context has no authenticated principal and
    /// [`Error::NotFound`] if the principal or the target entry does not exist.
    ///
    /// # Panics
    ///
    /// Panics if the context is unbound.
    pub async fn get_effective_rights(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        attributes: &[&str],
    ) -> Result<Entry> {
        let principal = ctx
            .principal()
            .map(ToOwned::to_owned)
            .ok_or_else(|| Error::InvalidRequest("no authenticated principal".to_string()))?;
        let principal_entry = self
            .find_entry_by_attr(
                ctx,
                "krbprincipalname",
                &principal,
                "krbPrincipalAux",
                &[NO_ATTRIBUTES],
                Some(self.base_dn()),
            )
            .await?;

        // Limits are resolved first so the configuration read never carries the control.
        let (time_limit, size_limit) = self.search_limits(ctx, &FindOptions::new()).await?;
        let options = FindOptions::new()
            .with_base_dn(dn.clone())
            .with_scope(SearchScope::Base)
            .with_attributes(attributes)
            .with_time_limit(time_limit)
            .with_size_limit(size_limit);

        debug!(dn = %dn, principal = %principal, "reading effective rights");
        let mut guard = ctx.scoped_controls(vec![ServerControl {
            oid: GET_EFFECTIVE_RIGHTS_OID.to_string(),
            critical: true,
            value: Some(format!("dn: {}", principal_entry.dn()).into_bytes()),
        }]);
        let result = self.find_entries(&mut guard, options).await?;
        single_entry(result)
    }

    /// Parsed form of [`DirectoryBackend::get_effective_rights`].
    ///
    /// # Errors
    ///
    /// See [`DirectoryBackend::get_effective_rights`].
    pub async fn effective_rights(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        attributes: &[&str],
    ) -> Result<EffectiveRights> {
        let entry = self.get_effective_rights(ctx, dn, attributes).await?;
        Ok(EffectiveRights::from_entry(&entry))
    }

    /// Returns true if the principal may read `attribute` of `dn`.
    ///
    /// # Errors
    ///
    /// See [`DirectoryBackend::get_effective_rights`].
    pub async fn can_read(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        attribute: &str,
    ) -> Result<bool> {
        let rights = self.effective_rights(ctx, dn, &[attribute]).await?;
        Ok(rights.attribute(attribute).read)
    }

    /// Returns true if the principal may write `attribute` of `dn`.
    ///
    /// # Errors
    ///
    /// See [`DirectoryBackend::get_effective_rights`].
    pub async fn can_write(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        attribute: &str,
    ) -> Result<bool> {
        let rights = self.effective_rights(ctx, dn, &[attribute]).await?;
        Ok(rights.attribute(attribute).write)
    }

    /// Returns true if the principal may add entries below `dn`.
    ///
    /// # Errors
    ///
    /// See [`DirectoryBackend::get_effective_rights`].
    pub async fn can_add(&self, ctx: &mut RequestContext, dn: &DistinguishedName) -> Result<bool> {
        let rights = self.effective_rights(ctx, dn, &["*"]).await?;
        Ok(rights.entry().add)
    }

    /// Returns true if the principal may delete `dn`.
    ///
    /// # Errors
    ///
    /// See [`DirectoryBackend::get_effective_rights`].
    pub async fn can_delete(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
    ) -> Result<bool> {
        let rights = self.effective_rights(ctx, dn, &["*"]).await?;
        Ok(rights.entry().delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockLdapSession, SearchOutcome, SearchRequest};
    use crate::test_support::{backend, bound_context, dn, is_config_search, ldap_entry};

    const PRINCIPAL: &str = "admin@EXAMPLE.COM";
    const PRINCIPAL_DN: &str = "uid=admin,cn=users,cn=accounts,dc=example,dc=com";
    const TARGET: &str = "uid=tuser,cn=users,cn=accounts,dc=example,dc=com";

    fn carries_rights_control(request: &SearchRequest) -> bool {
        request.controls.iter().any(|control| {
            control.oid == GET_EFFECTIVE_RIGHTS_OID
                && control.critical
                && control.value.as_deref() == Some(format!("dn: {PRINCIPAL_DN}").as_bytes())
        })
    }

    /// Session answering the configuration, principal and target reads.
    fn rights_session(
        target: Option<(&'static str, &'static str)>,
        rights_reads: usize,
    ) -> MockLdapSession {
        let mut session = MockLdapSession::new();
        session
            .expect_search()
            .withf(|request: &SearchRequest| {
                is_config_search(request) && request.controls.is_empty()
            })
            .times(1)
            .returning(|_| Ok(SearchOutcome::default()));
        session
            .expect_search()
            .withf(|request: &SearchRequest| {
                request.filter.contains("krbprincipalname=admin@EXAMPLE.COM")
                    && request.controls.is_empty()
            })
            .returning(|_| {
                Ok(SearchOutcome {
                    entries: vec![ldap_entry(PRINCIPAL_DN, &[])],
                    ..SearchOutcome::default()
                })
            });
        session
            .expect_search()
            .withf(|request: &SearchRequest| {
                request.base_dn == TARGET && carries_rights_control(request)
            })
            .times(rights_reads)
            .returning(move |_| {
                let entries = match target {
                    Some((attribute_rights, entry_rights)) => vec![ldap_entry(
                        TARGET,
                        &[
                            ("attributeLevelRights", &[attribute_rights]),
                            ("entryLevelRights", &[entry_rights]),
                        ],
                    )],
                    None => Vec::new(),
                };
                Ok(SearchOutcome {
                    entries,
                    ..SearchOutcome::default()
                })
            });
        session
    }

    fn context(session: MockLdapSession) -> RequestContext {
        let mut ctx = bound_context(session);
        ctx.set_principal(Some(PRINCIPAL.to_string()));
        ctx
    }

    #[test]
    fn parse_rights_entry() {
        let entry = Entry::new(dn(TARGET))
            .with(ATTRIBUTE_LEVEL_RIGHTS, "cn:rscwo, Description:rsc")
            .with(ENTRY_LEVEL_RIGHTS, "vadn");
        let rights = EffectiveRights::from_entry(&entry);

        assert_eq!(
            rights.attribute("CN"),
            AttributeRights {
                read: true,
                write: true
            }
        );
        assert_eq!(
            rights.attribute("description"),
            AttributeRights {
                read: true,
                write: false
            }
        );
        assert_eq!(rights.attribute("mail"), AttributeRights::default());
        assert!(rights.entry().add && rights.entry().delete && rights.entry().view);
        assert_eq!(rights.attributes().count(), 2);
    }

    #[test]
    fn missing_rights_grant_nothing() {
        let rights = EffectiveRights::from_entry(&Entry::new(dn(TARGET)));
        assert_eq!(rights.entry(), EntryRights::default());
        assert!(!rights.attribute("cn").read);
    }

    #[tokio::test]
    async fn repeated_reads_are_identical_and_leave_no_controls() {
        let backend = backend();
        let mut ctx = context(rights_session(Some(("cn:rsc", "v")), 2));
        let target = dn(TARGET);

        let first = backend
            .get_effective_rights(&mut ctx, &target, &["cn"])
            .await
            .unwrap();
        assert!(ctx.connection().unwrap().controls().is_empty());

        let second = backend
            .get_effective_rights(&mut ctx, &target, &["cn"])
            .await
            .unwrap();
        assert!(ctx.connection().unwrap().controls().is_empty());
        assert_eq!(first, second);
        assert_eq!(first.values("attributelevelrights"), ["cn:rsc"]);
    }

    #[tokio::test]
    async fn control_cleared_when_target_missing() {
        let backend = backend();
        let mut ctx = context(rights_session(None, 1));

        let err = backend
            .get_effective_rights(&mut ctx, &dn(TARGET), &["cn"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(ctx.connection().unwrap().controls().is_empty());
    }

    #[tokio::test]
    async fn requires_authenticated_principal() {
        let backend = backend();
        let mut ctx = bound_context(MockLdapSession::new());

        let err = backend
            .get_effective_rights(&mut ctx, &dn(TARGET), &["cn"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn attribute_predicates() {
        let backend = backend();
        let mut ctx = context(rights_session(Some(("cn:rscwo", "v")), 2));
        let target = dn(TARGET);

        assert!(backend.can_read(&mut ctx, &target, "cn").await.unwrap());
        assert!(backend.can_write(&mut ctx, &target, "cn").await.unwrap());
    }

    #[tokio::test]
    async fn entry_predicates() {
        let backend = backend();
        let mut ctx = context(rights_session(Some(("cn:rsc", "vd")), 2));
        let target = dn(TARGET);

        assert!(!backend.can_add(&mut ctx, &target).await.unwrap());
        assert!(backend.can_delete(&mut ctx, &target).await.unwrap());
    }

    #[tokio::test]
    async fn missing_attribute_is_not_writable() {
        let backend = backend();
        let mut ctx = context(rights_session(Some(("cn:rsc", "v")), 1));

        assert!(!backend
            .can_write(&mut ctx, &dn(TARGET), "mail")
            .await
            .unwrap());
    }
}
