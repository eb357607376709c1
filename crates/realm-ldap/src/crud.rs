//! Create, retrieve, update, delete and search over whole entries.

use crate::{
    backend::{DirectoryBackend, FindOptions},
    context::RequestContext,
    dn::DistinguishedName,
    entry::{AttributeMap, Entry},
    filter::{combine_filters, make_filter, Criteria, MatchRule},
    session::SearchScope,
    Result,
};
use realm_core::Error;
use tracing::debug;

/// Parameters of [`DirectoryBackend::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams {
    filter: Option<String>,
    criteria: Criteria,
    attributes: Vec<String>,
    base_dn: Option<DistinguishedName>,
    scope: SearchScope,
    exact: bool,
}

impl SearchParams {
    /// Subtree search below the realm base DN matching everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            exact: true,
            ..Self::default()
        }
    }

    /// Raw LDAP filter, AND-ed with the keyword criteria.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Keyword criteria; every attribute must match.
    #[must_use]
    pub fn with_criteria(mut self, criteria: Criteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Match keyword values as substrings instead of exactly.
    #[must_use]
    pub const fn with_substring_match(mut self) -> Self {
        self.exact = false;
        self
    }

    /// Attributes to return.
    #[must_use]
    pub fn with_attributes(mut self, attributes: &[&str]) -> Self {
        self.attributes = attributes.iter().map(ToString::to_string).collect();
        self
    }

    /// Search base.
    #[must_use]
    pub fn with_base_dn(mut self, base_dn: DistinguishedName) -> Self {
        self.base_dn = Some(base_dn);
        self
    }

    /// Search scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    fn filter(&self) -> String {
        let criteria = if self.criteria.is_empty() {
            String::new()
        } else {
            make_filter(&self.criteria, MatchRule::All, self.exact)
        };
        let explicit = self.filter.clone().unwrap_or_default();
        combine_filters(&[criteria, explicit], MatchRule::All)
    }
}

/// Entries found by [`DirectoryBackend::search`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchResults {
    /// Every matching entry.
    Complete(Vec<Entry>),
    /// The server stopped early; more entries exist.
    Truncated(Vec<Entry>),
}

impl SearchResults {
    /// Number of entries, or `-1` if the result was truncated.
    #[must_use]
    pub fn count(&self) -> i64 {
        match self {
            Self::Complete(entries) => i64::try_from(entries.len()).unwrap_or(i64::MAX),
            Self::Truncated(_) => -1,
        }
    }

    /// Returns true if more entries exist than were returned.
    #[must_use]
    pub const fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated(_))
    }

    /// The returned entries.
    #[must_use]
    pub fn entries(&self) -> &[Entry] {
        match self {
            Self::Complete(entries) | Self::Truncated(entries) => entries,
        }
    }

    /// Consumes the result, returning the entries.
    #[must_use]
    pub fn into_entries(self) -> Vec<Entry> {
        match self {
            Self::Complete(entries) | Self::Truncated(entries) => entries,
        }
    }
}

impl DirectoryBackend {
    /// Creates the entry `dn` with `attributes` and returns it as stored, including
    /// attributes assigned by the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateEntry`] if the entry exists.
    pub async fn create(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        attributes: AttributeMap<String>,
    ) -> Result<Entry> {
        let mut entry = Entry::new(dn.clone());
        for (name, values) in attributes.iter() {
            entry.set(name, values);
        }
        self.add_entry(ctx, &mut entry).await?;
        self.get_entry(ctx, dn, &[]).await
    }

    /// Reads the entry `dn`; no attributes selects all user attributes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry does not exist.
    pub async fn retrieve(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        attributes: &[&str],
    ) -> Result<Entry> {
        self.get_entry(ctx, dn, attributes).await
    }

    /// Replaces the given attributes of `dn` and returns the entry as stored afterwards.
    ///
    /// An attribute with no values is removed; attributes not named are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry does not exist.
    pub async fn update(
        &self,
        ctx: &mut RequestContext,
        dn: &DistinguishedName,
        attributes: AttributeMap<String>,
    ) -> Result<Entry> {
        let names: Vec<&str> = attributes.iter().map(|(name, _)| name).collect();
        if !names.is_empty() {
            let mut entry = self.get_entry(ctx, dn, &names).await?;
            for (name, values) in attributes.iter() {
                entry.set(name, values);
            }
            self.update_entry(ctx, &mut entry).await?;
        }
        self.get_entry(ctx, dn, &[]).await
    }

    /// Deletes the entry `dn`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the entry does not exist.
    pub async fn delete(&self, ctx: &mut RequestContext, dn: &DistinguishedName) -> Result<()> {
        self.delete_entry(ctx, dn).await
    }

    /// Searches with the configured limits. Nothing matching is an empty, complete result.
    ///
    /// # Errors
    ///
    /// Returns transport errors and [`Error::LimitsExceeded`] from membership resolution.
    pub async fn search(
        &self,
        ctx: &mut RequestContext,
        params: SearchParams,
    ) -> Result<SearchResults> {
        let attributes: Vec<&str> = params.attributes.iter().map(String::as_str).collect();
        let mut options = FindOptions::new()
            .with_filter(params.filter())
            .with_attributes(&attributes)
            .with_scope(params.scope);
        if let Some(base_dn) = params.base_dn.clone() {
            options = options.with_base_dn(base_dn);
        }

        match self.find_entries(ctx, options).await {
            Ok(result) if result.truncated => {
                debug!(returned = result.entries.len(), "search truncated");
                Ok(SearchResults::Truncated(result.entries))
            }
            Ok(result) => Ok(SearchResults::Complete(result.entries)),
            Err(Error::NotFound(_)) => Ok(SearchResults::Complete(Vec::new())),
            Err(err) => Err(err),
        }
    }
}
