//! Indirect group membership.
//!
//! Both resolvers look exactly one search beyond the entry: `memberindirect` collects the
//! members of every entry that is itself a member of the group, `memberofindirect` keeps the
//! `memberOf` values for which no direct membership exists. DN values are compared in their
//! normalised form.

use crate::{
    backend::{DirectoryBackend, MEMBEROF_INDIRECT, MEMBER_INDIRECT},
    context::RequestContext,
    dn::DistinguishedName,
    entry::Entry,
    filter::{combine_filters, make_filter_from_attr, MatchRule},
    session::{SearchRequest, SearchScope, NO_ATTRIBUTES},
    Result,
};
use realm_core::Error;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Attributes through which an entry can be a direct member of a group.
pub const MEMBER_ATTRIBUTES: &[&str] = &["member", "memberuser", "memberhost"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DnKey {
    Dn(DistinguishedName),
    Raw(String),
}

fn dn_key(value: &str) -> DnKey {
    match DistinguishedName::parse(value) {
        Ok(dn) => DnKey::Dn(dn),
        Err(err) => {
            warn!(value, error = %err, "comparing unparseable DN value verbatim");
            DnKey::Raw(value.to_ascii_lowercase())
        }
    }
}

/// Members reachable through `reachable` that are not already in `direct`.
///
/// The result keeps the order in which values first appear and contains no duplicates.
#[must_use]
pub fn indirect_members<I, S>(direct: &[String], reachable: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen: HashSet<DnKey> = direct.iter().map(|value| dn_key(value)).collect();
    reachable
        .into_iter()
        .map(Into::into)
        .filter(|value| seen.insert(dn_key(value)))
        .collect()
}

/// Splits `member_of` into the groups found in `direct_groups` and the rest.
///
/// Returns `(direct, indirect)`, both in `member_of` order.
#[must_use]
pub fn split_direct_memberof(
    member_of: &[String],
    direct_groups: &[DistinguishedName],
) -> (Vec<String>, Vec<String>) {
    let direct: HashSet<&DistinguishedName> = direct_groups.iter().collect();
    member_of.iter().cloned().partition(|value| match dn_key(value) {
        DnKey::Dn(dn) => direct.contains(&dn),
        DnKey::Raw(_) => false,
    })
}

impl DirectoryBackend {
    async fn membership_search(
        &self,
        ctx: &mut RequestContext,
        request: SearchRequest,
    ) -> Result<Vec<Entry>> {
        match self.search_once(ctx, request).await {
            Ok(result) if result.truncated => Err(Error::LimitsExceeded),
            Ok(result) => Ok(result.entries),
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// Sets `memberindirect` on a group entry to the members of its member groups that
    /// are not direct members. The attribute is left unset when there are none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LimitsExceeded`] if the member search was truncated.
    pub async fn process_memberindirect(
        &self,
        ctx: &mut RequestContext,
        group: &mut Entry,
        time_limit: i32,
        size_limit: i32,
    ) -> Result<()> {
        let request = SearchRequest {
            base_dn: self.base_dn().to_string(),
            scope: SearchScope::Subtree,
            filter: make_filter_from_attr(
                "memberof",
                &[group.dn().to_string()],
                MatchRule::All,
                true,
            ),
            attributes: vec!["member".to_string()],
            time_limit,
            size_limit,
            fetch_referrals: false,
            paged: true,
            controls: Vec::new(),
        };
        let nested = self.membership_search(ctx, request).await?;

        let indirect = indirect_members(
            group.values("member"),
            nested
                .iter()
                .flat_map(|entry| entry.values("member").iter().cloned()),
        );
        debug!(dn = %group.dn(), indirect = indirect.len(), "resolved indirect members");
        if !indirect.is_empty() {
            group.set(MEMBER_INDIRECT, indirect);
        }
        Ok(())
    }

    /// Splits `memberOf` of `entry` into direct memberships, kept in `memberOf`, and
    /// memberships through nested groups, moved to `memberofindirect`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LimitsExceeded`] if the group search was truncated.
    pub async fn process_memberofindirect(
        &self,
        ctx: &mut RequestContext,
        entry: &mut Entry,
        time_limit: i32,
        size_limit: i32,
    ) -> Result<()> {
        let dn = entry.dn().to_string();
        let terms: Vec<String> = MEMBER_ATTRIBUTES
            .iter()
            .map(|attribute| {
                make_filter_from_attr(attribute, &[dn.as_str()], MatchRule::Any, true)
            })
            .collect();
        let request = SearchRequest {
            base_dn: self.base_dn().to_string(),
            scope: SearchScope::Subtree,
            filter: combine_filters(&terms, MatchRule::Any),
            attributes: vec![NO_ATTRIBUTES.to_string()],
            time_limit,
            size_limit,
            fetch_referrals: false,
            paged: false,
            controls: Vec::new(),
        };
        let groups: Vec<DistinguishedName> = self
            .membership_search(ctx, request)
            .await?
            .into_iter()
            .map(|group| group.dn().clone())
            .collect();

        let (direct, indirect) = split_direct_memberof(entry.values("memberof"), &groups);
        debug!(
            dn = %entry.dn(),
            direct = direct.len(),
            indirect = indirect.len(),
            "resolved indirect memberships"
        );
        if !indirect.is_empty() {
            if direct.is_empty() {
                entry.remove("memberof");
            } else {
                entry.set("memberof", direct);
            }
            entry.set(MEMBEROF_INDIRECT, indirect);
        }
        Ok(())
    }
}
