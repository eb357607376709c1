//! Domains associated with the realm.

use async_trait::async_trait;
use realm_core::Error;
use tracing::{info, warn};

use crate::{
    backend::DirectoryBackend, context::RequestContext, dn::DistinguishedName, entry::Entry,
    Result,
};

/// Attribute listing the realm domains.
pub const ASSOCIATED_DOMAIN: &str = "associateddomain";

const MAX_DOMAIN_LENGTH: usize = 253;
const MAX_LABEL_LENGTH: usize = 63;

/// Checks that a domain is delegated in DNS.
///
/// No implementation ships with this crate. Callers provide one backed by their DNS
/// resolver, or use [`RealmDomains::without_dns_check`] and force every change.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DomainVerifier: Send + Sync {
    /// Returns true if `domain` has an SOA or NS record.
    async fn has_soa_or_ns_record(&self, domain: &str) -> Result<bool>;
}

/// Change to the realm domain list.
///
/// `domains` replaces the whole list and cannot be combined with `add_domain` or
/// `del_domain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealmDomainsUpdate {
    /// New list of domains.
    pub domains: Option<Vec<String>>,
    /// Domain to add.
    pub add_domain: Option<String>,
    /// Domain to remove.
    pub del_domain: Option<String>,
    /// Skip the DNS check of new domains.
    pub force: bool,
}

/// Realm domain list stored below the realm configuration.
pub struct RealmDomains<'a> {
    backend: &'a DirectoryBackend,
    verifier: Option<&'a dyn DomainVerifier>,
}

impl<'a> RealmDomains<'a> {
    /// Creates a handle checking new domains with `verifier`.
    #[must_use]
    pub fn new(backend: &'a DirectoryBackend, verifier: &'a dyn DomainVerifier) -> Self {
        Self {
            backend,
            verifier: Some(verifier),
        }
    }

    /// Creates a handle that cannot check DNS: adding or replacing domains requires
    /// [`RealmDomainsUpdate::force`].
    #[must_use]
    pub fn without_dns_check(backend: &'a DirectoryBackend) -> Self {
        Self {
            backend,
            verifier: None,
        }
    }

    /// DN of the realm domains container.
    #[must_use]
    pub fn container_dn(&self) -> DistinguishedName {
        DistinguishedName::from_rdns([("cn", "Realm Domains"), ("cn", "ipa"), ("cn", "etc")])
            .join(self.backend.base_dn())
    }

    /// Lists the realm domains.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the container does not exist.
    pub async fn show(&self, ctx: &mut RequestContext) -> Result<Vec<String>> {
        let entry = self.read(ctx).await?;
        Ok(entry.values(ASSOCIATED_DOMAIN).to_vec())
    }

    /// Applies `update` and returns the resulting list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValidationError`] for malformed domains, domains missing from DNS and
    /// attempts to drop the server's own domain, [`Error::MutuallyExclusive`] when a full list
    /// is combined with an addition or removal, and [`Error::AttrValueNotFound`] when removing
    /// a domain that is not listed.
    pub async fn modify(
        &self,
        ctx: &mut RequestContext,
        update: RealmDomainsUpdate,
    ) -> Result<Vec<String>> {
        let own_domain = self.backend.config().domain().to_string();

        if let Some(domains) = &update.domains {
            for domain in domains {
                validate_domain_name("domain", domain)?;
            }
        }
        if let Some(domain) = &update.add_domain {
            validate_domain_name("add_domain", domain)?;
        }
        if let Some(domain) = &update.del_domain {
            validate_domain_name("del_domain", domain)?;
        }

        let mut entry = self.read(ctx).await?;

        if let Some(domains) = update.domains {
            if update.add_domain.is_some() || update.del_domain.is_some() {
                return Err(Error::MutuallyExclusive(
                    "domains cannot be combined with add_domain or del_domain".to_string(),
                ));
            }
            if !domains.iter().any(|d| d.eq_ignore_ascii_case(&own_domain)) {
                return Err(validation_error("domain", "cannot delete domain of the server"));
            }
            if !update.force {
                for domain in &domains {
                    self.require_dns("domain", domain).await?;
                }
            }
            entry.set(ASSOCIATED_DOMAIN, domains);
        } else {
            let mut domains = entry.values(ASSOCIATED_DOMAIN).to_vec();
            if let Some(domain) = update.add_domain {
                if !update.force {
                    self.require_dns("add_domain", &domain).await?;
                }
                domains.push(domain);
            }
            if let Some(domain) = update.del_domain {
                if domain.eq_ignore_ascii_case(&own_domain) {
                    return Err(validation_error(
                        "del_domain",
                        "cannot delete domain of the server",
                    ));
                }
                let position = domains
                    .iter()
                    .position(|d| d.eq_ignore_ascii_case(&domain))
                    .ok_or_else(|| Error::AttrValueNotFound {
                        attr: ASSOCIATED_DOMAIN.to_string(),
                        value: domain.clone(),
                    })?;
                domains.remove(position);
            }
            entry.set(ASSOCIATED_DOMAIN, domains);
        }

        self.backend.update_entry(ctx, &mut entry).await?;
        let domains = entry.values(ASSOCIATED_DOMAIN).to_vec();
        info!(domains = ?domains, "realm domains updated");
        Ok(domains)
    }

    async fn read(&self, ctx: &mut RequestContext) -> Result<Entry> {
        self.backend
            .get_entry(ctx, &self.container_dn(), &[ASSOCIATED_DOMAIN])
            .await
    }

    async fn require_dns(&self, field: &str, domain: &str) -> Result<()> {
        let Some(verifier) = self.verifier else {
            return Err(validation_error(
                field,
                &format!("cannot check DNS records of domain {domain}, use force"),
            ));
        };
        if verifier.has_soa_or_ns_record(domain).await? {
            return Ok(());
        }
        warn!(domain = %domain, "no SOA or NS record");
        Err(validation_error(
            field,
            &format!("no SOA or NS records found for domain {domain}"),
        ))
    }
}

fn validation_error(name: &str, error: &str) -> Error {
    Error::ValidationError {
        name: name.to_string(),
        error: error.to_string(),
    }
}

/// Checks DNS name syntax; a single trailing dot is accepted.
fn validate_domain_name(field: &str, domain: &str) -> Result<()> {
    let name = domain.strip_suffix('.').unwrap_or(domain);
    if name.is_empty() || name.len() > MAX_DOMAIN_LENGTH {
        return Err(validation_error(field, "invalid domain name length"));
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(validation_error(field, "invalid domain label length"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(validation_error(
                field,
                "domain labels cannot start or end with '-'",
            ));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(validation_error(
                field,
                "only letters, numbers and '-' are allowed in domain labels",
            ));
        }
    }
    Ok(())
}
