//! Fixtures shared by the unit tests.

use crate::backend::DirectoryBackend;
use crate::config::DirectoryConfig;
use crate::connection::{BindIdentity, Connection};
use crate::context::RequestContext;
use crate::dn::DistinguishedName;
use crate::session::{LdapEntry, MockLdapConnector, MockLdapSession, SearchRequest, SearchScope};

pub(crate) const CONFIG_DN: &str = "cn=ipaconfig,cn=etc,dc=example,dc=com";

pub(crate) fn dn(value: &str) -> DistinguishedName {
    DistinguishedName::parse(value).unwrap()
}

pub(crate) fn admin_dn() -> DistinguishedName {
    dn("uid=admin,cn=users,cn=accounts,dc=example,dc=com")
}

pub(crate) fn directory_config() -> DirectoryConfig {
    DirectoryConfig::new(
        "ldap://ipa.example.com",
        dn("dc=example,dc=com"),
        "ipa.example.com",
    )
    .unwrap()
    .with_domain("example.com")
}

pub(crate) fn backend() -> DirectoryBackend {
    DirectoryBackend::with_connector(directory_config(), Box::new(MockLdapConnector::new()))
}

pub(crate) fn bound_context(session: MockLdapSession) -> RequestContext {
    let mut ctx = RequestContext::new();
    ctx.install(Connection::new(
        Box::new(session),
        BindIdentity::Simple { dn: admin_dn() },
    ));
    ctx
}

pub(crate) fn ldap_entry(dn: &str, attributes: &[(&str, &[&str])]) -> LdapEntry {
    LdapEntry {
        dn: dn.to_string(),
        attributes: attributes
            .iter()
            .map(|(name, values)| {
                (
                    (*name).to_string(),
                    values.iter().map(|value| (*value).to_string()).collect(),
                )
            })
            .collect(),
        binary_attributes: Vec::new(),
    }
}

pub(crate) fn is_config_search(request: &SearchRequest) -> bool {
    request.base_dn == CONFIG_DN && request.scope == SearchScope::Base
}
