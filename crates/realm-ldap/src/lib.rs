//! # realm-ldap
//!
//! Access layer over the realm directory.
//!
//! Every operation runs on the connection held by a [`RequestContext`]; the
//! [`DirectoryBackend`] only carries configuration and the transport connector.
//!
//! ## Modules
//!
//! - [`dn`] and [`entry`] - Distinguished names and multi-valued entries
//! - [`connection`], [`ccache`] and [`session`] - Binds (GSSAPI, SASL EXTERNAL, simple) and
//!   the transport
//! - [`backend`] and [`filter`] - Searches with configured limits, entry writes
//! - [`membership`] - `memberindirect` and `memberofindirect`
//! - [`rights`] - Effective rights of the bound principal
//! - [`crud`] - Whole-entry create, retrieve, update, delete and search
//! - [`realmdomains`] - Domains associated with the realm

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod ccache;
pub mod config;
pub mod connection;
pub mod context;
pub mod crud;
pub mod dn;
pub mod entry;
pub mod filter;
pub mod membership;
pub mod realmdomains;
pub mod rights;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use backend::{DirectoryBackend, FindOptions, SearchResult};
pub use ccache::{
    default_credential_cache, open_credential_cache, CredentialCache, FileCredentialCache,
};
#[cfg(feature = "gssapi")]
pub use ccache::GssapiCredentialCache;
pub use config::{DirectoryConfig, SsfPolicy, TransportScheme};
pub use connection::{BindIdentity, BindMode, Connection, ConnectionId};
pub use context::{RequestContext, ScopedControls};
pub use crud::{SearchParams, SearchResults};
pub use dn::{DistinguishedName, DistinguishedNameError, RelativeDistinguishedName};
pub use entry::{AttributeMap, Entry, IntoValues};
pub use filter::{Criteria, MatchRule};
pub use realmdomains::{DomainVerifier, RealmDomains, RealmDomainsUpdate};
pub use rights::{AttributeRights, EffectiveRights, EntryRights};
pub use session::{
    DirectoryModification, LdapConnector, LdapEntry, LdapSession, RealLdapConnector,
    SearchScope, ServerControl,
};

/// Convenient result alias that reuses the core error type.
pub type Result<T> = realm_core::Result<T>;
