//! Connection lifecycle: bind strategies, connection identity and server controls.

use crate::{
    backend::DirectoryBackend,
    ccache::CredentialCache,
    context::RequestContext,
    dn::DistinguishedName,
    session::{
        DirectoryModification, LdapEntry, LdapSession, SearchOutcome, SearchRequest,
        ServerControl,
    },
    Result,
};
use realm_core::Error;
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a connection authenticates.
pub enum BindMode {
    /// Kerberos bind with the default principal of a credential cache.
    Gssapi {
        /// Credential cache holding the ticket.
        ccache: Box<dyn CredentialCache>,
    },
    /// SASL EXTERNAL bind as the effective OS user.
    SaslExternal,
    /// Simple bind; the empty DN binds anonymously.
    Simple {
        /// Bind DN.
        dn: DistinguishedName,
        /// Bind password.
        password: SecretString,
    },
}

impl BindMode {
    /// Anonymous simple bind.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::Simple {
            dn: DistinguishedName::default(),
            password: SecretString::from(String::new()),
        }
    }

    const fn is_gssapi(&self) -> bool {
        matches!(self, Self::Gssapi { .. })
    }
}

impl fmt::Debug for BindMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gssapi { ccache } => f
                .debug_struct("Gssapi")
                .field("ccache", &ccache.name())
                .finish(),
            Self::SaslExternal => f.write_str("SaslExternal"),
            Self::Simple { dn, .. } => f
                .debug_struct("Simple")
                .field("dn", &dn.as_str())
                .finish_non_exhaustive(),
        }
    }
}

/// Identity a connection is bound as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindIdentity {
    /// Anonymous simple bind.
    Anonymous,
    /// Simple bind as a DN.
    Simple {
        /// Bind DN.
        dn: DistinguishedName,
    },
    /// SASL EXTERNAL as a local account.
    SaslExternal {
        /// Local account name.
        user: String,
    },
    /// GSSAPI as a Kerberos principal.
    Gssapi {
        /// Kerberos principal.
        principal: String,
    },
}

impl fmt::Display for BindIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::Simple { dn } => write!(f, "dn:{dn}"),
            Self::SaslExternal { user } => write!(f, "external:{user}"),
            Self::Gssapi { principal } => write!(f, "krb5:{principal}"),
        }
    }
}

/// One bound directory session.
///
/// Server controls set on the connection are attached to every operation until cleared;
/// use `RequestContext::scoped_controls` so they cannot outlive the operation they are
/// meant for.
pub struct Connection {
    id: ConnectionId,
    identity: BindIdentity,
    session: Box<dyn LdapSession>,
    controls: Vec<ServerControl>,
}

impl Connection {
    pub(crate) fn new(session: Box<dyn LdapSession>, identity: BindIdentity) -> Self {
        Self {
            id: ConnectionId::next(),
            identity,
            session,
            controls: Vec::new(),
        }
    }

    /// Process-unique connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Identity the connection is bound as.
    #[must_use]
    pub const fn identity(&self) -> &BindIdentity {
        &self.identity
    }

    /// Server controls currently attached to every operation.
    #[must_use]
    pub fn controls(&self) -> &[ServerControl] {
        &self.controls
    }

    pub(crate) fn set_controls(&mut self, controls: Vec<ServerControl>) {
        debug!(
            connection_id = %self.id,
            controls = ?controls.iter().map(|c| c.oid.as_str()).collect::<Vec<_>>(),
            "attaching server controls"
        );
        self.controls = controls;
    }

    pub(crate) fn clear_controls(&mut self) {
        if !self.controls.is_empty() {
            debug!(connection_id = %self.id, "clearing server controls");
            self.controls.clear();
        }
    }

    pub(crate) async fn search(&mut self, mut request: SearchRequest) -> Result<SearchOutcome> {
        request.controls.extend(self.controls.iter().cloned());
        debug!(
            connection_id = %self.id,
            base = %request.base_dn,
            scope = ?request.scope,
            filter = %request.filter,
            time_limit = request.time_limit,
            size_limit = request.size_limit,
            paged = request.paged,
            "search"
        );
        let outcome = self.session.search(&request).await?;
        debug!(
            connection_id = %self.id,
            entries = outcome.entries.len(),
            truncated = outcome.truncated,
            "search done"
        );
        Ok(outcome)
    }

    pub(crate) async fn add(&mut self, entry: &LdapEntry) -> Result<()> {
        debug!(connection_id = %self.id, dn = %entry.dn, "add");
        self.session.add(entry, &self.controls).await
    }

    pub(crate) async fn modify(
        &mut self,
        dn: &DistinguishedName,
        modifications: &[DirectoryModification],
    ) -> Result<()> {
        debug!(connection_id = %self.id, dn = %dn, changes = modifications.len(), "modify");
        self.session
            .modify(dn.as_str(), modifications, &self.controls)
            .await
    }

    pub(crate) async fn delete(&mut self, dn: &DistinguishedName) -> Result<()> {
        debug!(connection_id = %self.id, dn = %dn, "delete");
        self.session
            .delete(dn.as_str(), &self.controls)
            .await
    }

    pub(crate) async fn password_modify(
        &mut self,
        dn: &DistinguishedName,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        debug!(connection_id = %self.id, dn = %dn, "password modify");
        self.session
            .password_modify(dn.as_str(), old_password, new_password)
            .await
    }

    async fn close(mut self) {
        if let Err(err) = self.session.unbind().await {
            warn!(connection_id = %self.id, error = %err, "unbind failed");
        }
    }
}

fn as_bind_error(err: Error) -> Error {
    match err {
        Error::ConnectError(_) | Error::BindError(_) => err,
        Error::Timeout(message) => Error::ConnectError(message),
        other => Error::BindError(other.to_string()),
    }
}

fn effective_username() -> Result<String> {
    uzers::get_effective_username()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::BindError("cannot determine the effective user".to_string()))
}

async fn bind(
    session: &mut dyn LdapSession,
    mode: BindMode,
    server_host: &str,
) -> Result<BindIdentity> {
    match mode {
        BindMode::Gssapi { ccache } => {
            let principal = ccache.principal().map_err(as_bind_error)?;
            let name = ccache.name();
            debug!(principal = %principal, ccache = %name, "GSSAPI bind");
            session
                .sasl_gssapi_bind(&name, server_host)
                .await
                .map_err(as_bind_error)?;
            Ok(BindIdentity::Gssapi { principal })
        }
        BindMode::SaslExternal => {
            let user = effective_username()?;
            debug!(user = %user, "SASL EXTERNAL bind");
            session
                .sasl_external_bind(&user)
                .await
                .map_err(as_bind_error)?;
            Ok(BindIdentity::SaslExternal { user })
        }
        BindMode::Simple { dn, password } => {
            debug!(dn = %dn, "simple bind");
            session
                .simple_bind(dn.as_str(), password.expose_secret())
                .await
                .map_err(as_bind_error)?;
            if dn.is_empty() {
                Ok(BindIdentity::Anonymous)
            } else {
                Ok(BindIdentity::Simple { dn })
            }
        }
    }
}

impl DirectoryBackend {
    /// Opens a connection and binds it, replacing any connection the context already holds.
    ///
    /// The SSF minimum is raised to 56 before the bind. A GSSAPI bind records the principal
    /// in the context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectError`] if the server cannot be reached and
    /// [`Error::BindError`] if authentication fails.
    pub async fn connect(&self, ctx: &mut RequestContext, mode: BindMode) -> Result<()> {
        if ctx.is_bound() {
            self.disconnect(ctx).await;
        }

        let security = self.config().transport_security(mode.is_gssapi());
        let mut session = self.connector().connect(&security).await?;

        let identity = match bind(session.as_mut(), mode, self.config().host()).await {
            Ok(identity) => identity,
            Err(err) => {
                if let Err(unbind_err) = session.unbind().await {
                    debug!(error = %unbind_err, "unbind after failed bind");
                }
                return Err(err);
            }
        };

        let connection = Connection::new(session, identity);
        info!(
            connection_id = %connection.id(),
            identity = %connection.identity(),
            "bound to directory"
        );
        let principal = match connection.identity() {
            BindIdentity::Gssapi { principal } => Some(principal.clone()),
            _ => None,
        };
        ctx.set_principal(principal);
        ctx.install(connection);
        Ok(())
    }

    /// Unbinds and drops the context's connection. Calling it on an unbound context is a no-op.
    pub async fn disconnect(&self, ctx: &mut RequestContext) {
        if let Some(connection) = ctx.take_connection() {
            debug!(connection_id = %connection.id(), "disconnecting");
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccache::MockCredentialCache;
    use crate::session::{MockLdapConnector, MockLdapSession, TransportSecurity};
    use crate::test_support::{admin_dn, directory_config};

    fn backend(connector: MockLdapConnector) -> DirectoryBackend {
        DirectoryBackend::with_connector(directory_config(), Box::new(connector))
    }

    fn connector_for(session: MockLdapSession) -> MockLdapConnector {
        let mut connector = MockLdapConnector::new();
        connector
            .expect_connect()
            .times(1)
            .return_once(move |_| Ok(Box::new(session)));
        connector
    }

    fn ticket_cache(principal: &'static str) -> Box<dyn CredentialCache> {
        let mut cache = MockCredentialCache::new();
        cache
            .expect_name()
            .returning(|| "FILE:/tmp/krb5cc_0".to_string());
        cache
            .expect_principal()
            .returning(move || Ok(principal.to_string()));
        Box::new(cache)
    }

    #[tokio::test]
    async fn simple_bind_records_identity() {
        let mut session = MockLdapSession::new();
        session
            .expect_simple_bind()
            .withf(|dn, password| {
                dn == "uid=admin,cn=users,cn=accounts,dc=example,dc=com" && password == "secret"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let backend = backend(connector_for(session));
        let mut ctx = RequestContext::new();
        backend
            .connect(
                &mut ctx,
                BindMode::Simple {
                    dn: admin_dn(),
                    password: SecretString::from("secret".to_string()),
                },
            )
            .await
            .unwrap();

        let connection = ctx.connection().unwrap();
        assert_eq!(connection.identity(), &BindIdentity::Simple { dn: admin_dn() });
        assert!(connection.controls().is_empty());
        assert!(ctx.principal().is_none());
    }

    #[tokio::test]
    async fn empty_dn_binds_anonymously() {
        let mut session = MockLdapSession::new();
        session
            .expect_simple_bind()
            .withf(|dn, password| dn.is_empty() && password.is_empty())
            .returning(|_, _| Ok(()));

        let backend = backend(connector_for(session));
        let mut ctx = RequestContext::new();
        backend.connect(&mut ctx, BindMode::anonymous()).await.unwrap();
        assert_eq!(
            ctx.connection().unwrap().identity(),
            &BindIdentity::Anonymous
        );
    }

    #[tokio::test]
    async fn ssf_minimum_enforced_before_bind() {
        let mut session = MockLdapSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));

        let mut connector = MockLdapConnector::new();
        connector
            .expect_connect()
            .withf(|security: &TransportSecurity| {
                security.min_ssf == 56 && security.max_ssf == 56 && security.starttls
            })
            .return_once(move |_| Ok(Box::new(session)));

        let backend = backend(connector);
        let mut ctx = RequestContext::new();
        backend.connect(&mut ctx, BindMode::anonymous()).await.unwrap();
    }

    #[tokio::test]
    async fn gssapi_bind_records_principal() {
        let mut session = MockLdapSession::new();
        session
            .expect_sasl_gssapi_bind()
            .withf(|ccache, host| ccache == "FILE:/tmp/krb5cc_0" && host == "ipa.example.com")
            .times(1)
            .returning(|_, _| Ok(()));

        let mut connector = MockLdapConnector::new();
        connector
            .expect_connect()
            .withf(|security: &TransportSecurity| !security.starttls && security.min_ssf == 56)
            .return_once(move |_| Ok(Box::new(session)));

        let backend = backend(connector);
        let mut ctx = RequestContext::new();
        backend
            .connect(
                &mut ctx,
                BindMode::Gssapi {
                    ccache: ticket_cache("admin@EXAMPLE.COM"),
                },
            )
            .await
            .unwrap();

        assert_eq!(ctx.principal(), Some("admin@EXAMPLE.COM"));
        assert_eq!(
            ctx.connection().unwrap().identity(),
            &BindIdentity::Gssapi {
                principal: "admin@EXAMPLE.COM".to_string()
            }
        );
    }

    #[tokio::test]
    async fn expired_ticket_is_bind_error() {
        let mut session = MockLdapSession::new();
        session.expect_sasl_gssapi_bind().returning(|_, _| {
            Err(Error::DatabaseError {
                code: 80,
                message: "GSSAPI Error: Ticket expired".to_string(),
            })
        });
        session.expect_unbind().times(1).returning(|| Ok(()));

        let backend = backend(connector_for(session));
        let mut ctx = RequestContext::new();
        let result = backend
            .connect(
                &mut ctx,
                BindMode::Gssapi {
                    ccache: ticket_cache("admin@EXAMPLE.COM"),
                },
            )
            .await;

        assert!(matches!(result, Err(Error::BindError(msg)) if msg.contains("Ticket expired")));
        assert!(!ctx.is_bound());
        assert!(ctx.principal().is_none());
    }

    #[tokio::test]
    async fn unreadable_ccache_is_bind_error() {
        let mut cache = MockCredentialCache::new();
        cache
            .expect_name()
            .returning(|| "FILE:/tmp/krb5cc_0".to_string());
        cache
            .expect_principal()
            .returning(|| Err(Error::InternalError("corrupt".to_string())));

        let mut session = MockLdapSession::new();
        session.expect_sasl_gssapi_bind().never();
        session.expect_unbind().returning(|| Ok(()));

        let backend = backend(connector_for(session));
        let mut ctx = RequestContext::new();
        let result = backend
            .connect(
                &mut ctx,
                BindMode::Gssapi {
                    ccache: Box::new(cache),
                },
            )
            .await;
        assert!(matches!(result, Err(Error::BindError(_))));
    }

    #[tokio::test]
    async fn transport_failure_is_connect_error() {
        let mut connector = MockLdapConnector::new();
        connector
            .expect_connect()
            .returning(|_| Err(Error::ConnectError("connection refused".to_string())));

        let backend = backend(connector);
        let mut ctx = RequestContext::new();
        let result = backend.connect(&mut ctx, BindMode::anonymous()).await;
        assert!(matches!(result, Err(Error::ConnectError(_))));
    }

    #[tokio::test]
    async fn bind_timeout_is_connect_error() {
        let mut session = MockLdapSession::new();
        session
            .expect_simple_bind()
            .returning(|_, _| Err(Error::Timeout("bind timed out".to_string())));
        session.expect_unbind().returning(|| Ok(()));

        let backend = backend(connector_for(session));
        let mut ctx = RequestContext::new();
        let result = backend.connect(&mut ctx, BindMode::anonymous()).await;
        assert!(matches!(result, Err(Error::ConnectError(msg)) if msg == "bind timed out"));
        assert!(!ctx.is_bound());
    }

    #[tokio::test]
    async fn sasl_external_uses_effective_user() {
        let expected = uzers::get_effective_username()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut session = MockLdapSession::new();
        let user = expected.clone();
        session
            .expect_sasl_external_bind()
            .withf(move |authzid| authzid == user)
            .returning(|_| Ok(()));

        let backend = backend(connector_for(session));
        let mut ctx = RequestContext::new();
        let result = backend.connect(&mut ctx, BindMode::SaslExternal).await;
        if expected.is_empty() {
            assert!(matches!(result, Err(Error::BindError(_))));
        } else {
            result.unwrap();
            assert_eq!(
                ctx.connection().unwrap().identity(),
                &BindIdentity::SaslExternal { user: expected }
            );
        }
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let mut session = MockLdapSession::new();
        session.expect_simple_bind().returning(|_, _| Ok(()));
        session
            .expect_unbind()
            .times(1)
            .returning(|| Err(Error::ConnectError("already closed".to_string())));

        let backend = backend(connector_for(session));
        let mut ctx = RequestContext::new();
        backend.connect(&mut ctx, BindMode::anonymous()).await.unwrap();

        backend.disconnect(&mut ctx).await;
        assert!(!ctx.is_bound());
        backend.disconnect(&mut ctx).await;
        assert!(!ctx.is_bound());
    }

    #[tokio::test]
    async fn reconnect_replaces_connection() {
        let mut first = MockLdapSession::new();
        first.expect_simple_bind().returning(|_, _| Ok(()));
        first.expect_unbind().times(1).returning(|| Ok(()));
        let mut second = MockLdapSession::new();
        second.expect_simple_bind().returning(|_, _| Ok(()));

        let mut connector = MockLdapConnector::new();
        let mut sequence = mockall::Sequence::new();
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(move |_| Ok(Box::new(first)));
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(move |_| Ok(Box::new(second)));

        let backend = backend(connector);
        let mut ctx = RequestContext::new();
        backend.connect(&mut ctx, BindMode::anonymous()).await.unwrap();
        let first_id = ctx.connection().unwrap().id();
        backend.connect(&mut ctx, BindMode::anonymous()).await.unwrap();
        assert_ne!(ctx.connection().unwrap().id(), first_id);
    }

    #[tokio::test]
    async fn active_controls_attached_to_writes() {
        let mut session = MockLdapSession::new();
        session
            .expect_delete()
            .withf(|dn, controls| {
                dn == "uid=admin,cn=users,cn=accounts,dc=example,dc=com"
                    && controls.len() == 1
                    && controls[0].oid == "1.2.3"
            })
            .times(1)
            .returning(|_, _| Ok(()));
        session
            .expect_delete()
            .withf(|_, controls| controls.is_empty())
            .times(1)
            .returning(|_, _| Ok(()));

        let mut connection = Connection::new(Box::new(session), BindIdentity::Anonymous);
        connection.set_controls(vec![ServerControl {
            oid: "1.2.3".to_string(),
            critical: false,
            value: None,
        }]);
        connection.delete(&admin_dn()).await.unwrap();
        connection.clear_controls();
        assert!(connection.controls().is_empty());
        connection.delete(&admin_dn()).await.unwrap();
    }
}
