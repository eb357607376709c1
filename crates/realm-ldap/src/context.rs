//! Per-request state.

use std::ops::{Deref, DerefMut};

use crate::connection::{Connection, ConnectionId};
use crate::entry::Entry;
use crate::session::ServerControl;

/// State owned by one inbound request: its directory connection, the principal it
/// authenticated as and the configuration entry cached for that connection.
///
/// A context is created fresh for every request and dropped (or [`cleared`](Self::clear))
/// when the request ends. It is never shared between concurrent requests.
#[derive(Default)]
pub struct RequestContext {
    connection: Option<Connection>,
    principal: Option<String>,
    config_entry: Option<(ConnectionId, Entry)>,
}

impl RequestContext {
    /// Creates an unbound context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the context holds a bound connection.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.connection.is_some()
    }

    /// The bound connection, if any.
    #[must_use]
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Kerberos principal recorded by a GSSAPI bind.
    #[must_use]
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Forgets the principal and the cached configuration entry.
    ///
    /// The connection is left alone; use `DirectoryBackend::disconnect` to close it.
    pub fn clear(&mut self) {
        self.principal = None;
        self.config_entry = None;
    }

    /// The bound connection.
    ///
    /// # Panics
    ///
    /// Panics if the context is unbound: issuing directory operations before `connect` is a
    /// programming error.
    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        match self.connection.as_mut() {
            Some(connection) => connection,
            None => panic!("directory operation attempted on an unbound request context"),
        }
    }

    /// Attaches `controls` to every operation on the bound connection until the returned
    /// guard is dropped, on success and on error alike.
    ///
    /// # Panics
    ///
    /// Panics if the context is unbound.
    pub fn scoped_controls(&mut self, controls: Vec<ServerControl>) -> ScopedControls<'_> {
        self.connection_mut().set_controls(controls);
        ScopedControls { ctx: self }
    }

    pub(crate) fn install(&mut self, connection: Connection) {
        self.connection = Some(connection);
    }

    pub(crate) fn take_connection(&mut self) -> Option<Connection> {
        self.connection.take()
    }

    pub(crate) fn set_principal(&mut self, principal: Option<String>) {
        self.principal = principal;
    }

    /// Cached configuration entry, only if it was fetched over the current connection.
    pub(crate) fn cached_config(&self) -> Option<&Entry> {
        let current = self.connection.as_ref()?.id();
        match &self.config_entry {
            Some((id, entry)) if *id == current => Some(entry),
            _ => None,
        }
    }

    pub(crate) fn cache_config(&mut self, entry: Entry) {
        if let Some(connection) = &self.connection {
            self.config_entry = Some((connection.id(), entry));
        }
    }
}

/// Guard returned by [`RequestContext::scoped_controls`].
pub struct ScopedControls<'a> {
    ctx: &'a mut RequestContext,
}

impl Deref for ScopedControls<'_> {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        self.ctx
    }
}

impl DerefMut for ScopedControls<'_> {
    fn deref_mut(&mut self) -> &mut RequestContext {
        self.ctx
    }
}

impl Drop for ScopedControls<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.ctx.connection.as_mut() {
            connection.clear_controls();
        }
    }
}
