//! Kerberos credential cache access.
//!
//! Only the default principal of a cache is needed: the ticket itself is consumed by the
//! GSSAPI library during the bind. With the `gssapi` feature any cache type the Kerberos
//! library knows (`KCM:`, `KEYRING:`, `DIR:`) is read through GSSAPI; without it only MIT
//! `FILE:` caches can be opened.

use crate::Result;
use realm_core::Error;
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "FILE:";

/// A Kerberos credential cache.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialCache: Send + Sync {
    /// Fully qualified cache name, e.g. `FILE:/tmp/krb5cc_0`.
    fn name(&self) -> String;

    /// Default principal of the cache, e.g. `admin@EXAMPLE.COM`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BindError`] if the cache cannot be read.
    fn principal(&self) -> Result<String>;
}

/// Opens the credential cache called `name`, e.g. `FILE:/tmp/krb5cc_0` or `KCM:1000`.
///
/// A bare path is a `FILE:` cache.
///
/// # Errors
///
/// Returns [`Error::BindError`] for a cache type this build cannot read.
pub fn open_credential_cache(name: &str) -> Result<Box<dyn CredentialCache>> {
    match cache_type(name) {
        None | Some("FILE") => Ok(Box::new(FileCredentialCache::from_name(name)?)),
        #[cfg(feature = "gssapi")]
        Some(_) => Ok(Box::new(GssapiCredentialCache::new(name))),
        #[cfg(not(feature = "gssapi"))]
        Some(kind) => Err(unsupported_type(kind)),
    }
}

/// The cache named by `KRB5CCNAME`, or the default cache of the current user.
///
/// Without `KRB5CCNAME` a `gssapi` build asks the Kerberos library for its configured
/// default; other builds use `/tmp/krb5cc_<uid>`.
///
/// # Errors
///
/// Returns [`Error::BindError`] if `KRB5CCNAME` names a cache type this build cannot read.
pub fn default_credential_cache() -> Result<Box<dyn CredentialCache>> {
    match std::env::var("KRB5CCNAME") {
        Ok(name) if !name.is_empty() => open_credential_cache(&name),
        #[cfg(feature = "gssapi")]
        _ => Ok(Box::new(GssapiCredentialCache::default_cache())),
        #[cfg(not(feature = "gssapi"))]
        _ => Ok(Box::new(FileCredentialCache::new(format!(
            "/tmp/krb5cc_{}",
            uzers::get_effective_uid()
        )))),
    }
}

fn cache_type(name: &str) -> Option<&str> {
    name.split_once(':')
        .map(|(kind, _)| kind)
        .filter(|kind| !kind.contains('/'))
}

fn unsupported_type(kind: &str) -> Error {
    Error::BindError(format!(
        "credential cache type {kind} needs a build with GSSAPI support"
    ))
}

/// MIT `FILE:` credential cache, format versions 3 and 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCredentialCache {
    path: PathBuf,
}

impl FileCredentialCache {
    /// Opens the cache at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Resolves a cache name such as `FILE:/tmp/krb5cc_0` or a bare path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BindError`] for cache types other than `FILE`; use
    /// [`open_credential_cache`] for those.
    pub fn from_name(name: &str) -> Result<Self> {
        if let Some(path) = name.strip_prefix(FILE_PREFIX) {
            return Ok(Self::new(path));
        }
        match cache_type(name) {
            Some(kind) => Err(unsupported_type(kind)),
            None => Ok(Self::new(name)),
        }
    }

    /// Path of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialCache for FileCredentialCache {
    fn name(&self) -> String {
        format!("{FILE_PREFIX}{}", self.path.display())
    }

    fn principal(&self) -> Result<String> {
        let data = std::fs::read(&self.path).map_err(|err| {
            Error::BindError(format!(
                "cannot read credential cache {}: {err}",
                self.path.display()
            ))
        })?;
        parse_default_principal(&data).map_err(|reason| {
            Error::BindError(format!(
                "invalid credential cache {}: {reason}",
                self.path.display()
            ))
        })
    }
}

/// Credential cache of any type, read through the GSSAPI library.
///
/// The principal is the name of the initiator credential acquired from the cache.
#[cfg(feature = "gssapi")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GssapiCredentialCache {
    name: Option<String>,
}

#[cfg(feature = "gssapi")]
impl GssapiCredentialCache {
    /// The cache called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    /// The default cache configured for the Kerberos library.
    #[must_use]
    pub const fn default_cache() -> Self {
        Self { name: None }
    }

    fn gss_error(&self, err: &libgssapi::error::Error) -> Error {
        Error::BindError(format!(
            "cannot read credential cache {}: {err}",
            self.name.as_deref().unwrap_or("(default)")
        ))
    }
}

#[cfg(feature = "gssapi")]
impl CredentialCache for GssapiCredentialCache {
    /// Empty for the library default, so that no `KRB5CCNAME` is exported.
    fn name(&self) -> String {
        self.name.clone().unwrap_or_default()
    }

    fn principal(&self) -> Result<String> {
        use libgssapi::credential::{Cred, CredUsage};
        use libgssapi::oid::{OidSet, GSS_MECH_KRB5};

        if let Some(name) = &self.name {
            std::env::set_var("KRB5CCNAME", name);
        }
        let mut mechs = OidSet::new().map_err(|err| self.gss_error(&err))?;
        mechs
            .add(&GSS_MECH_KRB5)
            .map_err(|err| self.gss_error(&err))?;
        let cred = Cred::acquire(None, None, CredUsage::Initiate, Some(&mechs))
            .map_err(|err| self.gss_error(&err))?;
        let principal = cred.name().map_err(|err| self.gss_error(&err))?;
        Ok(principal.to_string())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| "unexpected end of data".to_string())?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u16(&mut self) -> std::result::Result<u16, String> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn counted_string(&mut self) -> std::result::Result<String, String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| "non UTF-8 principal".to_string())
    }
}

fn parse_default_principal(data: &[u8]) -> std::result::Result<String, String> {
    let mut reader = Reader { data, pos: 0 };
    match reader.u16()? {
        0x0503 => {}
        0x0504 => {
            let header_len = reader.u16()? as usize;
            reader.take(header_len)?;
        }
        version => return Err(format!("unsupported format version {version:#06x}")),
    }

    let _name_type = reader.u32()?;
    let components = reader.u32()?;
    let realm = reader.counted_string()?;
    let names = (0..components)
        .map(|_| reader.counted_string())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if names.is_empty() {
        return Err("default principal has no components".to_string());
    }

    Ok(format!("{}@{realm}", names.join("/")))
}
