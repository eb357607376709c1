//! Distinguished Name utilities for directory entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

use realm_core::Error as CoreError;

/// Errors that can occur when parsing or manipulating distinguished names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistinguishedNameError {
    /// The distinguished name was empty.
    #[error("distinguished name cannot be empty")]
    Empty,
    /// A component in the distinguished name was invalid.
    #[error("invalid distinguished name component: {0}")]
    InvalidComponent(String),
    /// A component was missing the attribute name to the left of the `=`.
    #[error("distinguished name component missing attribute: {0}")]
    MissingAttribute(String),
    /// A component was missing the value to the right of the `=`.
    #[error("distinguished name component missing value for attribute {0}")]
    MissingValue(String),
    /// The distinguished name ended with an escape character.
    #[error("distinguished name contains an unterminated escape sequence")]
    UnterminatedEscape,
}

impl From<DistinguishedNameError> for CoreError {
    fn from(err: DistinguishedNameError) -> Self {
        CoreError::InvalidSyntax(err.to_string())
    }
}

/// Relative distinguished name (single attribute/value pair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativeDistinguishedName {
    attribute: String,
    value: String,
}

impl RelativeDistinguishedName {
    /// Create a new relative distinguished name.
    #[must_use]
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Attribute portion of the RDN (e.g. `cn`).
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Attribute value portion of the RDN.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns true if this RDN matches the provided attribute name (case-insensitive).
    #[must_use]
    pub fn matches_attribute(&self, attribute: &str) -> bool {
        self.attribute.eq_ignore_ascii_case(attribute)
    }

    fn normalized(&self) -> (String, String) {
        (self.attribute.to_ascii_lowercase(), normalize_value(&self.value))
    }
}

/// Strongly-typed distinguished name.
///
/// Keeps a canonical string representation alongside the parsed RDN sets. Equality and hashing
/// compare the normalised form: attribute names and values are case-folded and runs of
/// whitespace inside values are collapsed, so `CN=Admins, DC=Example` equals
/// `cn=admins,dc=example`. The empty DN (the root, also used for anonymous binds) is the
/// [`Default`] value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DistinguishedName {
    raw: String,
    rdns: Vec<Vec<RelativeDistinguishedName>>,
}

impl DistinguishedName {
    /// Parses a distinguished name (RFC 4514).
    ///
    /// Both `,` and `;` separate RDNs and `+` joins the parts of a multi-valued RDN. Values
    /// may use single-character (`\,`) and hex-pair (`\2C`) escapes.
    ///
    /// # Errors
    ///
    /// Returns [`DistinguishedNameError`] if the input is empty or malformed.
    pub fn parse(input: impl AsRef<str>) -> std::result::Result<Self, DistinguishedNameError> {
        let input = input.as_ref().trim();
        if input.is_empty() {
            return Err(DistinguishedNameError::Empty);
        }
        let rdns = Scanner::default().scan(input)?;
        Ok(Self {
            raw: rdns_to_string(&rdns),
            rdns,
        })
    }

    /// Builds a distinguished name from `(attribute, value)` pairs, most specific first.
    #[must_use]
    pub fn from_rdns<A, V>(pairs: impl IntoIterator<Item = (A, V)>) -> Self
    where
        A: Into<String>,
        V: Into<String>,
    {
        let rdns: Vec<Vec<RelativeDistinguishedName>> = pairs
            .into_iter()
            .map(|(attribute, value)| vec![RelativeDistinguishedName::new(attribute, value)])
            .collect();
        Self {
            raw: rdns_to_string(&rdns),
            rdns,
        }
    }

    /// Returns true for the empty (root) distinguished name.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Borrows the canonical distinguished name string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the RDN sets in order (each set represents a `+`-joined group).
    #[must_use]
    pub fn rdns(&self) -> &[Vec<RelativeDistinguishedName>] {
        &self.rdns
    }

    /// Returns an iterator over all relative distinguished names in order.
    pub fn components(&self) -> impl Iterator<Item = &RelativeDistinguishedName> + '_ {
        self.rdns.iter().flat_map(|rdn| rdn.iter())
    }

    /// Looks up the value for the first attribute that matches `attribute` (case-insensitive).
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.components()
            .find(|rdn| rdn.matches_attribute(attribute))
            .map(RelativeDistinguishedName::value)
    }

    /// Returns true if `self` lies at or below `base` in the tree.
    #[must_use]
    pub fn is_descendant_of(&self, base: &DistinguishedName) -> bool {
        if base.rdns.len() > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - base.rdns.len();
        self.normalized()[offset..] == base.normalized()[..]
    }

    /// Appends `suffix`, e.g. a container below the realm base DN.
    #[must_use]
    pub fn join(mut self, suffix: &DistinguishedName) -> Self {
        self.rdns.extend(suffix.rdns.iter().cloned());
        self.raw = rdns_to_string(&self.rdns);
        self
    }

    fn normalized(&self) -> Vec<Vec<(String, String)>> {
        self.rdns
            .iter()
            .map(|rdn| {
                let mut parts: Vec<(String, String)> =
                    rdn.iter().map(RelativeDistinguishedName::normalized).collect();
                parts.sort();
                parts
            })
            .collect()
    }
}

impl PartialEq for DistinguishedName {
    fn eq(&self, other: &Self) -> bool {
        self.rdns.len() == other.rdns.len() && self.normalized() == other.normalized()
    }
}

impl Eq for DistinguishedName {}

impl Hash for DistinguishedName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for DistinguishedName {
    type Err = DistinguishedNameError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<DistinguishedName> for String {
    fn from(value: DistinguishedName) -> Self {
        value.raw
    }
}

impl TryFrom<&str> for DistinguishedName {
    type Error = DistinguishedNameError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<String> for DistinguishedName {
    type Error = DistinguishedNameError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::parse(value)
    }
}

fn normalize_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Single-pass RDN scanner.
#[derive(Default)]
struct Scanner {
    rdns: Vec<Vec<RelativeDistinguishedName>>,
    current: Vec<RelativeDistinguishedName>,
    attribute: String,
    value: Vec<u8>,
    in_value: bool,
    // Length of `value` up to and including its last escaped byte; trailing
    // whitespace before that point is significant.
    protected: usize,
}

impl Scanner {
    fn scan(
        mut self,
        input: &str,
    ) -> std::result::Result<Vec<Vec<RelativeDistinguishedName>>, DistinguishedNameError> {
        let mut chars = input.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\\' if self.in_value => {
                    unescape_into(&mut chars, &mut self.value)?;
                    self.protected = self.value.len();
                }
                '=' if !self.in_value => self.in_value = true,
                ',' | ';' | '+' => {
                    self.finish_pair()?;
                    if ch != '+' {
                        self.rdns.push(std::mem::take(&mut self.current));
                    }
                }
                ' ' if self.in_value && self.value.is_empty() => {}
                _ if self.in_value => {
                    let mut buf = [0; 4];
                    self.value
                        .extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
                _ => self.attribute.push(ch),
            }
        }
        self.finish_pair()?;
        self.rdns.push(self.current);
        Ok(self.rdns)
    }

    fn finish_pair(&mut self) -> std::result::Result<(), DistinguishedNameError> {
        let attribute = std::mem::take(&mut self.attribute).trim().to_string();
        let mut value = std::mem::take(&mut self.value);
        let in_value = std::mem::replace(&mut self.in_value, false);
        let protected = std::mem::replace(&mut self.protected, 0);

        while value.len() > protected && value.last().is_some_and(u8::is_ascii_whitespace) {
            value.pop();
        }
        let value = String::from_utf8(value).map_err(|err| {
            DistinguishedNameError::InvalidComponent(format!("{attribute}: {err}"))
        })?;

        if !in_value {
            return Err(DistinguishedNameError::InvalidComponent(attribute));
        }
        if attribute.is_empty() {
            return Err(DistinguishedNameError::MissingAttribute(format!("={value}")));
        }
        if value.is_empty() {
            return Err(DistinguishedNameError::MissingValue(attribute));
        }
        self.current
            .push(RelativeDistinguishedName::new(attribute, value));
        Ok(())
    }
}

fn unescape_into(
    chars: &mut std::str::Chars<'_>,
    value: &mut Vec<u8>,
) -> std::result::Result<(), DistinguishedNameError> {
    let first = chars.next().ok_or(DistinguishedNameError::UnterminatedEscape)?;
    match first.to_digit(16) {
        Some(high) => {
            let low = chars
                .next()
                .and_then(|ch| ch.to_digit(16))
                .ok_or_else(|| DistinguishedNameError::InvalidComponent(format!("\\{first}")))?;
            // Two hex digits always fit in a byte.
            value.push(u8::try_from(high * 16 + low).unwrap_or_default());
        }
        None => {
            let mut buf = [0; 4];
            value.extend_from_slice(first.encode_utf8(&mut buf).as_bytes());
        }
    }
    Ok(())
}

fn escape_value(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    value
        .chars()
        .enumerate()
        .fold(String::with_capacity(value.len()), |mut out, (idx, ch)| {
            if ch == '\0' {
                out.push_str("\\00");
                return out;
            }
            if matches!(ch, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=')
                || (idx == 0 && matches!(ch, ' ' | '#'))
                || (idx == last && ch == ' ')
            {
                out.push('\\');
            }
            out.push(ch);
            out
        })
}

fn rdns_to_string(rdns: &[Vec<RelativeDistinguishedName>]) -> String {
    let mut out = String::new();
    for (idx, rdn) in rdns.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        for (part, component) in rdn.iter().enumerate() {
            if part > 0 {
                out.push('+');
            }
            out.push_str(component.attribute());
            out.push('=');
            out.push_str(&escape_value(component.value()));
        }
    }
    out
}
