//! Directory entry representation.

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

use crate::dn::DistinguishedName;
use crate::session::DirectoryModification;

/// Insertion-ordered attribute map with case-insensitive keys.
///
/// Attributes are keyed by their lowercase name; the spelling seen first is kept for display.
/// Every attribute holds a list of values, scalars are stored as one-element lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMap<V> {
    attributes: Vec<Attribute<V>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute<V> {
    key: String,
    name: String,
    values: Vec<V>,
}

impl<V> Default for AttributeMap<V> {
    fn default() -> Self {
        Self {
            attributes: Vec::new(),
        }
    }
}

impl<V> AttributeMap<V> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|attribute| attribute.key.eq_ignore_ascii_case(name))
    }

    /// Returns the values of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[V]> {
        self.position(name)
            .map(|idx| self.attributes[idx].values.as_slice())
    }

    /// Returns a mutable handle to the values of `name`.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Vec<V>> {
        self.position(name)
            .map(move |idx| &mut self.attributes[idx].values)
    }

    /// Returns true if the attribute is present (possibly with no values).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replaces the values of `name`, keeping its position if it already exists.
    pub fn insert(&mut self, name: &str, values: Vec<V>) {
        match self.position(name) {
            Some(idx) => self.attributes[idx].values = values,
            None => self.attributes.push(Attribute {
                key: name.to_ascii_lowercase(),
                name: name.to_string(),
                values,
            }),
        }
    }

    /// Removes `name`, returning its values. Removing a missing attribute is a no-op.
    pub fn remove(&mut self, name: &str) -> Option<Vec<V>> {
        self.position(name)
            .map(|idx| self.attributes.remove(idx).values)
    }

    /// Iterates over `(display name, values)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[V])> + '_ {
        self.attributes
            .iter()
            .map(|attribute| (attribute.name.as_str(), attribute.values.as_slice()))
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Returns true if no attribute is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

impl<V: Serialize> Serialize for AttributeMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.attributes.len()))?;
        for attribute in &self.attributes {
            map.serialize_entry(&attribute.name, &attribute.values)?;
        }
        map.end()
    }
}

/// Conversion into a list of textual attribute values.
///
/// Implemented for scalars and sequences so that `entry.set("cn", "admins")` and
/// `entry.set("cn", vec!["admins"])` are equivalent.
pub trait IntoValues {
    /// Converts `self` into attribute values.
    fn into_values(self) -> Vec<String>;
}

impl IntoValues for String {
    fn into_values(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoValues for &str {
    fn into_values(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoValues for &String {
    fn into_values(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoValues for &DistinguishedName {
    fn into_values(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoValues for Vec<String> {
    fn into_values(self) -> Vec<String> {
        self
    }
}

impl IntoValues for Vec<&str> {
    fn into_values(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoValues for &[String] {
    fn into_values(self) -> Vec<String> {
        self.to_vec()
    }
}

impl<const N: usize> IntoValues for [&str; N] {
    fn into_values(self) -> Vec<String> {
        self.iter().map(|value| (*value).to_string()).collect()
    }
}

impl IntoValues for Vec<DistinguishedName> {
    fn into_values(self) -> Vec<String> {
        self.into_iter().map(String::from).collect()
    }
}

/// A directory entry: a DN plus ordered, multi-valued attributes.
///
/// Entries read from the directory remember the values they were read with, so that
/// [`Entry::modifications`] only touches attributes that changed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    dn: DistinguishedName,
    attrs: AttributeMap<String>,
    bin_attrs: AttributeMap<Vec<u8>>,
    original: Option<AttributeMap<String>>,
}

impl Entry {
    /// Creates an empty, not yet persisted entry.
    #[must_use]
    pub fn new(dn: DistinguishedName) -> Self {
        Self {
            dn,
            ..Self::default()
        }
    }

    /// Builder-style attribute setter.
    #[must_use]
    pub fn with(mut self, name: &str, values: impl IntoValues) -> Self {
        self.set(name, values);
        self
    }

    pub(crate) fn from_search(
        dn: DistinguishedName,
        attrs: AttributeMap<String>,
        bin_attrs: AttributeMap<Vec<u8>>,
    ) -> Self {
        Self {
            dn,
            original: Some(attrs.clone()),
            attrs,
            bin_attrs,
        }
    }

    /// Distinguished name of the entry.
    #[must_use]
    pub fn dn(&self) -> &DistinguishedName {
        &self.dn
    }

    /// Textual values of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.attrs.get(name)
    }

    /// Textual values of `name`, empty when absent.
    #[must_use]
    pub fn values(&self, name: &str) -> &[String] {
        self.attrs.get(name).unwrap_or_default()
    }

    /// First textual value of `name`.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.attrs
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Binary values of `name`.
    #[must_use]
    pub fn get_binary(&self, name: &str) -> Option<&[Vec<u8>]> {
        self.bin_attrs.get(name)
    }

    /// Returns true if `name` is present as a textual or binary attribute.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains(name) || self.bin_attrs.contains(name)
    }

    /// Sets `name` to `values`.
    pub fn set(&mut self, name: &str, values: impl IntoValues) {
        self.attrs.insert(name, values.into_values());
    }

    /// Sets binary values of `name`.
    pub fn set_binary(&mut self, name: &str, values: Vec<Vec<u8>>) {
        self.bin_attrs.insert(name, values);
    }

    /// Appends one value to `name`, creating the attribute if needed.
    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        match self.attrs.get_mut(name) {
            Some(values) => values.push(value.into()),
            None => self.attrs.insert(name, vec![value.into()]),
        }
    }

    /// Removes `name`. Removing a missing attribute is a no-op.
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.attrs.remove(name)
    }

    /// Textual attributes in order.
    #[must_use]
    pub fn attributes(&self) -> &AttributeMap<String> {
        &self.attrs
    }

    /// Binary attributes in order.
    #[must_use]
    pub fn binary_attributes(&self) -> &AttributeMap<Vec<u8>> {
        &self.bin_attrs
    }

    /// Returns true if this entry was read from the directory.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.original.is_some()
    }

    /// Computes the modify list that brings the directory copy in line with this entry.
    ///
    /// Entries read from the directory produce `Replace` for changed attributes and `Delete`
    /// for removed or emptied ones; fresh entries replace every attribute they carry.
    #[must_use]
    pub fn modifications(&self) -> Vec<DirectoryModification> {
        let Some(original) = &self.original else {
            return self
                .attrs
                .iter()
                .map(|(name, values)| DirectoryModification::Replace {
                    attribute: name.to_string(),
                    values: values.to_vec(),
                })
                .collect();
        };

        let mut mods = Vec::new();
        for (name, values) in self.attrs.iter() {
            match original.get(name) {
                Some(old) if old == values => {}
                Some(_) if values.is_empty() => mods.push(DirectoryModification::Delete {
                    attribute: name.to_string(),
                    values: Vec::new(),
                }),
                None if values.is_empty() => {}
                _ => mods.push(DirectoryModification::Replace {
                    attribute: name.to_string(),
                    values: values.to_vec(),
                }),
            }
        }
        for (name, _) in original.iter() {
            if !self.attrs.contains(name) {
                mods.push(DirectoryModification::Delete {
                    attribute: name.to_string(),
                    values: Vec::new(),
                });
            }
        }
        mods
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.original = Some(self.attrs.clone());
    }
}

impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = if self.bin_attrs.is_empty() { 2 } else { 3 };
        let mut state = serializer.serialize_struct("Entry", fields)?;
        state.serialize_field("dn", self.dn.as_str())?;
        state.serialize_field("attributes", &self.attrs)?;
        if !self.bin_attrs.is_empty() {
            state.serialize_field("binary_attributes", &self.bin_attrs)?;
        }
        state.end()
    }
}
