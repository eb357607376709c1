//! LDAP filter construction (RFC 4515).

/// Filter matching every entry.
pub const MATCH_EVERYTHING: &str = "(objectClass=*)";

/// How several filter terms are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchRule {
    /// Every term must match (`&`).
    All,
    /// Any term may match (`|`).
    #[default]
    Any,
    /// No term may match (`!`).
    None,
}

impl MatchRule {
    const fn operator(self) -> char {
        match self {
            Self::All => '&',
            Self::Any => '|',
            Self::None => '!',
        }
    }
}

/// Keyword-style search criteria: attribute names with the values to match.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Criteria {
    pairs: Vec<(String, Vec<String>)>,
}

impl Criteria {
    /// Create a new, empty set of criteria.
    #[must_use]
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Match `attribute` against one value.
    pub fn push(&mut self, attribute: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((attribute.into(), vec![value.into()]));
    }

    /// Match `attribute` against any of several values.
    pub fn push_values<I, V>(&mut self, attribute: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.pairs
            .push((attribute.into(), values.into_iter().map(Into::into).collect()));
    }

    /// Match `attribute` when the value is present.
    pub fn push_opt<T>(&mut self, attribute: impl Into<String>, value: Option<T>)
    where
        T: Into<String>,
    {
        if let Some(value) = value {
            self.push(attribute, value);
        }
    }

    /// Builder-style [`Criteria::push`].
    #[must_use]
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(attribute, value);
        self
    }

    /// Returns true if no criteria have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterates over `(attribute, values)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> + '_ {
        self.pairs
            .iter()
            .map(|(attribute, values)| (attribute.as_str(), values.as_slice()))
    }
}

/// Escapes a value for use inside a filter.
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Combines filters with `rule`. Empty filters are skipped and bare terms get parenthesised;
/// a single filter is returned unwrapped.
#[must_use]
pub fn combine_filters<S: AsRef<str>>(filters: &[S], rule: MatchRule) -> String {
    let filters: Vec<&str> = filters
        .iter()
        .map(AsRef::as_ref)
        .filter(|f| !f.is_empty())
        .collect();
    if filters.is_empty() {
        return String::new();
    }
    if rule == MatchRule::None {
        return format!("(!{})", combine_filters(&filters, MatchRule::Any));
    }

    let mut combined = String::new();
    if filters.len() > 1 {
        combined.push('(');
        combined.push(rule.operator());
    }
    for filter in &filters {
        if filter.starts_with('(') {
            combined.push_str(filter);
        } else {
            combined.push('(');
            combined.push_str(filter);
            combined.push(')');
        }
    }
    if filters.len() > 1 {
        combined.push(')');
    }
    combined
}

/// Builds a filter matching `attribute` against `values`, combined with `rule`.
///
/// Non-exact matching wraps every value in wildcards (`(cn=*admin*)`).
#[must_use]
pub fn make_filter_from_attr<S: AsRef<str>>(
    attribute: &str,
    values: &[S],
    rule: MatchRule,
    exact: bool,
) -> String {
    let terms: Vec<String> = values
        .iter()
        .map(|value| {
            let value = escape_filter_value(value.as_ref());
            if exact {
                format!("({attribute}={value})")
            } else {
                format!("({attribute}=*{value}*)")
            }
        })
        .collect();
    combine_filters(&terms, rule)
}

/// Builds a filter from keyword criteria; no criteria matches everything.
#[must_use]
pub fn make_filter(criteria: &Criteria, rule: MatchRule, exact: bool) -> String {
    if criteria.is_empty() {
        return MATCH_EVERYTHING.to_string();
    }
    // Values of one attribute are alternatives; negation applies to the whole term list.
    let value_rule = match rule {
        MatchRule::None => MatchRule::Any,
        other => other,
    };
    let terms: Vec<String> = criteria
        .iter()
        .map(|(attribute, values)| make_filter_from_attr(attribute, values, value_rule, exact))
        .collect();
    combine_filters(&terms, rule)
}
