use serde::{Deserialize, Serialize};

/// A named allow-list: a resource matches when its field equals any value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses the CLI form `name=v1,v2`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (name, values) = spec.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let values = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        Some(Self {
            name: name.to_string(),
            values,
        })
    }

    pub fn accepts(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    pub fn accepts_opt(&self, value: Option<&str>) -> bool {
        value.is_some_and(|v| self.accepts(v))
    }

    /// Key of a `tag:<key>` filter.
    pub fn tag_key(&self) -> Option<&str> {
        self.name.strip_prefix("tag:")
    }
}

/// Filters are ANDed; values inside one filter are ORed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRequest {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl FilterRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ids<I, V>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn filter<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.filters.push(Filter::new(name, values));
        self
    }
}
