use crate::InstanceId;
use std::{collections::BTreeSet, fmt, str::FromStr};

/// The reserved instance name that fences every instance of a cluster.
pub const WILDCARD: &str = "*";

/// The declared set of fenced instances.
///
/// Serialized as a JSON array of instance names. The single-element array
/// `["*"]` means [`FencingSet::All`]; an absent, blank or empty declaration
/// means no instance is fenced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FencingSet {
    Explicit(BTreeSet<InstanceId>),
    All,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("fenced instances must be a JSON array of strings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("the wildcard \"*\" cannot be combined with instance names")]
    MixedWildcard,

    #[error("instance names must not be empty")]
    EmptyName,
}

// === impl FencingSet ===

impl Default for FencingSet {
    fn default() -> Self {
        Self::Explicit(BTreeSet::new())
    }
}

impl FencingSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn instances<I>(names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<InstanceId>,
    {
        Self::Explicit(names.into_iter().map(Into::into).collect())
    }

    /// True when no instance is fenced.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Explicit(names) if names.is_empty())
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        match self {
            Self::All => true,
            Self::Explicit(names) => names.contains(id),
        }
    }

    /// Parses the value of the declaration key. `None` means the key is absent.
    pub fn from_annotation(value: Option<&str>) -> Result<Self, ParseError> {
        let value = match value.map(str::trim) {
            None | Some("") => return Ok(Self::none()),
            Some(value) => value,
        };

        let names = serde_json::from_str::<Vec<String>>(value)?;
        if names.iter().any(|n| n == WILDCARD) {
            if names.len() != 1 {
                return Err(ParseError::MixedWildcard);
            }
            return Ok(Self::All);
        }
        if names.iter().any(|n| n.is_empty()) {
            return Err(ParseError::EmptyName);
        }

        Ok(Self::instances(names))
    }

    /// Serializes the set as the value of the declaration key, or `None` when
    /// the key should be removed.
    pub fn to_annotation(&self) -> Option<String> {
        match self {
            Self::All => Some(serde_json::Value::from(vec![WILDCARD]).to_string()),
            Self::Explicit(names) if names.is_empty() => None,
            Self::Explicit(names) => {
                let names = names.iter().map(InstanceId::as_str).collect::<Vec<_>>();
                Some(serde_json::Value::from(names).to_string())
            }
        }
    }

    /// Resolves the set against the live inventory, yielding the instances
    /// that are effectively fenced right now.
    ///
    /// `All` is resolved on every call, so instances that join the cluster
    /// after the declaration are fenced as well. Declared names that are not
    /// live are ignored.
    pub fn resolve<'a>(&self, live: impl IntoIterator<Item = &'a InstanceId>) -> BTreeSet<InstanceId> {
        live.into_iter()
            .filter(|id| self.contains(id))
            .cloned()
            .collect()
    }
}

impl FromStr for FencingSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_annotation(Some(s))
    }
}

impl fmt::Display for FencingSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_annotation() {
            Some(value) => f.write_str(&value),
            None => f.write_str("[]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_and_empty_are_equivalent() {
        for value in [None, Some(""), Some("  "), Some("[]")] {
            let set = FencingSet::from_annotation(value).expect("must parse");
            assert!(set.is_empty(), "{value:?}");
            assert_eq!(set.to_annotation(), None);
        }
    }

    #[test]
    fn wildcard() {
        let set = FencingSet::from_annotation(Some(r#"["*"]"#)).unwrap();
        assert_eq!(set, FencingSet::All);
        assert_eq!(set.to_annotation().as_deref(), Some(r#"["*"]"#));

        assert!(matches!(
            FencingSet::from_annotation(Some(r#"["*", "pg-1"]"#)),
            Err(ParseError::MixedWildcard)
        ));
    }

    #[test]
    fn explicit_serializes_sorted_without_duplicates() {
        let set: FencingSet = r#"["pg-3", "pg-1", "pg-3"]"#.parse().unwrap();
        assert_eq!(set, FencingSet::instances(["pg-1", "pg-3"]));
        assert_eq!(set.to_annotation().as_deref(), Some(r#"["pg-1","pg-3"]"#));
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(matches!(
            FencingSet::from_annotation(Some("pg-1")),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            FencingSet::from_annotation(Some(r#"{"pg-1": true}"#)),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            FencingSet::from_annotation(Some(r#"[""]"#)),
            Err(ParseError::EmptyName)
        ));
    }

    #[test]
    fn resolves_against_live_instances() {
        let live = ["pg-1", "pg-2", "pg-3"].map(InstanceId::from);

        let explicit = FencingSet::instances(["pg-2", "pg-9"]);
        assert_eq!(
            explicit.resolve(&live),
            [InstanceId::from("pg-2")].into_iter().collect()
        );

        assert_eq!(
            FencingSet::All.resolve(&live),
            live.iter().cloned().collect()
        );
        assert!(FencingSet::none().resolve(&live).is_empty());
    }
}
