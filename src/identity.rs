//! Package identities
//!
//! An identity is the three-part name `namespace.name@revision`. The
//! `local` namespace is project-private; everything else is remote.
//! Revisions are opaque strings with no ordering.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The reserved namespace for project-private specs.
pub const LOCAL_NAMESPACE: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    namespace: String,
    name: String,
    revision: String,
}

impl Identity {
    pub fn new(namespace: &str, name: &str, revision: &str) -> Result<Self> {
        for (label, part) in [
            ("namespace", namespace),
            ("name", name),
            ("revision", revision),
        ] {
            if part.is_empty() {
                return Err(Error::Identity(format!("identity has an empty {}", label)));
            }
            if part.contains(['.', '@', '/', '\\']) && label != "revision" {
                return Err(Error::Identity(format!(
                    "identity {} '{}' contains a reserved character",
                    label, part
                )));
            }
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            revision: revision.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn is_local(&self) -> bool {
        self.namespace == LOCAL_NAMESPACE
    }

    /// Whether `query` designates this identity under fuzzy matching.
    ///
    /// A query matches when it equals the full identity or one of the
    /// shortened forms `name`, `name@revision`, or `namespace.name`.
    /// Matching is case-sensitive.
    pub fn matches_query(&self, query: &str) -> bool {
        if query == self.to_string() {
            return true;
        }
        query == self.name
            || query == format!("{}@{}", self.name, self.revision)
            || query == format!("{}.{}", self.namespace, self.name)
    }
}

impl FromStr for Identity {
    type Err = Error;

    /// Parse `namespace.name@revision`.
    fn from_str(s: &str) -> Result<Self> {
        let (head, revision) = s.split_once('@').ok_or_else(|| {
            Error::Identity(format!(
                "identity '{}' is missing '@revision' (expected namespace.name@revision)",
                s
            ))
        })?;
        let (namespace, name) = head.split_once('.').ok_or_else(|| {
            Error::Identity(format!(
                "identity '{}' is missing a namespace (expected namespace.name@revision)",
                s
            ))
        })?;
        Identity::new(namespace, name, revision)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.namespace, self.name, self.revision)
    }
}

impl TryFrom<String> for Identity {
    type Error = Error;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> String {
        id.to_string()
    }
}

/// Match `query` against a set of candidate identities.
///
/// Returns the single match, `Ok(None)` when nothing matches, and an
/// ambiguity error listing every candidate when more than one matches.
pub fn match_one<'a, I>(query: &str, candidates: I) -> Result<Option<&'a Identity>>
where
    I: IntoIterator<Item = &'a Identity>,
{
    let matches: Vec<&Identity> = candidates
        .into_iter()
        .filter(|id| id.matches_query(query))
        .collect();
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0])),
        _ => {
            let listed: Vec<String> = matches.iter().map(|id| id.to_string()).collect();
            Err(Error::Resolution(format!(
                "query '{}' is ambiguous; candidates: {}",
                query,
                listed.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_roundtrip() {
        let identity = id("remote.ninja@v1.13");
        assert_eq!(identity.namespace(), "remote");
        assert_eq!(identity.name(), "ninja");
        assert_eq!(identity.revision(), "v1.13");
        assert_eq!(identity.to_string(), "remote.ninja@v1.13");
    }

    #[test]
    fn test_parse_missing_revision_fails() {
        assert!("local.tool".parse::<Identity>().is_err());
    }

    #[test]
    fn test_parse_missing_namespace_fails() {
        assert!("tool@v1".parse::<Identity>().is_err());
    }

    #[test]
    fn test_revision_may_contain_dots() {
        let identity = id("acme.gcc@13.2.0");
        assert_eq!(identity.revision(), "13.2.0");
    }

    #[test]
    fn test_local_detection() {
        assert!(id("local.tool@v1").is_local());
        assert!(!id("acme.tool@v1").is_local());
    }

    #[test]
    fn test_fuzzy_match_forms() {
        let identity = id("acme.toolchain@v2");
        for query in [
            "acme.toolchain@v2",
            "toolchain@v2",
            "toolchain",
            "acme.toolchain",
        ] {
            assert!(identity.matches_query(query), "query {} should match", query);
        }
        assert!(!identity.matches_query("chain"));
        assert!(!identity.matches_query("toolchain@v3"));
        assert!(!identity.matches_query("Toolchain"));
    }

    #[test]
    fn test_match_one_unique() {
        let pool = vec![id("acme.gcc@v1"), id("acme.ninja@v1")];
        let found = match_one("ninja", &pool).unwrap();
        assert_eq!(found.unwrap().name(), "ninja");
    }

    #[test]
    fn test_match_one_none() {
        let pool = vec![id("acme.gcc@v1")];
        assert!(match_one("clang", &pool).unwrap().is_none());
    }

    #[test]
    fn test_match_one_ambiguous_lists_all() {
        let pool = vec![id("local.dupe@v1"), id("local.dupe@v2")];
        let err = match_one("dupe", &pool).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ambiguous"));
        assert!(msg.contains("local.dupe@v1"));
        assert!(msg.contains("local.dupe@v2"));
    }
}
