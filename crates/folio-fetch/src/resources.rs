//! The kinds of resources the site loads from its backend.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::caching::{CacheKey, KeyPattern};

/// A fetchable table of the backend.
///
/// The kind is the first segment of every cache key, so all keys of one kind form a family that
/// can be invalidated at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Profile,
    Writeups,
    Articles,
    Certifications,
}

impl ResourceKind {
    /// Builds the cache key for a resource of this kind with the given filter parameters.
    pub fn cache_key<P>(&self, params: &P) -> Result<CacheKey, serde_json::Error>
    where
        P: Serialize + ?Sized,
    {
        CacheKey::for_params(self, params)
    }

    /// Returns a pattern matching every cache key of this kind.
    ///
    /// Used after a mutation, e.g. editing a writeup invalidates `writeups:*`.
    pub fn family(&self) -> KeyPattern {
        KeyPattern::prefix(format!("{self}:"))
    }
}

impl AsRef<str> for ResourceKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Profile => "profile",
            Self::Writeups => "writeups",
            Self::Articles => "articles",
            Self::Certifications => "certifications",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
