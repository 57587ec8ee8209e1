use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Identifies the cached representation of a resource.
///
/// The key is formed from the resource kind and its effective parameters, separated by a `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a key out of a resource kind and already formatted parameters.
    pub fn new(kind: impl AsRef<str>, params: impl fmt::Display) -> Self {
        Self(format!("{}:{params}", kind.as_ref()).into())
    }

    /// Creates a key out of a resource kind and serializable parameters.
    ///
    /// The parameters go through a [`serde_json::Value`], which keeps object keys sorted. Struct
    /// fields and map entries therefore end up in the same order regardless of how they were
    /// declared or inserted.
    pub fn for_params<P>(kind: impl AsRef<str>, params: &P) -> Result<Self, serde_json::Error>
    where
        P: Serialize + ?Sized,
    {
        let params = serde_json::to_value(params)?;
        Ok(Self::new(kind, params))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the resource kind, which is everything before the first `:`.
    pub fn kind(&self) -> &str {
        let key: &str = &self.0;
        key.split_once(':').map_or(key, |(kind, _)| kind)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

/// Selects a family of cache keys, used for bulk invalidation.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// Matches all keys starting with the given string.
    Prefix(String),
    /// Matches all keys the regular expression finds a match in.
    ///
    /// Anchor the expression with `^` to match on key prefixes.
    Regex(regex::Regex),
    /// Matches keys against a shell-style glob, like `writeups:*`.
    Glob(glob::Pattern),
}

impl KeyPattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        regex::Regex::new(pattern).map(Self::Regex)
    }

    pub fn glob(pattern: &str) -> Result<Self, glob::PatternError> {
        glob::Pattern::new(pattern).map(Self::Glob)
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Self::Regex(regex) => regex.is_match(key),
            Self::Glob(pattern) => pattern.matches(key),
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::Regex(regex) => write!(f, "/{}/", regex.as_str()),
            Self::Glob(pattern) => f.write_str(pattern.as_str()),
        }
    }
}
