//! Version parsing and ordering for launcher releases.
//!
//! Accepts `MAJOR.MINOR.PATCH` with an optional `-PRERELEASE` label. Anything
//! else is rejected with [`LauncherError::InvalidVersionFormat`]; missing or
//! garbled components are never coerced to zero.

use crate::error::{LauncherError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed launcher version.
///
/// Ordering compares the numeric triple first. For an equal triple a release
/// outranks any pre-release, and two pre-releases compare their labels
/// lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component.
    pub patch: u64,
    /// Pre-release label without the leading `-` (e.g. `beta.2`).
    pub pre: Option<String>,
}

impl Version {
    /// Create a release version with no pre-release label.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre: None,
        }
    }

    /// Parse a strict `MAJOR.MINOR.PATCH[-PRERELEASE]` string.
    ///
    /// Syntax follows SemVer 2.0; build metadata (`+...`) is not accepted.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::InvalidVersionFormat`] when the input does not
    /// match the format.
    pub fn parse(input: &str) -> Result<Self> {
        let parsed = semver::Version::parse(input)
            .map_err(|_| LauncherError::InvalidVersionFormat(input.to_owned()))?;
        if !parsed.build.is_empty() {
            return Err(LauncherError::InvalidVersionFormat(input.to_owned()));
        }
        Ok(Self {
            major: parsed.major,
            minor: parsed.minor,
            patch: parsed.patch,
            pre: (!parsed.pre.is_empty()).then(|| parsed.pre.as_str().to_owned()),
        })
    }

    /// Parse a release tag, tolerating a leading `v` (`v1.4.0`).
    ///
    /// # Errors
    ///
    /// Same as [`Version::parse`] once the prefix is removed.
    pub fn from_tag(tag: &str) -> Result<Self> {
        let trimmed = tag.trim();
        let stripped = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        Self::parse(stripped).map_err(|_| LauncherError::InvalidVersionFormat(tag.to_owned()))
    }

    /// Returns `true` if this version carries a pre-release label.
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }
}

/// Compare two version strings.
///
/// # Errors
///
/// Returns [`LauncherError::InvalidVersionFormat`] naming the first operand
/// that fails to parse.
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    let a = Version::parse(a)?;
    let b = Version::parse(b)?;
    Ok(a.cmp(&b))
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.pre, &other.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for Version {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = LauncherError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.pre {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}
