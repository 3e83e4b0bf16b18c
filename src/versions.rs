//! Version interval sets parsed from the `X-Fns-Request-Version` header.
//!
//! A caller pins the endpoint versions it can talk to with a comma separated
//! list of `name=low:high` pairs, where `low` is inclusive and `high` is
//! exclusive. Either bound may be left empty, and an endpoint that is not
//! listed matches any version. Intervals are parsed once at header ingress
//! and passed by value to registry lookups.
//!
//! # Examples
//!
//! ```rust
//! use fns::versions::RequestVersions;
//! use semver::Version;
//!
//! let versions = RequestVersions::parse("users=v1.0.0:v2.0.0, tokens=v0.1.0:").unwrap();
//! assert!(versions.accept("users", &Version::new(1, 3, 0)));
//! assert!(!versions.accept("users", &Version::new(2, 0, 0)));
//! assert!(versions.accept("unlisted", &Version::new(9, 9, 9)));
//! ```

use std::fmt;

use semver::Version;
use smallvec::SmallVec;
use thiserror::Error;

/// Endpoint name carrying the default interval applied to unlisted names.
const DEFAULT_NAME: &str = "*";

/// Failure while parsing an interval set from its header form.
#[derive(Debug, Error)]
pub enum VersionParseError {
    #[error("interval pair {0:?} is not of the form name=low:high")]
    MalformedPair(String),
    #[error("version {0:?} is not a semantic version")]
    MalformedVersion(String),
}

/// A half-open semantic version range: `low` inclusive, `high` exclusive.
///
/// A missing bound leaves that side of the range open.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Interval {
    pub low: Option<Version>,
    pub high: Option<Version>,
}

impl Interval {
    /// Returns true when `version` falls inside the range.
    pub fn accept(&self, version: &Version) -> bool {
        if let Some(low) = &self.low {
            if version < low {
                return false;
            }
        }
        if let Some(high) = &self.high {
            if version >= high {
                return false;
            }
        }
        true
    }

    fn parse(text: &str) -> Result<Self, VersionParseError> {
        let (low, high) = match text.split_once(':') {
            Some((low, high)) => (low.trim(), high.trim()),
            // A bare version means "at least this".
            None => (text.trim(), ""),
        };
        Ok(Self {
            low: parse_bound(low)?,
            high: parse_bound(high)?,
        })
    }
}

fn parse_bound(text: &str) -> Result<Option<Version>, VersionParseError> {
    if text.is_empty() {
        return Ok(None);
    }
    let trimmed = text.strip_prefix('v').unwrap_or(text);
    Version::parse(trimmed)
        .map(Some)
        .map_err(|_| VersionParseError::MalformedVersion(text.to_string()))
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(low) = &self.low {
            write!(f, "v{low}")?;
        }
        write!(f, ":")?;
        if let Some(high) = &self.high {
            write!(f, "v{high}")?;
        }
        Ok(())
    }
}

/// An ordered set of per-endpoint version intervals.
///
/// The set is cheap to clone; most requests carry at most a handful of
/// entries, stored inline. Entries are kept sorted by name so two sets with
/// the same content have the same canonical header form, which also makes
/// the canonical form usable as fingerprint input.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestVersions {
    entries: SmallVec<[(String, Interval); 4]>,
}

impl RequestVersions {
    /// An empty set, accepting every version of every endpoint.
    pub fn none() -> Self {
        Self::default()
    }

    /// Parses the header form `name=low:high, name2=low2:high2`.
    ///
    /// The name `*` sets the default interval applied to unlisted endpoints.
    pub fn parse(header: &str) -> Result<Self, VersionParseError> {
        let mut set = Self::default();
        for pair in header.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, interval) = pair
                .split_once('=')
                .ok_or_else(|| VersionParseError::MalformedPair(pair.to_string()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(VersionParseError::MalformedPair(pair.to_string()));
            }
            set.insert(name, Interval::parse(interval)?);
        }
        Ok(set)
    }

    /// Adds or replaces the interval for `name`.
    pub fn insert(&mut self, name: &str, interval: Interval) {
        match self.entries.binary_search_by(|(n, _)| n.as_str().cmp(name)) {
            Ok(at) => self.entries[at].1 = interval,
            Err(at) => self.entries.insert(at, (name.to_string(), interval)),
        }
    }

    /// True when the set carries no intervals at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The interval registered for `name`, ignoring the default.
    pub fn get(&self, name: &str) -> Option<&Interval> {
        self.entries
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|at| &self.entries[at].1)
    }

    /// Returns true when the interval for `name`, or the default interval,
    /// contains `version`. Names with no interval accept everything.
    pub fn accept(&self, name: &str, version: &Version) -> bool {
        match self.get(name).or_else(|| self.get(DEFAULT_NAME)) {
            Some(interval) => interval.accept(version),
            None => true,
        }
    }
}

impl fmt::Display for RequestVersions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, interval)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={interval}")?;
        }
        Ok(())
    }
}
