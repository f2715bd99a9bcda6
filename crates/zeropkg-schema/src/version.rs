//! Comparable version tokens and dependency version constraints.
//!
//! Ports versions are free-form (`1.3.1`, `2.38-r2`, `9.4p1`). They compare
//! segment by segment: numeric runs numerically, alphabetic runs lexically,
//! and a numeric run sorts above an alphabetic one.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("version must not be empty")]
    Empty,
    #[error("invalid version constraint '{0}'")]
    InvalidConstraint(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Num(u64),
    Alpha(String),
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Segment::Num(a), Segment::Num(b)) => a.cmp(b),
            (Segment::Alpha(a), Segment::Alpha(b)) => a.cmp(b),
            (Segment::Num(_), Segment::Alpha(_)) => Ordering::Greater,
            (Segment::Alpha(_), Segment::Num(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A parsed package version. Keeps the original text for display.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    segments: Vec<Segment>,
}

impl Version {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(VersionError::Empty);
        }
        let mut segments = Vec::new();
        for part in raw.split(['.', '-', '_', '+']) {
            let mut chars = part.chars().peekable();
            while let Some(&c) = chars.peek() {
                let numeric = c.is_ascii_digit();
                let mut run = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() != numeric {
                        break;
                    }
                    run.push(c);
                    chars.next();
                }
                if numeric {
                    // Absurdly long digit runs saturate instead of failing.
                    segments.push(Segment::Num(run.parse().unwrap_or(u64::MAX)));
                } else {
                    segments.push(Segment::Alpha(run));
                }
            }
        }
        Ok(Self {
            raw: raw.to_owned(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn major(&self) -> Option<&Segment> {
        self.segments.first()
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            // Missing trailing segments count as zero: 1.2 == 1.2.0
            let zero = Segment::Num(0);
            let a = self.segments.get(i).unwrap_or(&zero);
            let b = other.segments.get(i).unwrap_or(&zero);
            match a.cmp(b) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    Eq,
    Ge,
    Le,
    Gt,
    Lt,
    /// Same major segment and at least the given version.
    Compatible,
}

impl ConstraintOp {
    fn symbol(self) -> &'static str {
        match self {
            ConstraintOp::Eq => "==",
            ConstraintOp::Ge => ">=",
            ConstraintOp::Le => "<=",
            ConstraintOp::Gt => ">",
            ConstraintOp::Lt => "<",
            ConstraintOp::Compatible => "~=",
        }
    }
}

// Two-character operators must be tried before their one-character prefixes.
const OPERATORS: [(&str, ConstraintOp); 6] = [
    (">=", ConstraintOp::Ge),
    ("<=", ConstraintOp::Le),
    ("==", ConstraintOp::Eq),
    ("~=", ConstraintOp::Compatible),
    (">", ConstraintOp::Gt),
    ("<", ConstraintOp::Lt),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    pub op: ConstraintOp,
    pub version: Version,
}

impl VersionConstraint {
    /// Parse `">=2.38"`, `"== 1.0"` or a bare `"1.0"` (treated as `==`).
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let s = input.trim();
        for (sym, op) in OPERATORS {
            if let Some(rest) = s.strip_prefix(sym) {
                let version = Version::parse(rest)
                    .map_err(|_| VersionError::InvalidConstraint(input.to_owned()))?;
                return Ok(Self { op, version });
            }
        }
        if s.starts_with(['=', '!', '~', '^']) {
            return Err(VersionError::InvalidConstraint(input.to_owned()));
        }
        let version =
            Version::parse(s).map_err(|_| VersionError::InvalidConstraint(input.to_owned()))?;
        Ok(Self {
            op: ConstraintOp::Eq,
            version,
        })
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            ConstraintOp::Eq => candidate == &self.version,
            ConstraintOp::Ge => candidate >= &self.version,
            ConstraintOp::Le => candidate <= &self.version,
            ConstraintOp::Gt => candidate > &self.version,
            ConstraintOp::Lt => candidate < &self.version,
            ConstraintOp::Compatible => {
                candidate.major() == self.version.major() && candidate >= &self.version
            }
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VersionConstraint::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Split an inline dependency like `"glibc>=2.38"` into name and constraint.
pub fn split_dependency_spec(
    spec: &str,
) -> Result<(String, Option<VersionConstraint>), VersionError> {
    let spec = spec.trim();
    match spec.find(['>', '<', '=', '~']) {
        Some(idx) => {
            let name = spec[..idx].trim();
            if name.is_empty() {
                return Err(VersionError::InvalidConstraint(spec.to_owned()));
            }
            let constraint = VersionConstraint::parse(&spec[idx..])?;
            Ok((name.to_owned(), Some(constraint)))
        }
        None => Ok((spec.to_owned(), None)),
    }
}
