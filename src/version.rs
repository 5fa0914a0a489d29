//! Versions, version constraints and package specs.
//!
//! Formula versions follow Homebrew conventions rather than semver: they may
//! have any number of components (`2024.01.02`), bottle revisions (`3.2.1_1`)
//! and alphabetic pre-release markers (`1.0rc1`). [`Version`] compares them
//! token by token:
//!
//! - numeric runs compare numerically, and a missing numeric run counts as 0
//!   (`1.0` == `1.0.0`)
//! - alphabetic runs are pre-release markers: they sort below any number and
//!   below the end of the version (`1.0rc1` < `1.0` < `1.0.1`)
//!
//! # Spec syntax
//!
//! ```text
//! wget                      any version
//! openssl@3                 '@' is part of the name, never a constraint
//! node:latest               only the newest known version
//! python@3.12==3.12.4       exact
//! curl>=8.0,<9              range (every comparator must hold)
//! ffmpeg[with-x265]>=6      variant flags in brackets
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing versions, constraints or specs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("Invalid version: '{0}'")]
    InvalidVersion(String),

    #[error("Invalid version constraint: '{0}'")]
    InvalidConstraint(String),

    #[error("Invalid package spec: '{0}'")]
    InvalidSpec(String),
}

#[derive(Debug, Clone, Hash)]
enum Token {
    Num(u64),
    Alpha(String),
}

fn cmp_tokens(a: &Token, b: &Token) -> Ordering {
    match (a, b) {
        (Token::Num(x), Token::Num(y)) => x.cmp(y),
        (Token::Alpha(x), Token::Alpha(y)) => x.cmp(y),
        (Token::Num(_), Token::Alpha(_)) => Ordering::Greater,
        (Token::Alpha(_), Token::Num(_)) => Ordering::Less,
    }
}

/// How a trailing token compares against "no more tokens"
fn cmp_to_end(token: &Token) -> Ordering {
    match token {
        Token::Num(0) => Ordering::Equal,
        Token::Num(_) => Ordering::Greater,
        Token::Alpha(_) => Ordering::Less,
    }
}

/// A parsed formula version. Keeps the original spelling for display.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    raw: String,
    tokens: Vec<Token>,
}

impl Version {
    pub fn parse(raw: &str) -> Result<Self, SpecError> {
        let raw = raw.trim();
        let mut tokens = Vec::new();
        let mut current = String::new();

        let flush = |current: &mut String, tokens: &mut Vec<Token>| {
            if current.is_empty() {
                return;
            }
            let token = if current.chars().all(|c| c.is_ascii_digit()) {
                Token::Num(current.parse().unwrap_or(u64::MAX))
            } else {
                Token::Alpha(current.to_ascii_lowercase())
            };
            tokens.push(token);
            current.clear();
        };

        for c in raw.chars() {
            if c.is_ascii_alphanumeric() {
                // Switching between digits and letters starts a new token
                let kind_changed = current
                    .chars()
                    .last()
                    .is_some_and(|last| last.is_ascii_digit() != c.is_ascii_digit());
                if kind_changed {
                    flush(&mut current, &mut tokens);
                }
                current.push(c);
            } else if matches!(c, '.' | '-' | '_' | '+') {
                flush(&mut current, &mut tokens);
            } else {
                return Err(SpecError::InvalidVersion(raw.to_string()));
            }
        }
        flush(&mut current, &mut tokens);

        if tokens.is_empty() {
            return Err(SpecError::InvalidVersion(raw.to_string()));
        }

        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.tokens.len().max(other.tokens.len());
        for i in 0..len {
            let ord = match (self.tokens.get(i), other.tokens.get(i)) {
                (Some(a), Some(b)) => cmp_tokens(a, b),
                (Some(a), None) => cmp_to_end(a),
                (None, Some(b)) => cmp_to_end(b).reverse(),
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
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

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Trailing zeros compare equal to nothing, so they must not hash
        let significant = self
            .tokens
            .iter()
            .rposition(|t| !matches!(t, Token::Num(0)))
            .map_or(0, |last| last + 1);
        self.tokens[..significant].hash(state);
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.raw)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
        }
    }
}

/// A single `op version` clause of a range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparator {
    pub op: Op,
    pub version: Version,
}

impl Comparator {
    pub fn matches(&self, version: &Version) -> bool {
        let ord = version.cmp(&self.version);
        match self.op {
            Op::Eq => ord == Ordering::Equal,
            Op::Ne => ord != Ordering::Equal,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
        }
    }

    fn parse(clause: &str) -> Result<Self, SpecError> {
        let clause = clause.trim();
        // Longest operators first so ">=" is not read as ">"
        const OPS: &[(&str, Op)] = &[
            (">=", Op::Ge),
            ("<=", Op::Le),
            ("==", Op::Eq),
            ("!=", Op::Ne),
            (">", Op::Gt),
            ("<", Op::Lt),
            ("=", Op::Eq),
        ];

        let (op, rest) = OPS
            .iter()
            .find_map(|(symbol, op)| clause.strip_prefix(symbol).map(|rest| (*op, rest)))
            .ok_or_else(|| SpecError::InvalidConstraint(clause.to_string()))?;

        let version = Version::parse(rest)
            .map_err(|_| SpecError::InvalidConstraint(clause.to_string()))?;
        Ok(Self { op, version })
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)
    }
}

/// Version requirement attached to a request or a dependency edge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VersionConstraint {
    #[default]
    Any,
    /// Satisfied only by the newest version the formula store knows
    Latest,
    Exact(Version),
    Range(Vec<Comparator>),
}

impl VersionConstraint {
    /// Check a candidate version. `latest` is the newest known version of the
    /// package, needed to evaluate [`VersionConstraint::Latest`].
    pub fn matches(&self, version: &Version, latest: Option<&Version>) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Latest => latest.is_some_and(|l| l == version),
            VersionConstraint::Exact(v) => v == version,
            VersionConstraint::Range(clauses) => clauses.iter().all(|c| c.matches(version)),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, VersionConstraint::Any)
    }
}

impl FromStr for VersionConstraint {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(VersionConstraint::Any);
        }
        if s.eq_ignore_ascii_case("latest") {
            return Ok(VersionConstraint::Latest);
        }

        // A bare version means an exact pin
        if s.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Version::parse(s)
                .map(VersionConstraint::Exact)
                .map_err(|_| SpecError::InvalidConstraint(s.to_string()));
        }

        let clauses = s
            .split(',')
            .map(Comparator::parse)
            .collect::<Result<Vec<_>, _>>()?;

        match clauses.as_slice() {
            [single] if single.op == Op::Eq => Ok(VersionConstraint::Exact(single.version.clone())),
            _ => Ok(VersionConstraint::Range(clauses)),
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => Ok(()),
            VersionConstraint::Latest => f.write_str("latest"),
            VersionConstraint::Exact(v) => write!(f, "=={}", v),
            VersionConstraint::Range(clauses) => {
                let joined: Vec<String> = clauses.iter().map(|c| c.to_string()).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

impl TryFrom<String> for VersionConstraint {
    type Error = SpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionConstraint> for String {
    fn from(value: VersionConstraint) -> Self {
        value.to_string()
    }
}

/// A named package with a version constraint and variant flags.
///
/// Created from user input or from a formula's dependency list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    #[serde(default)]
    pub constraint: VersionConstraint,
    #[serde(default)]
    pub variants: BTreeSet<String>,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: VersionConstraint::Any,
            variants: BTreeSet::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: VersionConstraint) -> Self {
        self.constraint = constraint;
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variants.insert(variant.into());
        self
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '+' | '-' | '/')
}

impl FromStr for PackageSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let name_end = s.find(|c: char| !is_name_char(c)).unwrap_or(s.len());
        let name = &s[..name_end];
        if name.is_empty() {
            return Err(SpecError::InvalidSpec(s.to_string()));
        }

        let mut rest = &s[name_end..];
        let mut variants = BTreeSet::new();

        if let Some(after_bracket) = rest.strip_prefix('[') {
            let close = after_bracket
                .find(']')
                .ok_or_else(|| SpecError::InvalidSpec(s.to_string()))?;
            variants = after_bracket[..close]
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            rest = &after_bracket[close + 1..];
        }

        let rest = rest.trim();
        let constraint = if rest.is_empty() {
            VersionConstraint::Any
        } else if let Some(pinned) = rest.strip_prefix(':') {
            pinned.parse()?
        } else if rest.starts_with(['<', '>', '=', '!']) {
            rest.parse()?
        } else {
            return Err(SpecError::InvalidSpec(s.to_string()));
        };

        Ok(Self {
            name: name.to_string(),
            constraint,
            variants,
        })
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.variants.is_empty() {
            let variants: Vec<&str> = self.variants.iter().map(String::as_str).collect();
            write!(f, "[{}]", variants.join(","))?;
        }
        match &self.constraint {
            VersionConstraint::Any => Ok(()),
            VersionConstraint::Latest => f.write_str(":latest"),
            other => write!(f, "{}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_equal_versions_hash_alike() {
        use std::collections::HashSet;

        let mut seen = HashSet::new();
        seen.insert(v("1.0"));
        assert!(seen.contains(&v("1.0.0")));
        assert!(seen.contains(&v("1")));
        assert!(!seen.contains(&v("1.0.1")));
        assert!(!seen.contains(&v("1.0rc1")));
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2.0") > v("1.99.99"));
        assert!(v("2024.10.01") > v("2024.9.30"));
    }

    #[test]
    fn test_trailing_zeros_are_equal() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("3"), v("3.0"));
        assert!(v("1.0.1") > v("1.0"));
    }

    #[test]
    fn test_prerelease_sorts_below_release() {
        assert!(v("1.0rc1") < v("1.0"));
        assert!(v("1.0beta") < v("1.0rc1"));
        assert!(v("1.0") < v("1.0.1"));
    }

    #[test]
    fn test_bottle_revision_sorts_above_base() {
        assert!(v("3.2.1_1") > v("3.2.1"));
        assert!(v("3.2.1_2") > v("3.2.1_1"));
        assert_eq!(v("3.2.1_1").to_string(), "3.2.1_1");
    }

    #[test]
    fn test_invalid_version() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("...").is_err());
    }

    #[test]
    fn test_constraint_parsing() {
        assert_eq!("".parse::<VersionConstraint>().unwrap(), VersionConstraint::Any);
        assert_eq!(
            "latest".parse::<VersionConstraint>().unwrap(),
            VersionConstraint::Latest
        );
        assert_eq!(
            "==1.2".parse::<VersionConstraint>().unwrap(),
            VersionConstraint::Exact(v("1.2"))
        );
        assert_eq!(
            "1.2".parse::<VersionConstraint>().unwrap(),
            VersionConstraint::Exact(v("1.2"))
        );
        assert!(matches!(
            ">=1.0,<2".parse::<VersionConstraint>().unwrap(),
            VersionConstraint::Range(ref c) if c.len() == 2
        ));
        assert!(">>1".parse::<VersionConstraint>().is_err());
        assert!(">=1.0,".parse::<VersionConstraint>().is_err());
    }

    #[test]
    fn test_constraint_matching() {
        let range: VersionConstraint = ">=1.0,<2".parse().unwrap();
        assert!(range.matches(&v("1.0"), None));
        assert!(range.matches(&v("1.9.9"), None));
        assert!(!range.matches(&v("2.0"), None));
        assert!(!range.matches(&v("0.9"), None));

        let not: VersionConstraint = "!=1.5".parse().unwrap();
        assert!(not.matches(&v("1.4"), None));
        assert!(!not.matches(&v("1.5.0"), None));

        let latest = VersionConstraint::Latest;
        assert!(latest.matches(&v("3.0"), Some(&v("3.0"))));
        assert!(!latest.matches(&v("2.0"), Some(&v("3.0"))));
        assert!(!latest.matches(&v("2.0"), None));
    }

    #[test]
    fn test_spec_parsing() {
        let spec: PackageSpec = "openssl@3".parse().unwrap();
        assert_eq!(spec.name, "openssl@3");
        assert!(spec.constraint.is_any());

        let spec: PackageSpec = "wget[with-libpsl, debug]>=1.20,<2".parse().unwrap();
        assert_eq!(spec.name, "wget");
        assert!(spec.variants.contains("with-libpsl"));
        assert!(spec.variants.contains("debug"));
        assert!(spec.constraint.matches(&v("1.24.5"), None));

        let spec: PackageSpec = "node:latest".parse().unwrap();
        assert_eq!(spec.constraint, VersionConstraint::Latest);

        let spec: PackageSpec = "python@3.12==3.12.4".parse().unwrap();
        assert_eq!(spec.name, "python@3.12");
        assert_eq!(spec.constraint, VersionConstraint::Exact(v("3.12.4")));
    }

    #[test]
    fn test_spec_parsing_errors() {
        assert!("".parse::<PackageSpec>().is_err());
        assert!("wget[oops".parse::<PackageSpec>().is_err());
        assert!("wget 1.0".parse::<PackageSpec>().is_err());
    }

    #[test]
    fn test_spec_display() {
        for input in ["wget", "wget[with-libpsl]>=1.20,<2", "node:latest", "curl==8.1"] {
            let spec: PackageSpec = input.parse().unwrap();
            assert_eq!(spec.to_string(), input);
        }
    }

    #[test]
    fn test_constraint_serde_as_string() {
        let spec: PackageSpec =
            serde_json::from_str(r#"{"name":"zlib","constraint":">=1.2"}"#).unwrap();
        assert!(spec.constraint.matches(&v("1.3"), None));
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains(r#""constraint":">=1.2""#));
    }
}
