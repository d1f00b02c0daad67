use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// A loosely structured version such as `1.2.3`, `v2.0-rc1` or `3`.
///
/// Components are separated by `.` or `-`. Two versions compare equal when
/// they agree on every component both of them have, so `1.2` matches
/// `1.2.7`. Numeric components compare numerically, anything else
/// lexically.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Number(u64),
    Text(String),
}

impl PartialOrd for Part {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(match (self, other) {
            (Part::Number(a), Part::Number(b)) => a.cmp(b),
            (Part::Number(_), Part::Text(_)) => Ordering::Greater,
            (Part::Text(_), Part::Number(_)) => Ordering::Less,
            (Part::Text(a), Part::Text(b)) => a.cmp(b),
        })
    }
}

impl Version {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let trimmed = text.trim().trim_start_matches(|c: char| c.is_ascii_alphabetic());
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidVersion(text.to_string()));
        }

        let parts = trimmed
            .split(['.', '-'])
            .filter(|part| !part.is_empty())
            .map(|part| match part.parse::<u64>() {
                Ok(n) => Part::Number(n),
                Err(_) => Part::Text(part.to_string()),
            })
            .collect();

        Ok(Self {
            raw: text.trim().to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Component-wise comparison over the common prefix.
    fn compare(&self, other: &Self) -> Ordering {
        for (a, b) in self.parts.iter().zip(&other.parts) {
            match a.partial_cmp(b) {
                Some(Ordering::Equal) | None => continue,
                Some(ordering) => return ordering,
            }
        }
        Ordering::Equal
    }

    /// Strict ordering used to pick the newest candidate: on a tie over the
    /// common prefix, the longer version wins.
    pub fn newest_cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
            .then_with(|| self.parts.len().cmp(&other.parts.len()))
    }
}

/// Prefix equality: `1.2` equals both `1.2.0` and `1.2.7`, which do not
/// equal each other. The relation is not transitive, so `Version` is not
/// `Eq` and must not key a map; use [`Version::newest_cmp`] for a total order.
impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
        }
    }
}

/// A version constraint, e.g. `>= 1.2`.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionSpec {
    pub op: Operator,
    pub version: Version,
}

impl VersionSpec {
    /// Parses `<op> <version>`; a bare version means `==`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let text = text.trim();
        let split = text
            .find(|c: char| !matches!(c, '=' | '<' | '>'))
            .unwrap_or(text.len());
        let (op, version) = text.split_at(split);

        let op = match op {
            "" | "=" | "==" => Operator::Eq,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            other => return Err(ConfigError::InvalidOperator(other.to_string())),
        };

        Ok(Self {
            op,
            version: Version::parse(version)?,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        let ordering = version.compare(&self.version);
        match self.op {
            Operator::Eq => ordering == Ordering::Equal,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Ge => ordering != Ordering::Less,
            Operator::Lt => ordering == Ordering::Less,
            Operator::Le => ordering != Ordering::Greater,
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.version)
    }
}
