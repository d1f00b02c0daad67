//! Typed, cache-backed configuration values attached to nodes and scopes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::cache::CacheScope;
use crate::core::{Fingerprint, Hash32};
use crate::error::{ConfigError, Result};

/// Cache key under which option overrides are persisted.
const OPTIONS_KEY: &str = "options";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<String>),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "int",
            OptionValue::String(_) => "string",
            OptionValue::List(_) => "list",
        }
    }

    /// Parses `text` into a value of the same type as `self`.
    fn parse_like(&self, name: &str, text: &str) -> Result<OptionValue, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidOptionValue {
            option: name.to_string(),
            value: text.to_string(),
            reason: reason.to_string(),
        };

        Ok(match self {
            OptionValue::Bool(_) => match text.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => OptionValue::Bool(true),
                "0" | "false" | "no" | "off" => OptionValue::Bool(false),
                _ => return Err(invalid("expected a boolean")),
            },
            OptionValue::Int(_) => OptionValue::Int(
                text.trim()
                    .parse()
                    .map_err(|_| invalid("expected an integer"))?,
            ),
            OptionValue::String(_) => OptionValue::String(text.to_string()),
            OptionValue::List(_) => OptionValue::List(split_list(text)),
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            OptionValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{b}"),
            OptionValue::Int(i) => write!(f, "{i}"),
            OptionValue::String(s) => f.write_str(s),
            OptionValue::List(items) => f.write_str(&items.join(",")),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::String(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::String(value)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(value: Vec<String>) -> Self {
        OptionValue::List(value)
    }
}

fn split_list(text: &str) -> Vec<String> {
    text.split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Assignment operator used by the dotted-path configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=` replaces the value.
    Set,
    /// `+=` appends to a list, adds to an int, concatenates a string.
    Add,
    /// `-=` removes from a list, subtracts from an int.
    Remove,
}

impl std::str::FromStr for AssignOp {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(AssignOp::Set),
            "+=" => Ok(AssignOp::Add),
            "-=" => Ok(AssignOp::Remove),
            other => Err(ConfigError::InvalidOperator(other.to_string())),
        }
    }
}

impl AssignOp {
    /// Splits `name<op>value` into its three parts.
    pub fn split(expr: &str) -> Result<(&str, AssignOp, &str), ConfigError> {
        let Some(eq) = expr.find('=') else {
            return Err(ConfigError::InvalidOperator(expr.to_string()));
        };

        let (op, name_end) = match expr[..eq].chars().last() {
            Some('+') => (AssignOp::Add, eq - 1),
            Some('-') => (AssignOp::Remove, eq - 1),
            _ => (AssignOp::Set, eq),
        };

        Ok((expr[..name_end].trim(), op, &expr[eq + 1..]))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    default: OptionValue,
    value: Option<OptionValue>,
    help: String,
}

impl Entry {
    fn current(&self) -> &OptionValue {
        self.value.as_ref().unwrap_or(&self.default)
    }
}

/// An ordered set of named options.
///
/// Overrides are persisted in the owning cache scope under the section of the
/// owner, so a value set in one invocation is still in effect in the next.
pub struct Options {
    owner: String,
    cache: Arc<CacheScope>,
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl Options {
    pub fn new(owner: impl Into<String>, cache: Arc<CacheScope>) -> Self {
        Self {
            owner: owner.into(),
            cache,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Declares an option. A previously persisted override of the same type
    /// takes effect immediately.
    pub fn add(&self, name: &str, default: impl Into<OptionValue>, help: &str) {
        let default = default.into();
        let value = self
            .persisted()
            .remove(name)
            .filter(|v| v.type_name() == default.type_name());

        self.lock().insert(
            name.to_string(),
            Entry {
                default,
                value,
                help: help.to_string(),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<OptionValue> {
        self.lock().get(name).map(|e| e.current().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn help(&self, name: &str) -> Option<String> {
        self.lock().get(name).map(|e| e.help.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Current values, sorted by name.
    pub fn values(&self) -> Vec<(String, OptionValue)> {
        self.lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.current().clone()))
            .collect()
    }

    /// Applies `op` with the textual `value` to option `name` and persists
    /// the result.
    pub fn apply(&self, name: &str, op: AssignOp, value: &str) -> Result<OptionValue> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownOption(name.to_string()))?;

        let parsed = entry.default.parse_like(name, value)?;
        let next = match (op, entry.current().clone(), parsed) {
            (AssignOp::Set, _, parsed) => parsed,
            (AssignOp::Add, OptionValue::List(mut items), OptionValue::List(extra)) => {
                items.extend(extra);
                OptionValue::List(items)
            }
            (AssignOp::Remove, OptionValue::List(items), OptionValue::List(gone)) => {
                OptionValue::List(items.into_iter().filter(|i| !gone.contains(i)).collect())
            }
            (op @ (AssignOp::Add | AssignOp::Remove), OptionValue::Int(a), OptionValue::Int(b)) => {
                let (result, sign) = match op {
                    AssignOp::Add => (a.checked_add(b), '+'),
                    _ => (a.checked_sub(b), '-'),
                };
                let result = result.ok_or_else(|| ConfigError::InvalidOptionValue {
                    option: name.to_string(),
                    value: value.to_string(),
                    reason: format!("{a} {sign} {b} overflows"),
                })?;
                OptionValue::Int(result)
            }
            (AssignOp::Add, OptionValue::String(a), OptionValue::String(b)) => {
                OptionValue::String(a + &b)
            }
            (op, current, _) => {
                return Err(ConfigError::InvalidOptionValue {
                    option: name.to_string(),
                    value: value.to_string(),
                    reason: format!("operator {op:?} is not supported by {}", current.type_name()),
                }
                .into());
            }
        };

        entry.value = Some(next.clone());
        let overrides = overrides_of(&entries);
        drop(entries);

        self.cache.set(&self.owner, OPTIONS_KEY, &overrides)?;
        tracing::info!("{}.{name} = {next}", self.owner);
        Ok(next)
    }

    /// Restores the default value of `name`.
    pub fn reset(&self, name: &str) -> Result<()> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| ConfigError::UnknownOption(name.to_string()))?;
        entry.value = None;
        let overrides = overrides_of(&entries);
        drop(entries);

        self.cache.set(&self.owner, OPTIONS_KEY, &overrides)
    }

    /// Stable hash of every option name and current value.
    pub fn fingerprint(&self) -> Hash32 {
        let mut fp = Fingerprint::new();
        self.extend_fingerprint("", &mut fp);
        fp.finish()
    }

    pub(crate) fn extend_fingerprint(&self, prefix: &str, fp: &mut Fingerprint) {
        for (name, entry) in self.lock().iter() {
            fp.push(format!("{prefix}{name}"), entry.current());
        }
    }

    fn persisted(&self) -> BTreeMap<String, OptionValue> {
        self.cache
            .get(&self.owner, OPTIONS_KEY)
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn overrides_of(entries: &BTreeMap<String, Entry>) -> BTreeMap<String, OptionValue> {
    entries
        .iter()
        .filter_map(|(k, e)| e.value.clone().map(|v| (k.clone(), v)))
        .collect()
}
