use std::future::Future;
use std::pin::Pin;

use serde::Serialize;

/// Boxed, sendable future. Lifecycle phases recurse through the graph, so the
/// futures they return have to be type-erased.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A 32-byte BLAKE3 hash used for change detection.
///
/// Node fingerprints are stored in the cache as the hex form of this hash and
/// compared on the next run to decide whether configuration drifted.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in &self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Order-independent hasher over named values.
///
/// Entries are sorted by name before hashing and every value is serialized
/// through [`canonical`], so the resulting hash does not depend on the order
/// in which entries were pushed.
#[derive(Default)]
pub struct Fingerprint {
    entries: Vec<(String, String)>,
}

impl Fingerprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: Serialize>(&mut self, name: impl Into<String>, value: &T) {
        let value = serde_json::to_value(value)
            .map(|value| canonical(&value))
            .unwrap_or_default();
        self.entries.push((name.into(), value));
    }

    pub fn finish(mut self) -> Hash32 {
        self.entries.sort();

        let mut hasher = blake3::Hasher::new();
        for (name, value) in &self.entries {
            // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }

        hasher.finalize().into()
    }
}

/// Serializes a JSON value with sorted object keys and sorted arrays.
///
/// Collection-valued options are treated as sets for fingerprinting purposes,
/// reordering the elements of a list does not change the hash.
pub fn canonical(value: &serde_json::Value) -> String {
    use serde_json::Value;

    match value {
        Value::Array(items) => {
            let mut items: Vec<String> = items.iter().map(canonical).collect();
            items.sort();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut items: Vec<(&String, String)> =
                map.iter().map(|(k, v)| (k, canonical(v))).collect();
            items.sort();
            let items: Vec<String> = items
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hex_roundtrip_length() {
        let hash = Hash32::hash("kiln");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let mut a = Fingerprint::new();
        a.push("opt", &1);
        a.push("flags", &vec!["-O2", "-g"]);

        let mut b = Fingerprint::new();
        b.push("flags", &vec!["-g", "-O2"]);
        b.push("opt", &1);

        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_fingerprint_detects_value_change() {
        let mut a = Fingerprint::new();
        a.push("opt", &1);
        let mut b = Fingerprint::new();
        b.push("opt", &2);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_canonical_sorts_nested() {
        let a = canonical(&json!({"b": [3, 1], "a": {"y": 1, "x": 2}}));
        let b = canonical(&json!({"a": {"x": 2, "y": 1}, "b": [1, 3]}));
        assert_eq!(a, b);
    }
}
