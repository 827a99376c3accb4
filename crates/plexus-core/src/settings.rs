//! Key-value settings passed through every layer `init`.
//!
//! Values are stored as strings and parsed on lookup, the same way
//! environment overrides are read. Layers document the keys they recognize
//! as constants next to their defaults.
//!
//! # Usage
//!
//! ```ignore
//! use plexus_core::Settings;
//!
//! let mut cfg = Settings::new();
//! cfg.set("plexus.transport.read-chunk-size", 4096);
//! let chunk: usize = cfg.get_or("plexus.transport.read-chunk-size", 8192);
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use tracing::warn;

/// Ordered map of dotted keys to raw string values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    entries: BTreeMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every environment variable starting with `prefix`.
    ///
    /// `PLEXUS_TRANSPORT_READ_CHUNK_SIZE` maps to
    /// `plexus.transport.read-chunk-size`: the first two segments become
    /// dotted path components, the rest is joined with dashes.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    fn from_vars<I>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut out = Self::new();
        for (name, value) in vars {
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(key) = env_name_to_key(&name) {
                out.entries.insert(key, value);
            }
        }
        out
    }

    /// Set `key` to the string form of `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Display) -> &mut Self {
        self.entries.insert(key.into(), value.to_string());
        self
    }

    /// Builder-style variant of [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.set(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Parse the value at `key`; `None` if missing or unparseable.
    pub fn get<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.entries.get(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable setting");
                None
            }
        }
    }

    /// Parse the value at `key`, or return `default`.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Booleans accept "1", "true", "yes", "on" (case-insensitive).
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.entries.get(key) {
            Some(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merge(&mut self, other: &Settings) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn env_name_to_key(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    let mut parts = lower.split('_').filter(|p| !p.is_empty());
    let root = parts.next()?;
    let section = parts.next()?;
    let rest: Vec<&str> = parts.collect();
    if rest.is_empty() {
        return None;
    }
    Some(format!("{}.{}.{}", root, section, rest.join("-")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_lookup_with_defaults() {
        let cfg = Settings::new()
            .with("plexus.transport.read-chunk-size", 4096)
            .with("plexus.framing.max-message-length", "not-a-number");

        assert_eq!(cfg.get_or("plexus.transport.read-chunk-size", 8192usize), 4096);
        assert_eq!(cfg.get_or("plexus.framing.max-message-length", 16u32), 16);
        assert_eq!(cfg.get_or("plexus.missing", 7i64), 7);
        assert_eq!(cfg.get::<usize>("plexus.missing"), None);
    }

    #[test]
    fn test_bool_values() {
        let cfg = Settings::new().with("a.b.c", "Yes").with("a.b.d", "0");
        assert!(cfg.get_bool("a.b.c", false));
        assert!(!cfg.get_bool("a.b.d", true));
        assert!(cfg.get_bool("a.b.e", true));
    }

    #[test]
    fn test_env_names_map_to_dotted_keys() {
        let vars = vec![
            ("PLEXUS_TRANSPORT_READ_CHUNK_SIZE".to_string(), "1024".to_string()),
            ("PLEXUS_HTTP_MAX_REQUEST_SIZE".to_string(), "2048".to_string()),
            ("PLEXUS_TOOSHORT".to_string(), "x".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let cfg = Settings::from_vars("PLEXUS_", vars);
        assert_eq!(cfg.len(), 2);
        assert_eq!(cfg.get_or("plexus.transport.read-chunk-size", 0usize), 1024);
        assert_eq!(cfg.get_str("plexus.http.max-request-size"), Some("2048"));
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = Settings::new().with("k.a.x", 1).with("k.a.y", 2);
        base.merge(&Settings::new().with("k.a.y", 3));
        assert_eq!(base.get_or("k.a.x", 0), 1);
        assert_eq!(base.get_or("k.a.y", 0), 3);
    }
}
