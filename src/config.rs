//! Flat configuration parameters.
//!
//! Keys are dot-separated paths such as `connection.host` or
//! `options.max_page_size`. Values are kept as strings and converted on
//! access, so the same map can be built from code, from JSON files or from
//! `key=value` pairs on a command line.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigParams {
    values: BTreeMap<String, String>,
}

impl ConfigParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(key, value)` pairs
    ///
    /// # Examples
    ///
    /// ```
    /// use mongo_persistence::ConfigParams;
    ///
    /// let config = ConfigParams::from_tuples(&[
    ///     ("connection.host", "localhost"),
    ///     ("connection.port", "27017"),
    /// ]);
    /// assert_eq!(config.get("connection.port"), Some("27017"));
    /// ```
    pub fn from_tuples(tuples: &[(&str, &str)]) -> Self {
        tuples
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    /// Flatten a JSON document into dot-separated keys.
    ///
    /// Nested objects extend the key path, array elements are keyed by
    /// their index and scalars are stringified. `null` becomes an empty value.
    pub fn from_json(value: &JsonValue) -> Self {
        let mut config = Self::new();
        flatten_json("", value, &mut config.values);
        config
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get_as_string_with_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_as_nullable_integer(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?.trim();
        raw.parse::<i64>()
            .ok()
            .or_else(|| raw.parse::<f64>().ok().map(|f| f as i64))
    }

    pub fn get_as_integer_with_default(&self, key: &str, default: i64) -> i64 {
        self.get_as_nullable_integer(key).unwrap_or(default)
    }

    pub fn get_as_nullable_boolean(&self, key: &str) -> Option<bool> {
        match self.get(key)?.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Some(true),
            "false" | "0" | "no" | "n" | "off" => Some(false),
            _ => None,
        }
    }

    pub fn get_as_boolean_with_default(&self, key: &str, default: bool) -> bool {
        self.get_as_nullable_boolean(key).unwrap_or(default)
    }

    /// Sub-parameters stored under `name.` with the prefix stripped.
    pub fn get_section(&self, name: &str) -> ConfigParams {
        let prefix = format!("{}.", name);
        self.values
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_string(), value.clone()))
            })
            .collect()
    }

    /// Distinct first path segments of all keys that have a sub-path.
    ///
    /// Numeric names (produced by flattened JSON arrays) are ordered
    /// numerically, everything else lexically.
    pub fn get_section_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for key in self.values.keys() {
            if let Some((head, _)) = key.split_once('.') {
                if !names.iter().any(|n| n == head) {
                    names.push(head.to_string());
                }
            }
        }

        if names.iter().all(|n| n.parse::<u64>().is_ok()) {
            names.sort_by_key(|n| n.parse::<u64>().unwrap_or(u64::MAX));
        }
        names
    }

    /// Returns a copy where explicit values override `defaults`.
    pub fn set_defaults(&self, defaults: &ConfigParams) -> ConfigParams {
        let mut merged = defaults.clone();
        merged.values.extend(self.values.clone());
        merged
    }
}

impl FromIterator<(String, String)> for ConfigParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

fn flatten_json(prefix: &str, value: &JsonValue, out: &mut BTreeMap<String, String>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    };

    match value {
        JsonValue::Object(map) => {
            for (key, nested) in map {
                flatten_json(&join(key), nested, out);
            }
        }
        JsonValue::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                flatten_json(&join(&index.to_string()), nested, out);
            }
        }
        JsonValue::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        JsonValue::Null => {
            out.insert(prefix.to_string(), String::new());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}
