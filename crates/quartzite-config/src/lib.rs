//! # quartzite-config: Provider parameter schema
//!
//! Replication components register their parameters into a [`ParamStore`]
//! (key, default, kind, runtime mutability). The embedder then overrides
//! values from an options string or a TOML file before construction, and may
//! change runtime-settable keys afterwards through `param_set`.
//!
//! Keys are case-sensitive dotted strings (`repl.commit_order`,
//! `ist.recv_addr`).

pub mod duration;
pub mod error;

pub use duration::{format_iso8601, parse_iso8601};
pub use error::{Error, Result};

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

// ============================================================================
// Parameter kinds
// ============================================================================

/// Value shape accepted by a registered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Free-form string.
    String,
    /// `true`/`false`/`yes`/`no`/`on`/`off`/`1`/`0`.
    Bool,
    /// Signed 64-bit integer.
    I64,
    /// TCP port.
    Port,
    /// ISO-8601 duration.
    Duration,
}

impl ParamKind {
    fn validate(self, key: &str, value: &str) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        match self {
            ParamKind::String => Ok(()),
            ParamKind::Bool => parse_bool(value).map(|_| ()).ok_or_else(|| invalid("not a boolean")),
            ParamKind::I64 => value
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| invalid("not an integer")),
            ParamKind::Port => value
                .parse::<u16>()
                .map(|_| ())
                .map_err(|_| invalid("not a port number")),
            ParamKind::Duration => parse_iso8601(value).map(|_| ()).map_err(|_| invalid("not an ISO-8601 duration")),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Parameter store
// ============================================================================

#[derive(Debug, Clone)]
struct ParamSpec {
    value: String,
    kind: ParamKind,
    /// Whether `set` may change the value after construction is done.
    runtime: bool,
}

/// String-keyed parameter schema with typed accessors.
///
/// The store distinguishes a construction phase (everything settable) from a
/// sealed runtime phase where only `runtime` keys accept changes.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    params: BTreeMap<String, ParamSpec>,
    sealed: bool,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a key with its default value.
    ///
    /// Registering an existing key keeps the current value (components may
    /// be constructed in any order).
    pub fn register(&mut self, key: &str, default: &str, kind: ParamKind, runtime: bool) {
        self.params.entry(key.to_string()).or_insert_with(|| ParamSpec {
            value: default.to_string(),
            kind,
            runtime,
        });
    }

    /// Ends the construction phase; runtime-immutable keys freeze.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether `key` is registered.
    pub fn has(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Result<&str> {
        self.params
            .get(key)
            .map(|s| s.value.as_str())
            .ok_or_else(|| Error::UnknownKey(key.to_string()))
    }

    /// Sets a value, validating against the key's kind.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let spec = self
            .params
            .get_mut(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
        if self.sealed && !spec.runtime {
            return Err(Error::NotSettable(key.to_string()));
        }
        spec.kind.validate(key, value)?;
        debug!(key, value, "parameter set");
        spec.value = value.to_string();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let raw = self.get(key)?;
        parse_bool(raw).ok_or_else(|| Error::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "not a boolean".to_string(),
        })
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        let raw = self.get(key)?;
        raw.parse().map_err(|_| Error::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "not an integer".to_string(),
        })
    }

    pub fn get_port(&self, key: &str) -> Result<u16> {
        let raw = self.get(key)?;
        raw.parse().map_err(|_| Error::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "not a port number".to_string(),
        })
    }

    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        parse_iso8601(self.get(key)?)
    }

    /// Iterates `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, s)| (k.as_str(), s.value.as_str()))
    }

    // ------------------------------------------------------------------
    // Bulk loading
    // ------------------------------------------------------------------

    /// Applies a `key=value;key=value` provider options string.
    pub fn apply_options_str(&mut self, options: &str) -> Result<()> {
        for pair in options.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(|| Error::InvalidValue {
                key: pair.to_string(),
                value: String::new(),
                reason: "expected key=value".to_string(),
            })?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Loads a TOML file, flattening nested tables into dotted keys.
    pub fn load_toml_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let table: toml::Table = text.parse()?;
        let mut flat = Vec::new();
        flatten_table(String::new(), &table, &mut flat);
        for (key, value) in flat {
            self.set(&key, &value)?;
        }
        Ok(())
    }
}

fn flatten_table(prefix: String, table: &toml::Table, out: &mut Vec<(String, String)>) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(t) => flatten_table(full, t, out),
            toml::Value::String(s) => out.push((full, s.clone())),
            other => out.push((full, other.to_string())),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store() -> ParamStore {
        let mut p = ParamStore::new();
        p.register("base_host", "", ParamKind::String, false);
        p.register("base_port", "4567", ParamKind::Port, false);
        p.register("repl.commit_order", "3", ParamKind::I64, false);
        p.register("repl.causal_read_timeout", "PT30S", ParamKind::Duration, true);
        p.register("ist.keep_keys", "true", ParamKind::Bool, false);
        p
    }

    #[test]
    fn defaults_and_typed_access() {
        let p = store();
        assert_eq!(p.get_port("base_port").unwrap(), 4567);
        assert_eq!(p.get_i64("repl.commit_order").unwrap(), 3);
        assert!(p.get_bool("ist.keep_keys").unwrap());
        assert_eq!(
            p.get_duration("repl.causal_read_timeout").unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn unknown_key_is_reported() {
        let p = store();
        assert!(matches!(p.get("no.such.key"), Err(Error::UnknownKey(_))));
    }

    #[test]
    fn sealing_freezes_non_runtime_keys() {
        let mut p = store();
        p.set("repl.commit_order", "0").unwrap();
        p.seal();
        assert!(matches!(
            p.set("repl.commit_order", "1"),
            Err(Error::NotSettable(_))
        ));
        // runtime key still settable
        p.set("repl.causal_read_timeout", "PT5S").unwrap();
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut p = store();
        assert!(p.set("base_port", "not-a-port").is_err());
        assert!(p.set("ist.keep_keys", "maybe").is_err());
        assert!(p.set("repl.causal_read_timeout", "30 seconds").is_err());
    }

    #[test]
    fn options_string() {
        let mut p = store();
        p.apply_options_str("base_host=10.0.0.1; base_port=5678 ;ist.keep_keys=no")
            .unwrap();
        assert_eq!(p.get("base_host").unwrap(), "10.0.0.1");
        assert_eq!(p.get_port("base_port").unwrap(), 5678);
        assert!(!p.get_bool("ist.keep_keys").unwrap());
    }

    #[test]
    fn toml_file_flattens_dotted_keys() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "base_host = \"db1\"\n[repl]\ncommit_order = 3\n[ist]\nkeep_keys = false\n"
        )
        .unwrap();

        let mut p = store();
        p.load_toml_file(f.path()).unwrap();
        assert_eq!(p.get("base_host").unwrap(), "db1");
        assert!(!p.get_bool("ist.keep_keys").unwrap());
    }
}
