//! File-backed configuration store.
//!
//! The store is the only durable state of an installation: inputs, derived
//! values, secrets needed to resume, and the checkpoints that guard every
//! pipeline step. It is a YAML document (default `~/.kubefirst`) whose nested
//! mappings are addressed with case-insensitive dotted keys.
//!
//! Lookups consult, in order:
//! 1. values `set` during this process
//! 2. CLI flags
//! 3. `KUBEFIRST_*` environment variables (`cluster-name` → `KUBEFIRST_CLUSTER_NAME`)
//! 4. the file
//! 5. registered defaults
//!
//! Only [`ConfigStore::flush`] makes writes durable; it rewrites the whole file
//! through a temp file and an atomic rename.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::debug;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "KUBEFIRST";

/// Errors raised by the store and by state validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file exists but cannot be read or parsed.
    #[error("cannot read configuration {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    /// The file cannot be rewritten.
    #[error("cannot write configuration {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    /// A required key has no value in any layer.
    #[error("missing required configuration '{0}'")]
    Missing(String),

    /// A value is present but invalid.
    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

/// Layered, file-backed key/value store.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    file: Value,
    set_layer: HashMap<String, Value>,
    flags: HashMap<String, Value>,
    defaults: HashMap<String, Value>,
    dirty: bool,
}

/// Lowercased, dot-separated form of a key.
fn normalize(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Environment variable overriding `key`.
#[must_use]
pub fn env_var_for(key: &str) -> String {
    let suffix: String = normalize(key)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("{ENV_PREFIX}_{suffix}")
}

/// Interpret a scalar as a boolean.
fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Render a scalar as a string.
fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl ConfigStore {
    /// Open the store at `path`, creating an empty one if the file is absent.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] if the file exists but is not valid YAML.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let file = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Value::Mapping(Mapping::new()),
            Ok(text) => serde_yaml::from_str(&text).map_err(|e| ConfigError::Read {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Mapping(Mapping::new()),
            Err(e) => {
                return Err(ConfigError::Read {
                    path,
                    reason: e.to_string(),
                })
            }
        };
        debug!(path = %path.display(), "Opened configuration store");

        Ok(Self {
            path,
            file: if file.is_mapping() {
                file
            } else {
                Value::Mapping(Mapping::new())
            },
            set_layer: HashMap::new(),
            flags: HashMap::new(),
            defaults: HashMap::new(),
            dirty: false,
        })
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a CLI flag value.
    pub fn set_flag(&mut self, key: &str, value: impl Into<Value>) {
        self.flags.insert(normalize(key), value.into());
    }

    /// Register a fallback value.
    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) {
        self.defaults.insert(normalize(key), value.into());
    }

    /// Resolve `key` through all layers.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        let key = normalize(key);
        if let Some(v) = self.set_layer.get(&key) {
            return Some(v.clone());
        }
        if let Some(v) = self.flags.get(&key) {
            return Some(v.clone());
        }
        if let Ok(v) = std::env::var(env_var_for(&key)) {
            return Some(Value::String(v));
        }
        if let Some(v) = Self::lookup(&self.file, &key) {
            return Some(v.clone());
        }
        self.defaults.get(&key).cloned()
    }

    /// Resolve `key` as a string; empty strings count as absent.
    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .as_ref()
            .and_then(as_string)
            .filter(|s| !s.is_empty())
    }

    /// Resolve a required string.
    ///
    /// # Errors
    /// Returns [`ConfigError::Missing`] when no layer has a value.
    pub fn require_string(&self, key: &str) -> Result<String, ConfigError> {
        self.get_string(key)
            .ok_or_else(|| ConfigError::Missing(normalize(key)))
    }

    /// Resolve `key` as a boolean; absent or unparseable values are `false`.
    #[must_use]
    pub fn bool(&self, key: &str) -> bool {
        self.get(key).as_ref().and_then(as_bool).unwrap_or(false)
    }

    /// Resolve `key` as an integer.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Resolve `key` as a list of strings; a scalar is split on commas.
    #[must_use]
    pub fn get_strings(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Sequence(items)) => items.iter().filter_map(as_string).collect(),
            Some(other) => as_string(&other)
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Set a value for this process and stage it for the next flush.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let key = normalize(key);
        let value = value.into();
        Self::insert(&mut self.file, &key, value.clone());
        self.set_layer.insert(key, value);
        self.dirty = true;
    }

    /// Whether the checkpoint `name` has been reached.
    #[must_use]
    pub fn checkpoint(&self, name: &str) -> bool {
        self.bool(name)
    }

    /// Mark checkpoint `name` as reached. Checkpoints only move forward.
    pub fn mark(&mut self, name: &str) {
        if !self.checkpoint(name) {
            self.set(name, true);
        }
    }

    /// Whether there are staged writes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Atomically rewrite the backing file.
    ///
    /// # Errors
    /// Returns [`ConfigError::Write`] if the file cannot be replaced.
    pub fn flush(&mut self) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::Write {
            path: self.path.clone(),
            reason,
        };

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&dir).map_err(|e| write_err(e.to_string()))?;

        let text = serde_yaml::to_string(&self.file).map_err(|e| write_err(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| write_err(e.to_string()))?;
        tmp.write_all(text.as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| write_err(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| write_err(e.error.to_string()))?;

        self.dirty = false;
        debug!(path = %self.path.display(), "Flushed configuration store");
        Ok(())
    }

    fn lookup<'a>(root: &'a Value, key: &str) -> Option<&'a Value> {
        let mut node = root;
        for part in key.split('.') {
            let mapping = node.as_mapping()?;
            node = mapping.iter().find_map(|(k, v)| {
                k.as_str()
                    .filter(|k| k.eq_ignore_ascii_case(part))
                    .map(|_| v)
            })?;
        }
        Some(node)
    }

    fn insert(root: &mut Value, key: &str, value: Value) {
        let parts: Vec<&str> = key.split('.').collect();
        let mut node = root;
        for (i, part) in parts.iter().enumerate() {
            if !node.is_mapping() {
                *node = Value::Mapping(Mapping::new());
            }
            let Some(mapping) = node.as_mapping_mut() else {
                return;
            };
            let existing = mapping
                .keys()
                .find(|k| k.as_str().is_some_and(|k| k.eq_ignore_ascii_case(part)))
                .cloned()
                .unwrap_or_else(|| Value::String((*part).to_string()));

            if i + 1 == parts.len() {
                mapping.insert(existing, value);
                return;
            }
            node = mapping
                .entry(existing)
                .or_insert_with(|| Value::Mapping(Mapping::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join(".kubefirst")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_roundtrip_all_value_kinds() {
        let (dir, mut s) = store();
        s.set("cluster-name", "mgmt");
        s.set("flags.dry-run", true);
        s.set("vault.secret-shares", 5);
        s.set(
            "argocd.apps",
            Value::Sequence(vec!["registry".into(), "argocd".into()]),
        );
        s.flush().unwrap();

        let reloaded = ConfigStore::open(dir.path().join(".kubefirst")).unwrap();
        assert_eq!(reloaded.get_string("cluster-name").as_deref(), Some("mgmt"));
        assert!(reloaded.bool("flags.dry-run"));
        assert_eq!(reloaded.get_i64("vault.secret-shares"), Some(5));
        assert_eq!(reloaded.get_strings("argocd.apps"), vec!["registry", "argocd"]);
    }

    #[test]
    fn test_keys_are_case_insensitive_and_nested() {
        let (dir, mut s) = store();
        s.set("Terraform.Base.Apply.Complete", true);
        s.flush().unwrap();

        let text = std::fs::read_to_string(dir.path().join(".kubefirst")).unwrap();
        let doc: Value = serde_yaml::from_str(&text).unwrap();
        assert_eq!(doc["terraform"]["base"]["apply"]["complete"], Value::Bool(true));

        let reloaded = ConfigStore::open(dir.path().join(".kubefirst")).unwrap();
        assert!(reloaded.checkpoint("terraform.base.apply.complete"));
        assert!(reloaded.checkpoint("TERRAFORM.BASE.APPLY.COMPLETE"));
    }

    #[test]
    #[serial]
    fn test_precedence_set_flag_env_file_default() {
        let (dir, mut s) = store();
        let key = "k1-precedence-probe";
        let env = env_var_for(key);
        assert_eq!(env, "KUBEFIRST_K1_PRECEDENCE_PROBE");

        s.set_default(key, "default");
        assert_eq!(s.get_string(key).as_deref(), Some("default"));

        std::fs::write(dir.path().join(".kubefirst"), format!("{key}: file\n")).unwrap();
        let mut s = ConfigStore::open(dir.path().join(".kubefirst")).unwrap();
        s.set_default(key, "default");
        assert_eq!(s.get_string(key).as_deref(), Some("file"));

        std::env::set_var(&env, "env");
        assert_eq!(s.get_string(key).as_deref(), Some("env"));

        s.set_flag(key, "flag");
        assert_eq!(s.get_string(key).as_deref(), Some("flag"));

        s.set(key, "explicit");
        assert_eq!(s.get_string(key).as_deref(), Some("explicit"));
        std::env::remove_var(&env);
    }

    #[test]
    fn test_mark_is_monotonic() {
        let (_dir, mut s) = store();
        assert!(!s.checkpoint("tools.downloaded"));
        s.mark("tools.downloaded");
        assert!(s.checkpoint("tools.downloaded"));
        s.mark("tools.downloaded");
        assert!(s.checkpoint("tools.downloaded"));
    }

    #[test]
    fn test_flush_leaves_no_temp_files() {
        let (dir, mut s) = store();
        s.set("domain", "example.com");
        s.flush().unwrap();
        s.set("domain", "example.org");
        s.flush().unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(!s.is_dirty());
    }

    #[test]
    fn test_unwritable_path_reports_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut s = ConfigStore::open(blocker.join("nested").join(".kubefirst")).unwrap();
        s.set("a", "b");
        assert!(matches!(s.flush(), Err(ConfigError::Write { .. })));
    }

    #[test]
    fn test_corrupt_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".kubefirst");
        std::fs::write(&path, "a: [unterminated").unwrap();
        assert!(matches!(ConfigStore::open(&path), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_strings_from_comma_separated_scalar() {
        let (_dir, mut s) = store();
        s.set_flag("atlantis.allow-list", "github.com/acme/gitops, github.com/acme/metaphor");
        assert_eq!(
            s.get_strings("atlantis.allow-list"),
            vec!["github.com/acme/gitops", "github.com/acme/metaphor"]
        );
    }
}
