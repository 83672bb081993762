//! Container configuration store.
//!
//! Configuration is a set of dotted keys (`lxc.network.0.mtu`), each
//! mapping to an ordered list of values. On disk it is one `key = value`
//! line per value, so a key with several values is written as several
//! lines in order.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use lxkit_common::error::{LxkitError, Result};

/// Keys that hold a list of values; `set` appends to them.
const MULTI_VALUED_KEYS: &[&str] = &[
    "lxc.cap.drop",
    "lxc.cap.keep",
    "lxc.mount.entry",
    "lxc.environment",
    "lxc.include",
    "lxc.idmap",
    "lxc.id_map",
    "lxc.group",
];

/// Returns whether `key` accumulates values instead of replacing them.
pub fn is_multi_valued_key(key: &str) -> bool {
    if MULTI_VALUED_KEYS.contains(&key) || key.starts_with("lxc.hook.") {
        return true;
    }
    key.strip_prefix("lxc.network.")
        .and_then(|rest| rest.split_once('.'))
        .is_some_and(|(index, leaf)| {
            index.bytes().all(|b| b.is_ascii_digit()) && matches!(leaf, "ipv4" | "ipv6")
        })
}

/// In-memory key/value configuration of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigStore {
    entries: BTreeMap<String, Vec<String>>,
}

impl ConfigStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the textual configuration format.
    ///
    /// # Errors
    ///
    /// Returns [`LxkitError::Config`] naming the first malformed line.
    pub fn parse(content: &str) -> Result<Self> {
        let mut store = Self::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(LxkitError::Config {
                    message: format!("line {}: expected `key = value`, got {raw:?}", index + 1),
                });
            };
            let key = key.trim();
            validate_key(key).map_err(|e| LxkitError::Config {
                message: format!("line {}: {e}", index + 1),
            })?;
            let value = value.trim();
            if value.is_empty() {
                let _ = store.clear(key);
            } else {
                store.append(key, value)?;
            }
        }
        Ok(store)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| LxkitError::io(path, e))?;
        let store = Self::parse(&content)?;
        tracing::debug!(path = %path.display(), keys = store.len(), "config loaded");
        Ok(store)
    }

    /// Writes the configuration to `path`, replacing it atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or renamed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| LxkitError::InvalidArgument {
                message: format!("config path {} has no file name", path.display()),
            })?
            .to_string_lossy();
        let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, self.render()).map_err(|e| LxkitError::io(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(LxkitError::io(path, e));
        }
        tracing::debug!(path = %path.display(), keys = self.len(), "config saved");
        Ok(())
    }

    /// Serializes the store in the on-disk format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, values) in &self.entries {
            for value in values {
                let _ = writeln!(out, "{key} = {value}");
            }
        }
        out
    }

    /// Returns the values of `key`, empty when it is unset.
    #[must_use]
    pub fn get(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the first value of `key`.
    #[must_use]
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key).first().map(String::as_str)
    }

    /// Adds a value to the end of `key`'s list.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value cannot be represented on disk.
    pub fn append(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        validate_value(key, value)?;
        self.entries
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    /// Replaces every value of `key` with `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value cannot be represented on disk.
    pub fn replace(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        validate_value(key, value)?;
        let _ = self.entries.insert(key.to_string(), vec![value.to_string()]);
        Ok(())
    }

    /// Sets `key`, appending when `multi_valued` and replacing otherwise.
    /// An empty value clears the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key or value cannot be represented on disk.
    pub fn set(&mut self, key: &str, value: &str, multi_valued: bool) -> Result<()> {
        if value.is_empty() {
            validate_key(key)?;
            let _ = self.clear(key);
            return Ok(());
        }
        if multi_valued {
            self.append(key, value)
        } else {
            self.replace(key, value)
        }
    }

    /// Removes every value of `key`. Returns whether anything was removed.
    pub fn clear(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Lists the child segments directly below `prefix`, in key order.
    ///
    /// `keys("lxc.network.0")` on a store holding `lxc.network.0.type` and
    /// `lxc.network.0.mtu` yields `["mtu", "type"]`. An empty prefix lists
    /// the top-level segments.
    #[must_use]
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.trim_end_matches('.');
        let mut children: Vec<String> = Vec::new();
        for key in self.entries.keys() {
            let rest = if prefix.is_empty() {
                key.as_str()
            } else {
                match key.strip_prefix(prefix).and_then(|r| r.strip_prefix('.')) {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            let child = rest.split('.').next().unwrap_or(rest);
            if !children.iter().any(|c| c == child) {
                children.push(child.to_string());
            }
        }
        children
    }

    /// Iterates over every key and its values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }

    /// Rewrites every value starting with `from` to start with `to` instead.
    pub fn rewrite_prefix(&mut self, from: &str, to: &str) {
        for value in self.entries.values_mut().flatten() {
            if let Some(rest) = value.strip_prefix(from) {
                *value = format!("{to}{rest}");
            }
        }
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_key(key: &str) -> Result<()> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.ends_with('.')
        || key.chars().any(|c| c.is_whitespace() || c == '=' || c == '#');
    if bad {
        return Err(LxkitError::InvalidArgument {
            message: format!("invalid config key {key:?}"),
        });
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    if value.contains(['\n', '\r']) {
        return Err(LxkitError::InvalidArgument {
            message: format!("value for {key} must not contain a line break"),
        });
    }
    if value.trim() != value || value.is_empty() {
        return Err(LxkitError::InvalidArgument {
            message: format!("value for {key} must be non-empty without surrounding whitespace"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# generated by the busybox template
lxc.utsname = rubik
lxc.network.0.type = veth
lxc.network.0.link = lxcbr0
lxc.network.0.mtu = 1500
lxc.network.0.ipv4 = 10.0.3.2/24
lxc.network.0.ipv4 = 10.0.3.3/24

lxc.cap.drop = sys_module
lxc.cap.drop = mac_admin
";

    #[test]
    fn parse_keeps_value_order() {
        let store = ConfigStore::parse(SAMPLE).expect("parse");
        assert_eq!(store.get("lxc.utsname"), ["rubik"]);
        assert_eq!(store.get("lxc.cap.drop"), ["sys_module", "mac_admin"]);
        assert_eq!(store.get("lxc.network.0.ipv4"), ["10.0.3.2/24", "10.0.3.3/24"]);
    }

    #[test]
    fn unset_key_is_empty_not_error() {
        let store = ConfigStore::parse(SAMPLE).expect("parse");
        assert!(store.get("lxc.rootfs").is_empty());
        assert_eq!(store.first("lxc.rootfs"), None);
    }

    #[test]
    fn empty_value_line_clears_key() {
        let store = ConfigStore::parse("lxc.cap.drop = a\nlxc.cap.drop =\nlxc.cap.drop = b\n")
            .expect("parse");
        assert_eq!(store.get("lxc.cap.drop"), ["b"]);
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let err = ConfigStore::parse("lxc.utsname = a\nnot a pair\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn set_appends_only_for_multi_valued_keys() {
        let mut store = ConfigStore::new();
        store.set("lxc.cap.drop", "v1", true).expect("set");
        store.set("lxc.cap.drop", "v2", true).expect("set");
        store.set("lxc.utsname", "a", false).expect("set");
        store.set("lxc.utsname", "b", false).expect("set");
        assert_eq!(store.get("lxc.cap.drop"), ["v1", "v2"]);
        assert_eq!(store.get("lxc.utsname"), ["b"]);
    }

    #[test]
    fn set_empty_value_clears() {
        let mut store = ConfigStore::parse(SAMPLE).expect("parse");
        store.set("lxc.cap.drop", "", true).expect("clear");
        assert!(store.get("lxc.cap.drop").is_empty());
    }

    #[test]
    fn values_with_line_breaks_are_rejected() {
        let mut store = ConfigStore::new();
        assert!(store.append("lxc.environment", "A=1\nB=2").is_err());
        assert!(store.append("bad key", "x").is_err());
        assert!(store.append("lxc.", "x").is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn keys_lists_direct_children() {
        let store = ConfigStore::parse(SAMPLE).expect("parse");
        assert_eq!(store.keys("lxc.network.0"), ["ipv4", "link", "mtu", "type"]);
        assert_eq!(store.keys("lxc.network"), ["0"]);
        assert_eq!(store.keys(""), ["lxc"]);
        assert_eq!(store.keys("lxc"), ["cap", "network", "utsname"]);
        assert!(store.keys("lxc.mount").is_empty());
    }

    #[test]
    fn keys_does_not_match_partial_segments() {
        let store = ConfigStore::parse("lxc.network.10.type = veth\nlxc.network.1.type = veth\n")
            .expect("parse");
        assert_eq!(store.keys("lxc.network.1"), ["type"]);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        let store = ConfigStore::parse(SAMPLE).expect("parse");
        store.save(&path).expect("save");
        let loaded = ConfigStore::load(&path).expect("load");
        assert_eq!(loaded, store);
    }

    #[test]
    fn save_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        ConfigStore::parse(SAMPLE).expect("parse").save(&path).expect("save");
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names, ["config"]);
    }

    #[test]
    fn rewrite_prefix_moves_paths() {
        let mut store = ConfigStore::new();
        store.replace("lxc.rootfs", "/var/lib/lxkit/.a.creating/rootfs").expect("set");
        store.replace("lxc.utsname", "a").expect("set");
        store.rewrite_prefix("/var/lib/lxkit/.a.creating", "/var/lib/lxkit/a");
        assert_eq!(store.first("lxc.rootfs"), Some("/var/lib/lxkit/a/rootfs"));
        assert_eq!(store.first("lxc.utsname"), Some("a"));
    }

    #[test]
    fn multi_valued_key_policy() {
        assert!(is_multi_valued_key("lxc.cap.drop"));
        assert!(is_multi_valued_key("lxc.hook.pre-start"));
        assert!(is_multi_valued_key("lxc.network.3.ipv6"));
        assert!(!is_multi_valued_key("lxc.network.3.mtu"));
        assert!(!is_multi_valued_key("lxc.network.x.ipv4"));
        assert!(!is_multi_valued_key("lxc.utsname"));
    }
}
