//! Per-container key-value persistence.
//!
//! Every container owns one record file at `<kv-root>/<id>` holding
//! escape-encoded `key=value` lines. The `state` key is written last so
//! a torn write can never be restored as a running container. Records
//! are rewritten through a temp-file-plus-rename so readers never see a
//! partial file.

use crate::constants::{KV_KEY_ID, KV_KEY_NAME, KV_KEY_STATE};
use crate::error::{Error, ErrorKind, Result};
use crate::path::HostPath;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Upper bound for one record file.
const RECORD_MAX: usize = 1024 * 1024;

/// An unordered key-value record for one container.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub id: u32,
    pub name: String,
    pairs: BTreeMap<String, String>,
}

impl Record {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            pairs: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    pub fn has(&self, key: &str) -> bool {
        self.pairs.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of name components; parents sort before children.
    pub fn depth(&self) -> usize {
        self.name.split('/').count()
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}={}\n", KV_KEY_ID, self.id));
        out.push_str(&format!("{}={}\n", KV_KEY_NAME, escape(&self.name)));
        for (key, value) in &self.pairs {
            if key == KV_KEY_STATE {
                continue;
            }
            out.push_str(&format!("{}={}\n", key, escape(value)));
        }
        // state goes last so partial writes never restore as running
        if let Some(state) = self.pairs.get(KV_KEY_STATE) {
            out.push_str(&format!("{}={}\n", KV_KEY_STATE, escape(state)));
        }
        out
    }

    fn parse(text: &str) -> Result<Self> {
        let mut record = Record::default();
        let mut seen_id = false;
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line, "malformed record line, skipped");
                continue;
            };
            let value = unescape(value);
            match key {
                KV_KEY_ID => {
                    record.id = value.parse().map_err(|_| {
                        Error::new(ErrorKind::Unknown, format!("bad record id: {}", value))
                    })?;
                    seen_id = true;
                }
                KV_KEY_NAME => record.name = value,
                _ => {
                    record.pairs.insert(key.to_string(), value);
                }
            }
        }
        if !seen_id || record.name.is_empty() {
            return Err(Error::new(ErrorKind::Unknown, "record without id or name"));
        }
        Ok(record)
    }
}

/// The record directory.
#[derive(Debug, Clone)]
pub struct KvStore {
    root: HostPath,
}

impl KvStore {
    /// Opens the store, creating the root directory if needed.
    pub fn open(root: HostPath) -> Result<Self> {
        if !root.exists() {
            root.mkdir_all(0o700)?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &HostPath {
        &self.root
    }

    fn record_path(&self, id: u32) -> HostPath {
        self.root.join(id.to_string())
    }

    /// Atomically writes a record.
    pub fn save(&self, record: &Record) -> Result<()> {
        let path = self.record_path(record.id);
        let tmp = self.root.join(format!(".{}.tmp", record.id));
        std::fs::write(tmp.as_path(), record.render())
            .map_err(|e| Error::from(e).context(format!("write {}", tmp)))?;
        tmp.rename(&path)?;
        debug!(id = record.id, name = %record.name, "record saved");
        Ok(())
    }

    pub fn load(&self, id: u32) -> Result<Record> {
        let path = self.record_path(id);
        let text = path.read_all(RECORD_MAX)?;
        let record = Record::parse(&text)?;
        if record.id != id {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("record {} claims id {}", id, record.id),
            ));
        }
        Ok(record)
    }

    pub fn remove(&self, id: u32) -> Result<()> {
        self.record_path(id).unlink()
    }

    /// Loads every record, parents before children.
    pub fn list(&self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for name in self.root.list_names()? {
            let Ok(id) = name.parse::<u32>() else {
                if !name.starts_with('.') {
                    warn!(name, "foreign file in record directory");
                }
                continue;
            };
            match self.load(id) {
                Ok(record) => records.push(record),
                Err(err) => warn!(id, error = %err, "unreadable record, skipped"),
            }
        }
        records.sort_by(|a, b| a.depth().cmp(&b.depth()).then(a.name.cmp(&b.name)));
        Ok(records)
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ch => out.push(ch),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_roundtrip() {
        for value in ["plain", "multi\nline", "back\\slash", "mix\\n\n\r"] {
            assert_eq!(unescape(&escape(value)), value);
        }
    }

    #[test]
    fn test_state_rendered_last() {
        let mut record = Record::new(3, "a/b");
        record.set(KV_KEY_STATE, "running");
        record.set("command", "sleep 1");
        record.set("zz_custom", "x");
        let text = record.render();
        let last = text.lines().last().unwrap();
        assert!(last.starts_with("state="), "got {}", last);
    }

    #[test]
    fn test_parse_preserves_unknown_keys() {
        let mut record = Record::new(7, "x");
        record.set("future_knob", "42");
        let parsed = Record::parse(&record.render()).unwrap();
        assert_eq!(parsed.get("future_knob"), Some("42"));
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.name, "x");
    }

    #[test]
    fn test_depth_ordering() {
        assert!(Record::new(1, "a").depth() < Record::new(2, "a/b").depth());
    }
}
