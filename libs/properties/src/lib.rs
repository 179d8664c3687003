//! Grid runtime properties format.
//!
//! Every grid node and driver reads its settings from a flat properties file
//! in the Java style the runtime expects:
//!
//! ```text
//! # grid node configuration generated by gridwright
//! jppf.server.host=10.0.0.12
//! processing.threads=4
//! ```
//!
//! Key names are a contract with the grid runtime and are rendered verbatim;
//! the well-known ones live in [`keys`]. Rendering is deterministic (keys are
//! sorted) so two renders of the same settings are byte-identical.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Keys understood by the grid runtime.
pub mod keys {
    pub const SERVER_HOST: &str = "jppf.server.host";
    pub const SERVER_PORT: &str = "jppf.server.port";
    pub const MANAGEMENT_HOST: &str = "jppf.management.host";
    pub const MANAGEMENT_PORT: &str = "jppf.management.port";
    pub const MANAGEMENT_ENABLED: &str = "jppf.management.enabled";
    pub const DISCOVERY_ENABLED: &str = "jppf.discovery.enabled";
    pub const PROCESSING_THREADS: &str = "processing.threads";
    pub const RESOURCE_CACHE_DIR: &str = "jppf.resource.cache.dir";
    pub const JVM_OPTIONS: &str = "jppf.jvm.options";
    pub const CLASSLOADER_DELEGATION: &str = "jppf.classloader.delegation";
    pub const RECONNECT_MAX_TIME: &str = "jppf.reconnect.max.time";
    pub const RECONNECT_INTERVAL: &str = "jppf.reconnect.interval";
}

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 256;

/// Properties format errors.
#[derive(Debug, Error)]
pub enum PropertiesError {
    /// Invalid key.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// Parse error.
    #[error("parse error at line {line}: {reason}")]
    ParseError { line: usize, reason: String },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// An ordered set of grid runtime properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    header: Option<String>,
    inner: BTreeMap<String, String>,
}

impl Properties {
    /// Create an empty property set without a header comment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty property set rendered with a leading `#` comment.
    pub fn with_header(header: impl Into<String>) -> Self {
        Self {
            header: Some(header.into()),
            inner: BTreeMap::new(),
        }
    }

    /// Header comment, if any.
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Set a property, returning the previous value.
    pub fn set<K: Into<String>, V: Into<String>>(
        &mut self,
        key: K,
        value: V,
    ) -> Result<Option<String>, PropertiesError> {
        let key = key.into();
        validate_key(&key)?;
        Ok(self.inner.insert(key, value.into()))
    }

    /// Get a property value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterate over key-value pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render to the text format read by the grid runtime.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(header) = &self.header {
            for line in header.lines() {
                out.push_str("# ");
                out.push_str(line);
                out.push('\n');
            }
        }

        for (key, value) in &self.inner {
            out.push_str(&escape(key, true));
            out.push('=');
            out.push_str(&escape(value, false));
            out.push('\n');
        }

        out
    }

    /// SHA-256 digest of the rendered text, for logging which config a node got.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render().as_bytes());
        format!("sha256:{}", hex::encode(&hasher.finalize()[..8]))
    }

    /// Parse the properties text format.
    ///
    /// Comment lines (`#`, `!`) are skipped; the first comment block becomes
    /// the header. Both `=` and `:` are accepted as separators and a trailing
    /// backslash continues the logical line.
    pub fn parse(content: &str) -> Result<Self, PropertiesError> {
        let mut props = Self::new();
        let mut header: Vec<&str> = Vec::new();
        let mut seen_entry = false;
        let mut pending: Option<(usize, String)> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line_num = idx + 1;
            let line = raw.trim_start();

            if let Some((start, mut acc)) = pending.take() {
                acc.push_str(line);
                if ends_with_continuation(&acc) {
                    acc.pop();
                    pending = Some((start, acc));
                } else {
                    parse_entry(start, &acc, &mut props)?;
                }
                continue;
            }

            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') || line.starts_with('!') {
                if !seen_entry {
                    header.push(line[1..].trim());
                }
                continue;
            }

            seen_entry = true;
            if ends_with_continuation(line) {
                pending = Some((line_num, line[..line.len() - 1].to_string()));
            } else {
                parse_entry(line_num, line, &mut props)?;
            }
        }

        if let Some((start, acc)) = pending {
            parse_entry(start, &acc, &mut props)?;
        }

        if !header.is_empty() {
            props.header = Some(header.join("\n"));
        }
        Ok(props)
    }

    /// Write to `path` via a sibling temp file and rename, so a node never
    /// reads a half-written configuration.
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), PropertiesError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(self.render().as_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Check that `key` can be written and parsed back.
pub fn validate_key(key: &str) -> Result<(), PropertiesError> {
    if key.trim().is_empty() {
        return Err(PropertiesError::InvalidKey {
            key: key.to_string(),
            reason: "key cannot be empty".to_string(),
        });
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(PropertiesError::InvalidKey {
            key: key.to_string(),
            reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
        });
    }

    if let Some(c) = key.chars().find(|c| c.is_control()) {
        return Err(PropertiesError::InvalidKey {
            key: key.to_string(),
            reason: format!("control character {:?} in key", c),
        });
    }

    Ok(())
}

/// Escape a key or value. Keys additionally escape separators and spaces.
fn escape(s: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' | ':' | '#' | '!' if is_key => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

fn ends_with_continuation(line: &str) -> bool {
    let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
    trailing % 2 == 1
}

/// Find the first unescaped separator (`=` or `:`).
fn split_entry(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => return Some((&line[..i], &line[i + 1..])),
            _ => {}
        }
    }
    None
}

fn parse_entry(line_num: usize, line: &str, props: &mut Properties) -> Result<(), PropertiesError> {
    let Some((key, value)) = split_entry(line) else {
        return Err(PropertiesError::ParseError {
            line: line_num,
            reason: "expected key=value format".to_string(),
        });
    };

    let key = unescape(key.trim_end());
    let value = unescape(value.trim_start());

    props
        .set(key, value)
        .map_err(|e| PropertiesError::ParseError {
            line: line_num,
            reason: e.to_string(),
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_sorted_with_header() {
        let mut props = Properties::with_header("grid node configuration");
        props.set(keys::PROCESSING_THREADS, "4").unwrap();
        props.set(keys::SERVER_HOST, "10.0.0.1").unwrap();

        assert_eq!(
            props.render(),
            "# grid node configuration\njppf.server.host=10.0.0.1\nprocessing.threads=4\n"
        );
    }

    #[test]
    fn test_jvm_options_keep_inner_spaces() {
        let mut props = Properties::new();
        props.set(keys::JVM_OPTIONS, "-Xmx512m -Xms64m").unwrap();
        assert_eq!(props.render(), "jppf.jvm.options=-Xmx512m -Xms64m\n");
    }

    #[test]
    fn test_escape_key_separators() {
        assert_eq!(escape("a=b:c", true), "a\\=b\\:c");
        assert_eq!(escape(" lead", false), "\\ lead");
        assert_eq!(escape("C:\\tmp", false), "C:\\\\tmp");
    }

    #[test]
    fn test_parse_separators_and_comments() {
        let content = "# generated\n! legacy\nfoo=bar\nbaz: qux\n\n# trailing\nempty=\n";
        let props = Properties::parse(content).unwrap();
        assert_eq!(props.header(), Some("generated\nlegacy"));
        assert_eq!(props.get("foo"), Some("bar"));
        assert_eq!(props.get("baz"), Some("qux"));
        assert_eq!(props.get("empty"), Some(""));
        assert_eq!(props.len(), 3);
    }

    #[test]
    fn test_parse_continuation() {
        let props = Properties::parse("jppf.jvm.options=-Xmx1g \\\n  -Dfoo=bar\n").unwrap();
        assert_eq!(props.get(keys::JVM_OPTIONS), Some("-Xmx1g -Dfoo=bar"));
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let result = Properties::parse("just-a-key\n");
        assert!(matches!(
            result,
            Err(PropertiesError::ParseError { line: 1, .. })
        ));
    }

    #[test]
    fn test_render_parse_preserves_escapes() {
        let mut props = Properties::new();
        props.set("path", "C:\\grid\\cache").unwrap();
        props.set("odd key=1", "x").unwrap();

        let parsed = Properties::parse(&props.render()).unwrap();
        assert_eq!(parsed.get("path"), Some("C:\\grid\\cache"));
        assert_eq!(parsed.get("odd key=1"), Some("x"));
    }

    #[test]
    fn test_digest_is_stable() {
        let mut a = Properties::new();
        a.set("b", "2").unwrap();
        a.set("a", "1").unwrap();
        let mut b = Properties::new();
        b.set("a", "1").unwrap();
        b.set("b", "2").unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_invalid_key() {
        assert!(Properties::new().set("", "x").is_err());
        assert!(Properties::new().set("a\nb", "x").is_err());
    }

    #[test]
    fn test_write_to_file_creates_parent_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("grid-node.properties");

        let mut props = Properties::with_header("test");
        props.set(keys::MANAGEMENT_PORT, "12001").unwrap();
        props.write_to_file(&path).unwrap();
        props.set(keys::MANAGEMENT_PORT, "12002").unwrap();
        props.write_to_file(&path).unwrap();

        let read = Properties::parse(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read.get(keys::MANAGEMENT_PORT), Some("12002"));
        assert!(!path.with_extension("tmp").exists());
    }
}
