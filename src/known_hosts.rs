//! OpenSSH-compatible `known_hosts` trust store with full round-trip
//! persistence.
//!
//! The file is read wholesale into memory and rewritten wholesale on save.
//! Comment and blank lines survive a load/save cycle byte-identical; record
//! lines survive identically except that comma-joined host lists are split
//! one host per line (bare IPs first, then the remaining hosts in reverse
//! of their original order), the separators between the host, key-type, and
//! key fields normalize to a single space each, and tab separators become
//! single spaces. Everything after the key blob is preserved byte-exact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{HarborError, Result};

/// How a record's host field is encoded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// Hostname(s) in the clear, possibly comma-joined.
    Plain,
    /// `|1|salt|digest` SHA1-HMAC encoding; the hostname is unrecoverable.
    Hashed,
    /// Opaque application-defined name, stored as-is.
    Custom,
}

/// Outcome of a trust-store lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindResult {
    /// An entry for the host carries exactly this key.
    Match,
    /// An entry for the host exists with a different key of the same type.
    Mismatch,
    /// No entry for the host (for this key type).
    NotFound,
}

#[derive(Debug)]
struct EntryInner {
    kind: NameKind,
    /// Plain/custom: one or more host names. Hashed: the single `|1|...` token.
    names: Vec<String>,
    key_type: String,
    key_b64: String,
    /// Everything after the key blob, leading separator included.
    rest: String,
}

/// One trust-store record. Handles share ownership of the underlying data,
/// so an entry fetched from a store stays valid after the store is dropped.
#[derive(Debug, Clone)]
pub struct HostKeyEntry {
    inner: Arc<EntryInner>,
}

impl HostKeyEntry {
    /// Host name(s) as written. Empty for hashed entries: the encoding is
    /// one-way and the original name cannot be recovered.
    pub fn name(&self) -> String {
        match self.inner.kind {
            NameKind::Hashed => String::new(),
            NameKind::Plain | NameKind::Custom => self.inner.names.join(","),
        }
    }

    pub fn kind(&self) -> NameKind {
        self.inner.kind
    }

    pub fn key_type(&self) -> &str {
        &self.inner.key_type
    }

    /// Base64 key blob.
    pub fn key(&self) -> &str {
        &self.inner.key_b64
    }

    /// Trailing comment, if any.
    pub fn comment(&self) -> Option<&str> {
        let trimmed = self.inner.rest.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// True if this entry's host field covers `host`.
    fn covers(&self, host: &str) -> bool {
        match self.inner.kind {
            NameKind::Plain | NameKind::Custom => {
                self.inner.names.iter().any(|n| n == host)
            }
            NameKind::Hashed => hashed_name_matches(&self.inner.names[0], host),
        }
    }
}

#[derive(Debug)]
enum StoreLine {
    Entry(HostKeyEntry),
    /// Blank lines, `#` comments and `@`-marker lines, preserved byte-exact.
    Verbatim(String),
}

/// In-memory `known_hosts` collection bound to a file path.
#[derive(Debug)]
pub struct KnownHostsStore {
    lines: RwLock<Vec<StoreLine>>,
    path: PathBuf,
}

impl KnownHostsStore {
    /// Open the store at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = Self {
            lines: RwLock::new(Vec::new()),
            path,
        };
        store.load()?;
        Ok(store)
    }

    /// Open `~/.ssh/known_hosts`.
    pub fn open_default() -> Result<Self> {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from(".ssh/known_hosts"));
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "known_hosts file absent, starting empty");
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let mut lines = Vec::new();
        for (idx, raw) in content.lines().enumerate() {
            lines.push(parse_line(raw, idx + 1)?);
        }
        let entry_count = lines
            .iter()
            .filter(|l| matches!(l, StoreLine::Entry(_)))
            .count();
        debug!(
            path = %self.path.display(),
            entries = entry_count,
            "Loaded known_hosts"
        );
        *self.lines.write() = lines;
        Ok(())
    }

    /// Look up `host` for a key of `key_type`.
    ///
    /// `Match` wins over `Mismatch` when the host appears on several lines,
    /// so a rotated-then-re-added key still verifies.
    pub fn find(&self, host: &str, key_type: &str, key_b64: &str) -> FindResult {
        let lines = self.lines.read();
        let mut saw_other_key = false;
        for line in lines.iter() {
            let StoreLine::Entry(entry) = line else {
                continue;
            };
            if entry.inner.key_type != key_type || !entry.covers(host) {
                continue;
            }
            if entry.inner.key_b64 == key_b64 {
                return FindResult::Match;
            }
            saw_other_key = true;
        }
        if saw_other_key {
            FindResult::Mismatch
        } else {
            FindResult::NotFound
        }
    }

    /// The stored base64 key blob for `host`, if one exists for `key_type`.
    pub fn stored_key(&self, host: &str, key_type: &str) -> Option<String> {
        self.lines.read().iter().find_map(|line| match line {
            StoreLine::Entry(entry)
                if entry.inner.key_type == key_type && entry.covers(host) =>
            {
                Some(entry.inner.key_b64.clone())
            }
            _ => None,
        })
    }

    /// Append a plain-name entry.
    pub fn add(&self, host: &str, key_type: &str, key_b64: &str, comment: Option<&str>) {
        self.push_entry(NameKind::Plain, vec![host.to_string()], key_type, key_b64, comment);
    }

    /// Append an entry whose host name is stored as a salted SHA1-HMAC.
    pub fn add_hashed(&self, host: &str, key_type: &str, key_b64: &str, comment: Option<&str>) {
        let token = hash_host_name(host);
        self.push_entry(NameKind::Hashed, vec![token], key_type, key_b64, comment);
    }

    /// Append an entry with an opaque caller-defined name.
    pub fn add_custom(&self, name: &str, key_type: &str, key_b64: &str, comment: Option<&str>) {
        self.push_entry(NameKind::Custom, vec![name.to_string()], key_type, key_b64, comment);
    }

    fn push_entry(
        &self,
        kind: NameKind,
        names: Vec<String>,
        key_type: &str,
        key_b64: &str,
        comment: Option<&str>,
    ) {
        let rest = match comment {
            Some(c) => format!(" {c}"),
            None => String::new(),
        };
        let entry = HostKeyEntry {
            inner: Arc::new(EntryInner {
                kind,
                names,
                key_type: key_type.to_string(),
                key_b64: key_b64.to_string(),
                rest,
            }),
        };
        self.lines.write().push(StoreLine::Entry(entry));
    }

    /// Remove every entry of `key_type` covering `host`. Returns how many
    /// were removed. A multi-host line loses only the matching name.
    pub fn erase(&self, host: &str, key_type: &str) -> usize {
        let mut lines = self.lines.write();
        let mut removed = 0;
        let mut out = Vec::with_capacity(lines.len());
        for line in lines.drain(..) {
            match line {
                StoreLine::Entry(entry)
                    if entry.inner.key_type == key_type && entry.covers(host) =>
                {
                    removed += 1;
                    if entry.inner.kind == NameKind::Plain && entry.inner.names.len() > 1 {
                        let names: Vec<String> = entry
                            .inner
                            .names
                            .iter()
                            .filter(|n| n.as_str() != host)
                            .cloned()
                            .collect();
                        out.push(StoreLine::Entry(HostKeyEntry {
                            inner: Arc::new(EntryInner {
                                kind: NameKind::Plain,
                                names,
                                key_type: entry.inner.key_type.clone(),
                                key_b64: entry.inner.key_b64.clone(),
                                rest: entry.inner.rest.clone(),
                            }),
                        }));
                    }
                }
                other => out.push(other),
            }
        }
        *lines = out;
        if removed > 0 {
            debug!(host = %host, key_type = %key_type, removed, "Erased trust entries");
        }
        removed
    }

    /// Accept a rotated key: erase the old entries for `host`, then add.
    pub fn update(&self, host: &str, key_type: &str, key_b64: &str) {
        self.erase(host, key_type);
        self.add(host, key_type, key_b64, None);
    }

    /// Shared-ownership handles to every record, in file order.
    pub fn entries(&self) -> Vec<HostKeyEntry> {
        self.lines
            .read()
            .iter()
            .filter_map(|l| match l {
                StoreLine::Entry(e) => Some(e.clone()),
                StoreLine::Verbatim(_) => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the whole file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut out = String::new();
        for line in self.lines.read().iter() {
            match line {
                StoreLine::Verbatim(raw) => {
                    out.push_str(raw);
                    out.push('\n');
                }
                StoreLine::Entry(entry) => {
                    for name in split_order(&entry.inner.names) {
                        out.push_str(name);
                        out.push(' ');
                        out.push_str(&entry.inner.key_type);
                        out.push(' ');
                        out.push_str(&entry.inner.key_b64);
                        out.push_str(&entry.inner.rest);
                        out.push('\n');
                    }
                }
            }
        }
        std::fs::write(&self.path, out)?;
        debug!(path = %self.path.display(), "Saved known_hosts");
        Ok(())
    }
}

/// Host order for a multi-host line split across physical lines: reverse of
/// the original order, with bare IP addresses moved to the front.
fn split_order(names: &[String]) -> Vec<&String> {
    let mut out: Vec<&String> = names.iter().rev().collect();
    out.sort_by_key(|n| n.parse::<std::net::IpAddr>().is_err());
    out
}

fn parse_line(raw: &str, lineno: usize) -> Result<StoreLine> {
    let trimmed = raw.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('@') {
        return Ok(StoreLine::Verbatim(raw.to_string()));
    }

    let Some((names_s, names_e)) = next_field(raw, 0) else {
        return Ok(StoreLine::Verbatim(raw.to_string()));
    };
    let Some((type_s, type_e)) = next_field(raw, names_e) else {
        return Err(parse_err(lineno, "missing key type"));
    };
    let Some((key_s, key_e)) = next_field(raw, type_e) else {
        return Err(parse_err(lineno, "missing key data"));
    };

    let names_field = &raw[names_s..names_e];
    let (kind, names) = if names_field.starts_with("|1|") {
        (NameKind::Hashed, vec![names_field.to_string()])
    } else if names_field.starts_with('|') {
        return Err(parse_err(lineno, "unsupported hashed-name version"));
    } else {
        let names: Vec<String> = names_field.split(',').map(str::to_string).collect();
        if names.iter().any(String::is_empty) {
            return Err(parse_err(lineno, "empty host name in list"));
        }
        (NameKind::Plain, names)
    };

    // Tab separators normalize to single spaces; everything else in the
    // trailing segment is kept byte-exact.
    let rest = raw[key_e..].replace('\t', " ");

    Ok(StoreLine::Entry(HostKeyEntry {
        inner: Arc::new(EntryInner {
            kind,
            names,
            key_type: raw[type_s..type_e].to_string(),
            key_b64: raw[key_s..key_e].to_string(),
            rest,
        }),
    }))
}

fn parse_err(line: usize, reason: &str) -> HarborError {
    warn!(line, reason, "Malformed known_hosts line");
    HarborError::TrustStoreParse {
        line,
        reason: reason.to_string(),
    }
}

/// Byte range of the next whitespace-delimited field at or after `from`.
fn next_field(s: &str, from: usize) -> Option<(usize, usize)> {
    let rel = s[from..].find(|c: char| !c.is_whitespace())?;
    let start = from + rel;
    let end = s[start..]
        .find(char::is_whitespace)
        .map_or(s.len(), |i| start + i);
    Some((start, end))
}

/// Encode `host` as `|1|base64(salt)|base64(HMAC-SHA1(salt, host))` with a
/// fresh random 20-byte salt.
fn hash_host_name(host: &str) -> String {
    let mut salt = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = hmac_sha1(&salt, host.as_bytes());
    format!("|1|{}|{}", BASE64.encode(salt), BASE64.encode(digest))
}

fn hashed_name_matches(token: &str, host: &str) -> bool {
    let mut parts = token.splitn(4, '|').skip(2);
    let (Some(salt_b64), Some(digest_b64)) = (parts.next(), parts.next()) else {
        return false;
    };
    let (Ok(salt), Ok(digest)) = (BASE64.decode(salt_b64), BASE64.decode(digest_b64)) else {
        return false;
    };
    hmac_sha1(&salt, host.as_bytes()).as_slice() == digest.as_slice()
}

/// SHA256 fingerprint of a stored base64 key blob, for reporting on entries
/// whose original key object is long gone.
#[must_use]
pub fn fingerprint_from_blob(key_b64: &str) -> String {
    match BASE64.decode(key_b64) {
        Ok(bytes) => {
            let hash = Sha256::digest(&bytes);
            format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
        }
        Err(_) => "unknown".to_string(),
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
