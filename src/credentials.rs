//! Locally stored session cookies and the policy that decides which jar, if
//! any, goes along with a download.
//!
//! Jars use the Netscape `cookies.txt` layout exported by browser
//! extensions: one cookie per line, seven tab separated fields
//! (domain, include-subdomains, path, secure, expiry, name, value). Lines
//! starting with `#` are comments except for the `#HttpOnly_` marker, which
//! prefixes the domain of an http-only cookie.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";
const COOKIE_FIELD_COUNT: usize = 7;

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("unknown cookie slot {0:?}, expected \"instagram\" or \"facebook\"")]
    UnknownSlot(String),

    #[error("the cookie file must be UTF-8 text")]
    NotText,

    #[error("the cookie file is empty")]
    Empty,

    #[error("cookie file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookieSlot {
    Facebook,
    Instagram,
}

impl CookieSlot {
    pub const ALL: [CookieSlot; 2] = [CookieSlot::Instagram, CookieSlot::Facebook];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Self::Facebook => "fb_cookies.txt",
            Self::Instagram => "ig_cookies.txt",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Facebook => 0,
            Self::Instagram => 1,
        }
    }
}

impl fmt::Display for CookieSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CookieSlot {
    type Err = CookieError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "facebook" | "fb" => Ok(Self::Facebook),
            "instagram" | "ig" => Ok(Self::Instagram),
            other => Err(CookieError::UnknownSlot(other.to_string())),
        }
    }
}

/// Host substrings and the jar they use. Checked in order; first hit wins.
const DOMAIN_TABLE: [(&str, CookieSlot); 4] = [
    ("facebook.com", CookieSlot::Facebook),
    ("fb.watch", CookieSlot::Facebook),
    ("instagram.com", CookieSlot::Instagram),
    ("threads.net", CookieSlot::Instagram),
];

/// A jar captured on `from` is also valid on `to`.
pub struct SiblingDomain {
    pub from: &'static str,
    pub to: &'static str,
}

pub const THREADS_FROM_INSTAGRAM: SiblingDomain = SiblingDomain {
    from: "instagram.com",
    to: "threads.net",
};

/// Inputs that do not parse as URLs are matched as a whole.
pub fn match_slot(canonical_url: &str) -> Option<CookieSlot> {
    let haystack = Url::parse(canonical_url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_else(|| canonical_url.to_ascii_lowercase());

    DOMAIN_TABLE
        .iter()
        .find(|(needle, _)| haystack.contains(needle))
        .map(|(_, slot)| *slot)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCookies {
    pub slot: CookieSlot,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot: CookieSlot,
    pub present: bool,
    pub entries: usize,
}

/// Jars are replaced by rename, so readers (including the engine) always see
/// a whole file. Writers of one slot are serialized by that slot's lock.
#[derive(Debug, Clone)]
pub struct CookieStore {
    dir: PathBuf,
    locks: Arc<[Mutex<()>; 2]>,
}

impl CookieStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Arc::new([Mutex::new(()), Mutex::new(())]),
        }
    }

    pub fn path(&self, slot: CookieSlot) -> PathBuf {
        self.dir.join(slot.file_name())
    }

    pub async fn exists(&self, slot: CookieSlot) -> bool {
        tokio::fs::try_exists(self.path(slot))
            .await
            .unwrap_or(false)
    }

    pub async fn save(&self, slot: CookieSlot, bytes: &[u8]) -> Result<usize, CookieError> {
        let contents = std::str::from_utf8(bytes).map_err(|_| CookieError::NotText)?;
        if contents.trim().is_empty() {
            return Err(CookieError::Empty);
        }

        let path = self.path(slot);
        let _guard = self.locks[slot.index()].lock().await;
        write_jar(&path, bytes).await?;

        let entries = count_entries(contents);
        info!("Stored {slot} cookies ({entries} entries) at {:?}", path);
        Ok(entries)
    }

    pub async fn status(&self) -> Result<Vec<SlotStatus>, CookieError> {
        let mut statuses = Vec::with_capacity(CookieSlot::ALL.len());

        for slot in CookieSlot::ALL {
            let path = self.path(slot);
            let status = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => SlotStatus {
                    slot,
                    present: true,
                    entries: count_entries(&contents),
                },
                Err(error) if error.kind() == io::ErrorKind::NotFound => SlotStatus {
                    slot,
                    present: false,
                    entries: 0,
                },
                Err(source) => return Err(CookieError::Io { path, source }),
            };
            statuses.push(status);
        }

        Ok(statuses)
    }

    /// Picks the jar for a canonical URL. Nothing is attached when the caller
    /// opted out, the host is not in the table, or the slot was never
    /// uploaded.
    pub async fn select(&self, canonical_url: &str, use_cookies: bool) -> Option<SelectedCookies> {
        if !use_cookies {
            return None;
        }

        let slot = match_slot(canonical_url)?;
        if !self.exists(slot).await {
            debug!("No {slot} cookies stored; continuing without credentials");
            return None;
        }

        Some(SelectedCookies {
            slot,
            path: self.path(slot),
        })
    }

    /// Copies the slot's entries onto the sibling domain. The file is only
    /// rewritten when entries were actually added.
    pub async fn sync_sibling(
        &self,
        slot: CookieSlot,
        sibling: &SiblingDomain,
    ) -> Result<bool, CookieError> {
        let path = self.path(slot);
        let _guard = self.locks[slot.index()].lock().await;
        let contents = read_jar(&path).await?;

        let Some(patched) = duplicate_sibling_entries(&contents, sibling) else {
            return Ok(false);
        };

        write_jar(&path, patched.as_bytes()).await?;
        info!(
            "Duplicated {slot} cookies from {} onto {}",
            sibling.from, sibling.to
        );
        Ok(true)
    }
}

async fn read_jar(path: &Path) -> Result<String, CookieError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CookieError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_jar(path: &Path, bytes: &[u8]) -> Result<(), CookieError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let io_error = |source| CookieError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Err(source) = tokio::fs::write(&temp, bytes).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(io_error(source));
    }
    if let Err(source) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(io_error(source));
    }
    Ok(())
}

/// Splits a jar line into its `#HttpOnly_` marker, the domain field and the
/// remaining tab separated fields. Comments, blanks and short lines yield
/// `None`.
fn split_entry(line: &str) -> Option<(&'static str, &str, &str)> {
    let (marker, body) = match line.strip_prefix(HTTP_ONLY_PREFIX) {
        Some(stripped) => (HTTP_ONLY_PREFIX, stripped),
        None if line.starts_with('#') => return None,
        None => ("", line),
    };

    if body.trim().is_empty() || body.split('\t').count() < COOKIE_FIELD_COUNT {
        return None;
    }

    let (domain, rest) = body.split_once('\t')?;
    Some((marker, domain, rest))
}

fn count_entries(contents: &str) -> usize {
    contents
        .lines()
        .filter(|line| split_entry(line).is_some())
        .count()
}

/// Returns the jar with every `sibling.from` entry repeated for
/// `sibling.to`, or `None` when there is nothing to add. A jar that already
/// holds any `sibling.to` entry is left alone, which keeps repeated runs
/// from stacking duplicates.
pub fn duplicate_sibling_entries(contents: &str, sibling: &SiblingDomain) -> Option<String> {
    let entries: Vec<_> = contents.lines().filter_map(split_entry).collect();

    if entries
        .iter()
        .any(|(_, domain, _)| domain.to_ascii_lowercase().contains(sibling.to))
    {
        return None;
    }

    let duplicates: Vec<String> = entries
        .iter()
        .filter_map(|(marker, domain, rest)| {
            let stem = strip_suffix_ignore_case(domain, sibling.from)?;
            Some(format!("{marker}{stem}{}\t{rest}", sibling.to))
        })
        .collect();

    if duplicates.is_empty() {
        return None;
    }

    let mut patched = String::with_capacity(contents.len() + duplicates.len() * 64);
    patched.push_str(contents);
    if !patched.ends_with('\n') {
        patched.push('\n');
    }
    for line in duplicates {
        patched.push_str(&line);
        patched.push('\n');
    }

    Some(patched)
}

fn strip_suffix_ignore_case<'a>(value: &'a str, suffix: &str) -> Option<&'a str> {
    let split = value.len().checked_sub(suffix.len())?;
    if !value.is_char_boundary(split) {
        return None;
    }
    let (stem, tail) = value.split_at(split);
    tail.eq_ignore_ascii_case(suffix).then_some(stem)
}
