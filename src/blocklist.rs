//! Reloadable domain block-list (spec §4.6).

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::RwLock,
    time::{Duration, SystemTime},
};

use tracing::{debug, warn};

/// How often [`BlockList::maybe_reload`] is allowed to actually touch the
/// filesystem, debouncing bursts of calls from concurrent requests.
const RELOAD_DEBOUNCE: Duration = Duration::from_secs(5);

struct Inner {
    domains: HashSet<String>,
    mtime: Option<SystemTime>,
    last_checked: Option<SystemTime>,
}

/// A reloadable set of blocked host strings with substring-suffix semantics.
///
/// `Contains(host)` is true when any entry equals `host`, or any entry is a
/// dot-separated suffix of it, so blocking `evil.example` also blocks
/// `social.evil.example`.
pub struct BlockList {
    path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

impl BlockList {
    /// Builds a block-list backed by `path`. The file is not read until the
    /// first call to [`BlockList::maybe_reload`] or [`BlockList::contains`]
    /// if nothing has been loaded yet.
    pub fn new(path: Option<PathBuf>) -> Self {
        let mut list = BlockList {
            path,
            inner: RwLock::new(Inner {
                domains: HashSet::new(),
                mtime: None,
                last_checked: None,
            }),
        };
        list.reload_now();
        list
    }

    /// Builds a block-list from an explicit in-memory set, bypassing the file.
    pub fn from_domains(domains: impl IntoIterator<Item = String>) -> Self {
        BlockList {
            path: None,
            inner: RwLock::new(Inner {
                domains: domains.into_iter().collect(),
                mtime: None,
                last_checked: None,
            }),
        }
    }

    /// Returns true if `host` is blocked: an exact match, or a dot-suffix
    /// match against a blocked domain. A trailing `.` on `host` is stripped
    /// first.
    pub fn contains(&self, host: &str) -> bool {
        let host = host.strip_suffix('.').unwrap_or(host);
        let inner = self.inner.read().expect("blocklist lock poisoned");
        inner.domains.iter().any(|blocked| {
            host == blocked || host.ends_with(&format!(".{blocked}"))
        })
    }

    /// Reloads from disk if the debounce window has elapsed and the file's
    /// mtime changed since the last load. An empty reload over a previously
    /// non-empty list is ignored, guarding against a crash leaving a
    /// truncated file on disk.
    pub fn maybe_reload(&self) {
        let Some(path) = &self.path else { return };
        let now = SystemTime::now();
        {
            let inner = self.inner.read().expect("blocklist lock poisoned");
            if let Some(last_checked) = inner.last_checked {
                if now.duration_since(last_checked).unwrap_or_default() < RELOAD_DEBOUNCE {
                    return;
                }
            }
        }
        let Ok(metadata) = std::fs::metadata(path) else {
            warn!("block-list file {} is unreadable, keeping previous list", path.display());
            self.inner.write().expect("blocklist lock poisoned").last_checked = Some(now);
            return;
        };
        let mtime = metadata.modified().ok();
        {
            let inner = self.inner.read().expect("blocklist lock poisoned");
            if mtime.is_some() && mtime == inner.mtime {
                return;
            }
        }
        self.load_from_path(path, mtime, now);
    }

    fn reload_now(&mut self) {
        let Some(path) = self.path.clone() else { return };
        let mtime = std::fs::metadata(&path).ok().and_then(|m| m.modified().ok());
        self.load_from_path(&path, mtime, SystemTime::now());
    }

    fn load_from_path(&self, path: &PathBuf, mtime: Option<SystemTime>, checked_at: SystemTime) {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) => {
                warn!("failed to read block-list {}: {err}", path.display());
                self.inner.write().expect("blocklist lock poisoned").last_checked = Some(checked_at);
                return;
            }
        };
        let domains: HashSet<String> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_owned)
            .collect();

        let mut inner = self.inner.write().expect("blocklist lock poisoned");
        if domains.is_empty() && !inner.domains.is_empty() {
            warn!(
                "refusing to reload block-list {} to an empty list (was {} entries); file may be truncated",
                path.display(),
                inner.domains.len()
            );
            inner.last_checked = Some(checked_at);
            return;
        }
        debug!("loaded {} block-list entries from {}", domains.len(), path.display());
        inner.domains = domains;
        inner.mtime = mtime;
        inner.last_checked = Some(checked_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_suffix_match() {
        let list = BlockList::from_domains(["evil.example".to_string()]);
        assert!(list.contains("evil.example"));
        assert!(list.contains("social.evil.example"));
        assert!(!list.contains("notevil.example"));
        assert!(!list.contains("evilexample.com"));
    }

    #[test]
    fn trailing_dot_tolerated() {
        let list = BlockList::from_domains(["evil.example".to_string()]);
        assert!(list.contains("evil.example."));
    }

    #[test]
    fn empty_reload_over_nonempty_is_ignored() {
        let dir = std::env::temp_dir().join(format!("blocklist-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("tmp dir");
        let path = dir.join("blocklist.txt");
        std::fs::write(&path, "evil.example\n").expect("write");
        let list = BlockList::new(Some(path.clone()));
        assert!(list.contains("evil.example"));

        std::fs::write(&path, "").expect("truncate");
        // Force mtime to look changed and bypass the debounce window.
        list.inner.write().expect("lock").last_checked = None;
        list.maybe_reload();
        assert!(list.contains("evil.example"), "truncated reload must be ignored");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
