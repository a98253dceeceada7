//! View loading with a sandboxed root and a shared template cache.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// A cached view file. `Empty` remembers files that held only whitespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedTemplate {
    Present(String),
    Empty,
}

impl CachedTemplate {
    fn into_text(self) -> Option<String> {
        match self {
            CachedTemplate::Present(text) => Some(text),
            CachedTemplate::Empty => None,
        }
    }
}

/// Storage for loaded view files, shared across renders.
pub trait TemplateCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedTemplate>;

    /// Stores `value`; with a `ttl` the entry expires after that long.
    fn set(&self, key: &str, value: CachedTemplate, ttl: Option<Duration>);
}

/// Hit and miss counters of a [`MemoryCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cached views, {} hits, {} misses",
            self.entries, self.hits, self.misses
        )
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedTemplate,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory LRU cache with optional per-entry expiry.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TemplateCache for MemoryCache {
    fn get(&self, key: &str) -> Option<CachedTemplate> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn set(&self, key: &str, value: CachedTemplate, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.lock().put(key.to_string(), entry);
    }
}

/// Resolves view names inside a root directory and reads them through a cache.
#[derive(Debug, Clone)]
pub struct ViewLoader {
    root: PathBuf,
    extension: String,
}

impl ViewLoader {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: normalize(&root.into()),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a view name to a path under the root, appending the extension.
    /// Names that escape the root resolve to `None`.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let mut file = name.to_string();
        if !self.extension.is_empty() && !file.ends_with(&self.extension) {
            file.push_str(&self.extension);
        }
        let candidate = Path::new(&file);
        let joined = if candidate.starts_with(&self.root) {
            candidate.to_path_buf()
        } else {
            self.root.join(file.trim_start_matches(['/', '\\']))
        };
        let resolved = normalize(&joined);
        if resolved.starts_with(&self.root) {
            Some(resolved)
        } else {
            warn!(view = name, root = %self.root.display(), "view path escapes the views directory");
            None
        }
    }

    /// Loads a view, returning `None` when it is missing, empty or outside the root.
    pub fn load(
        &self,
        name: &str,
        cache: &dyn TemplateCache,
        ttl: Option<Duration>,
    ) -> Result<Option<String>> {
        let Some(path) = self.resolve(name) else {
            return Ok(None);
        };
        let key = format!("template_file:{}", path.display());
        if let Some(cached) = cache.get(&key) {
            debug!(view = name, "view cache hit");
            return Ok(cached.into_text());
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "view not found");
                return Ok(None);
            }
            Err(source) => return Err(EngineError::Io { path, source }),
        };

        let entry = if text.trim().is_empty() {
            CachedTemplate::Empty
        } else {
            CachedTemplate::Present(text)
        };
        cache.set(&key, entry.clone(), ttl);
        Ok(entry.into_text())
    }
}

/// Lexically resolves `.` and `..` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
