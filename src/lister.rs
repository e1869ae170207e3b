//! Listing and resolving tailable files under the root directory.

use std::fmt::{self, Debug, Formatter};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Source of "now" for cache expiry.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by [`Instant::now`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// One tailable file, as shown to viewers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Path relative to the root, `/`-separated.
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// A client-supplied path that passed validation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    /// Canonical path of the file on disk.
    pub path: PathBuf,
    /// Its name relative to the root, with symlinks inside the root
    /// resolved.
    pub channel: Arc<str>,
}

struct Cached {
    files: Vec<FileEntry>,
    scanned_at: Instant,
}

/// Lists files under the root, caching the result for a while so bursts
/// of requests don't each walk the filesystem.
pub struct DirectoryLister {
    root: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    cache: Mutex<Option<Cached>>,
}

impl Debug for DirectoryLister {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("DirectoryLister")
            .field("root", &self.root)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl DirectoryLister {
    /// `root` should already be canonical; see [`DirectoryLister::open`].
    pub fn new(root: impl Into<PathBuf>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        DirectoryLister {
            root: root.into(),
            ttl,
            clock,
            cache: Mutex::new(None),
        }
    }

    /// Canonicalizes `root` and builds a lister on the system clock.
    pub async fn open(root: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        let root = fs::canonicalize(root.as_ref()).await?;
        if !fs::metadata(&root).await?.is_dir() {
            return Err(Error::Config(format!(
                "root {} is not a directory",
                root.display()
            )));
        }

        Ok(Self::new(root, ttl, Arc::new(SystemClock)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns every regular file under the root, ordered by name.
    ///
    /// Served from cache while the last scan is younger than the TTL. A
    /// failed scan is returned as an error and never cached.
    pub async fn list(&self) -> Result<Vec<FileEntry>> {
        let mut cache = self.cache.lock().await;
        let now = self.clock.now();

        if let Some(cached) = cache.as_ref() {
            if now.saturating_duration_since(cached.scanned_at) < self.ttl {
                return Ok(cached.files.clone());
            }
        }

        match scan(&self.root).await {
            Ok(files) => {
                *cache = Some(Cached {
                    files: files.clone(),
                    scanned_at: now,
                });
                Ok(files)
            }
            Err(e) => {
                *cache = None;
                Err(e)
            }
        }
    }

    /// Maps a viewer-supplied name onto a file inside the root.
    pub async fn resolve(&self, name: &str) -> Result<Target> {
        if name.is_empty() || name.contains('\0') {
            return Err(Error::InvalidPath(name.to_string()));
        }

        let mut relative = PathBuf::new();
        for component in Path::new(name).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::OutsideRoot(name.to_string()));
                }
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(Error::InvalidPath(name.to_string()));
        }

        let path = fs::canonicalize(self.root.join(&relative))
            .await
            .map_err(|e| Error::from_io(e, name))?;

        // Symlinks may still point elsewhere.
        if !path.starts_with(&self.root) {
            return Err(Error::OutsideRoot(name.to_string()));
        }

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| Error::from_io(e, name))?;
        if !metadata.is_file() {
            return Err(Error::NotAFile(name.to_string()));
        }

        // Aliases of one file share its watch, so name it by where it lives.
        let channel = match path.strip_prefix(&self.root) {
            Ok(canonical) => channel_name(canonical),
            Err(_) => channel_name(&relative),
        };

        Ok(Target {
            channel: channel.into(),
            path,
        })
    }
}

fn channel_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

async fn scan(root: &Path) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if dir == root => return Err(e.into()),
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push(path);
                continue;
            }

            // Symlinked files are listed if they stay inside the root;
            // symlinked directories are not walked.
            if file_type.is_symlink() {
                match fs::canonicalize(&path).await {
                    Ok(target) if target.starts_with(root) => {}
                    _ => continue,
                }
            }
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };
            let relative = match path.strip_prefix(root) {
                Ok(relative) => relative,
                Err(_) => continue,
            };

            files.push(FileEntry {
                name: channel_name(relative),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(files)
}
