use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use uuid::Uuid;

struct Inner {
    dir: PathBuf,
    tracked: Mutex<BTreeSet<PathBuf>>,
}

/// Owned registry of scratch audio files. Clones share the registry.
#[derive(Clone)]
pub struct TempFiles {
    inner: Arc<Inner>,
}

impl TempFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create scratch dir failed: {}", dir.display()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                tracked: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    fn tracked_lock(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        self.inner.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Fresh, registered path `<dir>/<label>-<id>.<ext>`. The file is not created.
    pub fn path_for(&self, label: &str, ext: &str) -> PathBuf {
        let id = Uuid::new_v4().simple().to_string();
        let p = self
            .inner
            .dir
            .join(format!("{label}-{}.{}", &id[..12], ext.trim_start_matches('.')));
        self.register(&p);
        p
    }

    pub fn register(&self, path: &Path) {
        self.tracked_lock().insert(path.to_path_buf());
    }

    /// Deletes one file and forgets it. Returns whether a file was removed.
    pub fn cleanup_file(&self, path: &Path) -> bool {
        self.tracked_lock().remove(path);
        match fs::remove_file(path) {
            Ok(()) => {
                tracing::debug!("removed temp file {}", path.display());
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!("failed to remove temp file {}: {e}", path.display());
                false
            }
        }
    }

    pub fn cleanup_all(&self) -> usize {
        let files: Vec<PathBuf> = self.tracked_lock().iter().cloned().collect();
        let removed = files.iter().filter(|p| self.cleanup_file(p)).count();
        tracing::info!("cleaned up {removed} temporary files");
        removed
    }

    pub fn tracked(&self) -> Vec<PathBuf> {
        self.tracked_lock().iter().cloned().collect()
    }

    /// Files handed out by the scope are removed when it drops.
    pub fn scope(&self) -> TempScope {
        TempScope {
            owner: self.clone(),
            files: Vec::new(),
        }
    }
}

pub struct TempScope {
    owner: TempFiles,
    files: Vec<PathBuf>,
}

impl TempScope {
    pub fn path_for(&mut self, label: &str, ext: &str) -> PathBuf {
        let p = self.owner.path_for(label, ext);
        self.files.push(p.clone());
        p
    }
}

impl Drop for TempScope {
    fn drop(&mut self) {
        for f in self.files.drain(..) {
            self.owner.cleanup_file(&f);
        }
    }
}
