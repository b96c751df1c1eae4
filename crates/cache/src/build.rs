//! Crash-safe artifact creation
//!
//! Artifacts are written to `{path}.tmp` by the recipe callback and renamed
//! into place while holding an exclusive lock on `{path}.lock`. The lock is
//! an OS-level advisory lock, so it also serialises builds across processes
//! sharing one cache directory.

use crate::args::ArgValue;
use crate::recipe::Recipe;
use crate::{BoxError, Error, Result};
use fs4::fs_std::FileExt;
use serde_json::Value;
use std::ffi::OsString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Predicate deciding whether an existing artifact must be rebuilt
///
/// Receives the recipe arguments, the artifact path and the owner data the
/// previous build returned.
pub type ForcePredicate = Box<dyn Fn(&ArgValue, &Path, Option<&Value>) -> bool + Send + Sync>;

/// When to rebuild an artifact that already exists
#[derive(Default)]
pub enum Force {
    /// Reuse existing artifacts
    #[default]
    Never,
    /// Always rebuild
    Always,
    /// Rebuild when the predicate returns `true`
    When(ForcePredicate),
}

impl Force {
    pub(crate) fn applies(&self, args: &ArgValue, path: &Path, owner_data: Option<&Value>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::When(predicate) => predicate(args, path, owner_data),
        }
    }
}

impl fmt::Debug for Force {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

impl From<bool> for Force {
    fn from(force: bool) -> Self {
        if force { Self::Always } else { Self::Never }
    }
}

/// Optional knobs for [`crate::Cache::cache_file_with`]
#[derive(Debug, Default)]
pub struct BuildOptions {
    /// Rebuild policy for existing artifacts
    pub force: Force,
    /// Previous artifact to discard once the new one is ready
    pub replace: Option<PathBuf>,
}

impl BuildOptions {
    /// Set the rebuild policy
    #[must_use]
    pub fn force(mut self, force: impl Into<Force>) -> Self {
        self.force = force.into();
        self
    }

    /// Discard `previous` after a successful build
    #[must_use]
    pub fn replace(mut self, previous: impl Into<PathBuf>) -> Self {
        self.replace = Some(previous.into());
        self
    }
}

/// `path` with `suffix` appended to its final component
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Exclusive lock on `{path}.lock`, released and removed on drop
#[derive(Debug)]
pub(crate) struct FileLock {
    file: Option<File>,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock guarding `artifact` is held
    ///
    /// A previous holder unlinks the lock file before releasing it, so a
    /// waiter can wake up holding a lock on a file nobody else will ever
    /// open again. That lock is dropped and acquisition starts over on the
    /// file now at the path.
    pub(crate) fn acquire(artifact: &Path) -> Result<Self> {
        let path = with_suffix(artifact, ".lock");
        loop {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| Error::io(e, &path, "open"))?;
            FileExt::lock_exclusive(&file).map_err(|e| Error::io(e, &path, "lock"))?;
            if is_linked(&file, &path)? {
                debug!(lock = %path.display(), "Acquired build lock");
                return Ok(Self {
                    file: Some(file),
                    path,
                });
            }
            debug!(lock = %path.display(), "Lock file was replaced while waiting, retrying");
        }
    }
}

/// Whether `file` is still the file found at `path`
#[cfg(unix)]
fn is_linked(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata().map_err(|e| Error::io(e, path, "stat"))?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(e, path, "stat")),
    }
}

#[cfg(not(unix))]
fn is_linked(_file: &File, path: &Path) -> Result<bool> {
    // Open files cannot be unlinked here, so the path still names our file
    Ok(path.exists())
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Unlink while still holding the lock so no newcomer can lock the
        // same inode as a waiter
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(lock = %self.path.display(), error = %e, "Failed to remove lock file");
        }
        drop(self.file.take());
    }
}

/// Run `create` against `{path}.tmp` and move the result to `path`
///
/// The caller must hold the [`FileLock`] for `path`.
pub(crate) fn create_at<F, E>(
    path: &Path,
    owner: &str,
    args: &ArgValue,
    create: F,
) -> Result<Option<Value>>
where
    F: FnOnce(&Path, &ArgValue) -> std::result::Result<Option<Value>, E>,
    E: Into<BoxError>,
{
    let tmp = with_suffix(path, ".tmp");
    let removed = if tmp.is_dir() {
        std::fs::remove_dir_all(&tmp)
    } else {
        std::fs::remove_file(&tmp)
    };
    match removed {
        Ok(()) => debug!(path = %tmp.display(), "Removed stale temporary file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(e, &tmp, "remove")),
    }

    let owner_data = create(&tmp, args).map_err(|e| Error::recipe(owner, e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::io(e, path, "rename"))?;
    debug!(path = %path.display(), owner, "Created cache artifact");
    Ok(owner_data)
}

/// Build an unregistered, uniquely named artifact in `directory`
///
/// Used when caching is disabled: every call gets a fresh file.
pub(crate) fn scratch_file<F, E>(directory: &Path, recipe: &Recipe, create: F) -> Result<PathBuf>
where
    F: FnOnce(&Path, &ArgValue) -> std::result::Result<Option<Value>, E>,
    E: Into<BoxError>,
{
    let name = format!(
        "{}-{}-{}{}",
        recipe.file_prefix()?,
        recipe.digest()?,
        uuid::Uuid::new_v4().simple(),
        recipe.ext()
    );
    let path = directory.join(name);
    let _lock = FileLock::acquire(&path)?;
    create_at(&path, recipe.owner(), recipe.args(), create)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn suffix_is_appended_not_substituted() {
        let path = Path::new("/cache/url-abc.grib");
        assert_eq!(with_suffix(path, ".lock"), Path::new("/cache/url-abc.grib.lock"));
        assert_eq!(with_suffix(path, ".tmp"), Path::new("/cache/url-abc.grib.tmp"));
    }

    #[test]
    fn lock_file_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("url-abc.cache");
        let lock = FileLock::acquire(&artifact).unwrap();
        assert!(dir.path().join("url-abc.cache.lock").exists());
        drop(lock);
        assert!(!dir.path().join("url-abc.cache.lock").exists());
    }

    #[test]
    fn waiter_relocks_after_holder_unlinks() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("url-abc.cache");
        let first = FileLock::acquire(&artifact).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = std::thread::spawn({
            let artifact = artifact.clone();
            move || {
                let lock = FileLock::acquire(&artifact).unwrap();
                tx.send(()).unwrap();
                lock
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(100));
        drop(first);

        rx.recv().unwrap();
        let held = waiter.join().unwrap();
        // The waiter holds the file currently linked at the lock path
        assert!(is_linked(held.file.as_ref().unwrap(), &held.path).unwrap());
        drop(held);
        assert!(!dir.path().join("url-abc.cache.lock").exists());
    }

    #[test]
    fn create_replaces_stale_temporary_file() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("url-abc.cache");
        std::fs::write(with_suffix(&artifact, ".tmp"), b"partial garbage").unwrap();

        let data = create_at(&artifact, "url", &ArgValue::Null, |tmp, _| {
            assert!(!tmp.exists());
            std::fs::write(tmp, b"complete")?;
            Ok::<_, std::io::Error>(Some(serde_json::json!({"status": 200})))
        })
        .unwrap();

        assert_eq!(data, Some(serde_json::json!({"status": 200})));
        assert_eq!(std::fs::read(&artifact).unwrap(), b"complete");
        assert!(!with_suffix(&artifact, ".tmp").exists());
    }

    #[test]
    fn failed_create_leaves_no_artifact() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("url-abc.cache");

        let err = create_at(&artifact, "url", &ArgValue::Null, |tmp, _| {
            std::fs::write(tmp, b"half")?;
            Err::<Option<Value>, BoxError>("connection reset".into())
        })
        .unwrap_err();

        assert!(matches!(err, Error::Recipe { ref owner, .. } if owner == "url"));
        assert!(err.to_string().contains("connection reset"));
        assert!(!artifact.exists());
    }

    #[test]
    fn scratch_files_are_unique() {
        let dir = TempDir::new().unwrap();
        let recipe = Recipe::new("url", "https://example.com/a");
        let write = |tmp: &Path, _: &ArgValue| {
            std::fs::write(tmp, b"x").map(|()| None)
        };
        let a = scratch_file(dir.path(), &recipe, write).unwrap();
        let b = scratch_file(dir.path(), &recipe, write).unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("url-"));
    }

    #[test]
    fn force_variants() {
        let path = Path::new("/cache/x");
        let stale = serde_json::json!({"etag": "old"});
        assert!(!Force::Never.applies(&ArgValue::Null, path, None));
        assert!(Force::Always.applies(&ArgValue::Null, path, None));
        let when = Force::When(Box::new(|_: &ArgValue, _: &Path, data: Option<&Value>| {
            data.and_then(|d| d.get("etag")).and_then(Value::as_str) == Some("old")
        }));
        assert!(when.applies(&ArgValue::Null, path, Some(&stale)));
        assert!(!when.applies(&ArgValue::Null, path, None));
        assert!(matches!(Force::from(true), Force::Always));
    }
}
