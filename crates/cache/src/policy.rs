//! Caching policies
//!
//! A [`Policy`] decides where artifacts live, whether they are tracked in
//! the metadata store, and which size ceilings apply.
//!
//! | kind        | directory                     | managed | limits |
//! |-------------|-------------------------------|---------|--------|
//! | `off`       | process-lifetime temp dir     | no      | none   |
//! | `temporary` | process-lifetime temp dir     | yes     | yes    |
//! | `user`      | configured persistent path    | yes     | yes    |

use crate::settings::CacheSettings;
use crate::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::debug;

/// Which caching strategy is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Scratch space only; nothing is tracked or reused
    Disabled,
    /// Tracked cache living for the duration of the process
    Temporary,
    /// Tracked cache persisted in a user directory
    User,
}

impl PolicyKind {
    /// Parse a configured policy name
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Disabled),
            "temporary" => Ok(Self::Temporary),
            "user" => Ok(Self::User),
            other => Err(Error::configuration(format!(
                "Invalid cache policy '{other}'"
            ))),
        }
    }

    /// Configuration name of this kind
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Disabled => "off",
            Self::Temporary => "temporary",
            Self::User => "user",
        }
    }

    /// Whether entries are tracked and evicted
    #[must_use]
    pub const fn managed(self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
enum Location {
    Scratch(Arc<TempDir>),
    Persistent(PathBuf),
}

/// Size ceilings applied by managed policies
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SizeLimits {
    /// Absolute ceiling in bytes
    pub maximum_size: Option<u64>,
    /// Ceiling on the hosting disk's usage, in percent
    pub maximum_disk_usage: Option<f64>,
}

impl SizeLimits {
    fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            maximum_size: settings.maximum_cache_size,
            maximum_disk_usage: settings.maximum_cache_disk_usage,
        }
    }
}

/// The active caching policy
///
/// Cloning is cheap; clones share the scratch directory, which is removed
/// once the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Policy {
    kind: PolicyKind,
    location: Location,
    limits: SizeLimits,
    settings: CacheSettings,
}

impl Policy {
    /// Build the policy selected by `settings`
    pub fn from_settings(settings: &CacheSettings) -> Result<Self> {
        let kind = PolicyKind::parse(&settings.cache_policy)?;
        let location = match kind {
            PolicyKind::Disabled | PolicyKind::Temporary => {
                Location::Scratch(Arc::new(scratch_directory(settings)?))
            }
            PolicyKind::User => {
                let dir = &settings.user_cache_directory;
                std::fs::create_dir_all(dir).map_err(|e| Error::io(e, dir, "create_dir_all"))?;
                Location::Persistent(dir.clone())
            }
        };
        let limits = if kind.managed() {
            SizeLimits::from_settings(settings)
        } else {
            SizeLimits::default()
        };
        let policy = Self {
            kind,
            location,
            limits,
            settings: settings.clone(),
        };
        debug!(policy = %kind, directory = %policy.directory().display(), "Cache policy selected");
        Ok(policy)
    }

    /// Policy kind
    #[must_use]
    pub const fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Directory holding the artifacts
    #[must_use]
    pub fn directory(&self) -> &Path {
        match &self.location {
            Location::Scratch(dir) => dir.path(),
            Location::Persistent(dir) => dir,
        }
    }

    /// Whether entries are tracked in the metadata store
    #[must_use]
    pub const fn managed(&self) -> bool {
        self.kind.managed()
    }

    /// Absolute size ceiling in bytes
    #[must_use]
    pub const fn maximum_cache_size(&self) -> Option<u64> {
        self.limits.maximum_size
    }

    /// Disk usage ceiling in percent
    #[must_use]
    pub const fn maximum_cache_disk_usage(&self) -> Option<f64> {
        self.limits.maximum_disk_usage
    }

    /// Settings snapshot this policy was built from
    #[must_use]
    pub const fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Whether `path` lies inside the cache directory
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(self.directory())
    }

    /// Whether `settings` require a different policy or directory
    ///
    /// An outdated policy cannot be patched in place: it has to be rebuilt
    /// along with its store connection.
    #[must_use]
    pub fn outdated(&self, settings: &CacheSettings) -> bool {
        if PolicyKind::parse(&settings.cache_policy).ok() != Some(self.kind) {
            return true;
        }
        match self.kind {
            PolicyKind::User => settings.user_cache_directory != self.settings.user_cache_directory,
            PolicyKind::Disabled | PolicyKind::Temporary => {
                settings.temporary_directory_root != self.settings.temporary_directory_root
            }
        }
    }

    /// Absorb changes that do not require a rebuild
    ///
    /// Returns `true` when the size ceilings changed.
    pub fn update(&mut self, settings: &CacheSettings) -> bool {
        let limits = if self.kind.managed() {
            SizeLimits::from_settings(settings)
        } else {
            SizeLimits::default()
        };
        let changed = limits != self.limits;
        self.limits = limits;
        self.settings = settings.clone();
        changed
    }
}

fn scratch_directory(settings: &CacheSettings) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("hoard-");
    match &settings.temporary_directory_root {
        Some(root) => {
            std::fs::create_dir_all(root).map_err(|e| Error::io(e, root, "create_dir_all"))?;
            builder
                .tempdir_in(root)
                .map_err(|e| Error::io(e, root, "create temporary directory"))
        }
        None => builder
            .tempdir()
            .map_err(|e| Error::io_no_path(e, "create temporary directory")),
    }
}
