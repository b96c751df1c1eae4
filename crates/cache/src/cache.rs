//! Cache facade
//!
//! [`Cache`] is the application-owned entry point. It is constructed once at
//! startup and handed to whatever needs artifacts; constructing a second one
//! while the first is alive fails with [`Error::AlreadyInitialized`], which
//! keeps a single manager worker per process.

use crate::args::ArgValue;
use crate::build::{self, BuildOptions, FileLock};
use crate::manager::{Manager, ManagerHandle, Matcher};
use crate::policy::Policy;
use crate::recipe::Recipe;
use crate::settings::CacheSettings;
use crate::store::CacheEntry;
use crate::{BoxError, Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

static CREATED: AtomicBool = AtomicBool::new(false);

struct State {
    policy: Policy,
    manager: Option<Manager>,
}

impl State {
    fn build(settings: &CacheSettings) -> Result<Self> {
        let policy = Policy::from_settings(settings)?;
        let manager = if policy.managed() {
            Some(Manager::start(policy.clone())?)
        } else {
            None
        };
        info!(
            policy = %policy.kind(),
            directory = %policy.directory().display(),
            "Cache initialised"
        );
        Ok(Self { policy, manager })
    }

    fn handle(&self) -> Option<ManagerHandle> {
        self.manager.as_ref().map(Manager::handle)
    }
}

/// Process-wide artifact cache
pub struct Cache {
    // Lock order: `state` before `settings`
    state: Mutex<Option<State>>,
    settings: Mutex<CacheSettings>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::configuration(format!("Failed to acquire cache {what} lock")))
}

impl Cache {
    /// Create the cache
    ///
    /// The policy is resolved lazily on first use, so an invalid policy name
    /// surfaces from the first operation rather than from here.
    pub fn new(settings: CacheSettings) -> Result<Self> {
        if CREATED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyInitialized);
        }
        Ok(Self {
            state: Mutex::new(None),
            settings: Mutex::new(settings),
        })
    }

    /// Current policy and a manager handle, building them if needed
    fn snapshot(&self) -> Result<(Policy, Option<ManagerHandle>)> {
        let mut state = lock(&self.state, "state")?;
        if state.is_none() {
            let settings = lock(&self.settings, "settings")?.clone();
            *state = Some(State::build(&settings)?);
        }
        match state.as_ref() {
            Some(s) => Ok((s.policy.clone(), s.handle())),
            None => Err(Error::ManagerStopped),
        }
    }

    fn handle(&self) -> Result<Option<ManagerHandle>> {
        Ok(self.snapshot()?.1)
    }

    /// Apply changed settings
    ///
    /// A new policy kind or directory rebuilds the policy and restarts the
    /// manager. Changed size limits are pushed to the running manager,
    /// followed by a size check.
    pub fn reconfigure(&self, settings: CacheSettings) -> Result<()> {
        let mut state = lock(&self.state, "state")?;
        *lock(&self.settings, "settings")? = settings.clone();

        let Some(current) = state.as_mut() else {
            return Ok(());
        };
        if current.policy.outdated(&settings) {
            info!(policy = %settings.cache_policy, "Cache settings changed, rebuilding policy");
            // Stop the old worker before opening a store elsewhere
            *state = None;
            *state = Some(State::build(&settings)?);
        } else if current.policy.update(&settings)
            && let Some(handle) = current.handle()
        {
            debug!("Cache size limits changed");
            let _ = handle.update_policy(current.policy.clone());
            let _ = handle.check_size();
        }
        Ok(())
    }

    /// Settings currently in effect
    pub fn settings(&self) -> Result<CacheSettings> {
        Ok(lock(&self.settings, "settings")?.clone())
    }

    /// Name of the active policy (`off`, `temporary` or `user`)
    pub fn policy_name(&self) -> Result<&'static str> {
        Ok(self.snapshot()?.0.kind().name())
    }

    /// Whether auxiliary index files should be cached
    pub fn index_cache_enabled(&self) -> Result<bool> {
        Ok(lock(&self.settings, "settings")?.use_index_cache)
    }

    /// Cache directory, or `None` when caching is disabled
    pub fn directory(&self) -> Result<Option<PathBuf>> {
        let (policy, _) = self.snapshot()?;
        Ok(policy.managed().then(|| policy.directory().to_path_buf()))
    }

    /// Total size of tracked entries in bytes
    pub fn size(&self) -> Result<Option<u64>> {
        match self.handle()? {
            Some(handle) => handle.cache_size().wait().map(Some),
            None => Ok(None),
        }
    }

    /// Tracked entries, most recently used first
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        match self.handle()? {
            Some(handle) => handle.entries().wait(),
            None => Ok(Vec::new()),
        }
    }

    /// Delete the entries selected by `matcher`
    ///
    /// With no matcher, everything that is not being built is evicted.
    /// Returns the number of bytes freed.
    pub fn purge(&self, matcher: Option<Matcher>) -> Result<Option<u64>> {
        match self.handle()? {
            Some(handle) => handle.purge(matcher).wait().map(Some),
            None => Ok(None),
        }
    }

    /// Enforce the size limits and wait for the result
    pub fn check_size(&self) -> Result<()> {
        match self.handle()? {
            Some(handle) => handle.check_size().wait(),
            None => Ok(()),
        }
    }

    /// Resolve `recipe` to a path, building the artifact if needed
    ///
    /// `create` is given a temporary path to write the artifact to and the
    /// recipe arguments. It may return data to keep alongside the entry.
    pub fn cache_file<F, E>(&self, recipe: &Recipe, create: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path, &ArgValue) -> std::result::Result<Option<Value>, E>,
        E: Into<BoxError>,
    {
        self.cache_file_with(recipe, BuildOptions::default(), create)
    }

    /// [`Cache::cache_file`] with rebuild and replacement options
    pub fn cache_file_with<F, E>(
        &self,
        recipe: &Recipe,
        options: BuildOptions,
        create: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce(&Path, &ArgValue) -> std::result::Result<Option<Value>, E>,
        E: Into<BoxError>,
    {
        let (policy, handle) = self.snapshot()?;
        let Some(manager) = handle else {
            return build::scratch_file(policy.directory(), recipe, create);
        };

        let path = recipe.path_in(policy.directory())?;
        let owner = recipe.owner();
        let register = || {
            manager
                .register(path.clone(), owner.to_string(), recipe.args().clone(), None)
                .wait()
        };

        let entry = register()?;
        if path.exists()
            && options
                .force
                .applies(recipe.args(), &path, entry.owner_data.as_ref())
        {
            info!(path = %path.display(), owner, "Forcing rebuild of cache entry");
            manager.delete_path(path.clone()).wait()?;
            register()?;
        }

        if !path.exists() {
            let guard = FileLock::acquire(&path)?;
            // Another process may have finished while we waited
            if !path.exists() {
                let owner_data = build::create_at(&path, owner, recipe.args(), create)?;
                manager.update_entry(path.clone(), owner_data).wait()?;
                let _ = manager.check_size();
            }
            drop(guard);
        }

        if let Some(previous) = options.replace
            && previous != path
            && policy.contains(&previous)
        {
            debug!(previous = %previous.display(), "Replacing cache entry");
            manager.delete_path(previous).wait()?;
        }
        Ok(path)
    }

    /// Cache a file derived from `source`, such as an index
    ///
    /// The key includes the source's path, timestamps and size, so the
    /// artifact is invalidated when the source changes. `content` is written
    /// when the artifact does not exist yet; without it, only an existing
    /// artifact can be resolved.
    pub fn auxiliary_cache_file(
        &self,
        owner: &str,
        source: &Path,
        index: u64,
        content: Option<&[u8]>,
        extension: &str,
    ) -> Result<PathBuf> {
        let recipe = Recipe::new(owner, source_fingerprint(source, index)?).extension(extension);
        self.cache_file(&recipe, |target, _| match content {
            Some(bytes) => std::fs::write(target, bytes)
                .map(|()| None)
                .map_err(|e| Error::io(e, target, "write")),
            None => Err(Error::configuration(format!(
                "No content to create auxiliary file for {}",
                source.display()
            ))),
        })
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // Join the worker before another Cache may be created
        if let Ok(mut state) = self.state.lock() {
            state.take();
        }
        CREATED.store(false, Ordering::Release);
    }
}

#[allow(clippy::cast_precision_loss)]
fn source_fingerprint(source: &Path, index: u64) -> Result<ArgValue> {
    let meta = std::fs::metadata(source).map_err(|e| Error::io(e, source, "stat"))?;
    let seconds = |t: std::io::Result<std::time::SystemTime>| -> f64 {
        t.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0.0, |d| d.as_secs_f64())
    };
    let mtime = seconds(meta.modified());
    #[cfg(unix)]
    let ctime = {
        use std::os::unix::fs::MetadataExt;
        meta.ctime() as f64 + f64::from(u32::try_from(meta.ctime_nsec()).unwrap_or(0)) / 1e9
    };
    #[cfg(not(unix))]
    let ctime = seconds(meta.created());

    Ok(ArgValue::map([
        ("path", ArgValue::from(source)),
        ("ctime", ArgValue::Float(ctime)),
        ("mtime", ArgValue::Float(mtime)),
        ("size", ArgValue::from(meta.len())),
        ("index", ArgValue::from(index)),
    ]))
}
