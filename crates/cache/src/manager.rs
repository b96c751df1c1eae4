//! Cache manager
//!
//! A single background thread owns the metadata store connection. Every
//! store operation is submitted to it through a FIFO queue and answered
//! through a per-submission [`Pending`] handle, so the store only ever sees
//! one writer per process.
//!
//! Eviction (`decache`) computes a watermark before touching anything: the
//! creation time of the oldest in-flight build, or of the newest completed
//! entry when nothing is being built. Only completed entries created strictly
//! before the watermark are candidates; orphans go first (oldest first),
//! then everything else in least-recently-used order.

use crate::args::ArgValue;
use crate::policy::Policy;
use crate::settings::bytes_to_string;
use crate::store::{
    self, CacheEntry, EntryKind, MetadataStore, ORPHANS_OWNER, Timestamp, is_database_file,
};
use crate::{Error, Result};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn};

/// Files younger than this are never adopted as orphans; they may belong to
/// a build that has not registered yet.
pub const ORPHAN_GRACE_PERIOD: Duration = Duration::from_secs(120);

/// Predicate selecting entries to purge
pub type Matcher = Box<dyn Fn(&CacheEntry) -> bool + Send + 'static>;

type Job = Box<dyn FnOnce(&mut Worker) + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Result of a submitted operation
///
/// Call [`Pending::wait`] from synchronous code or `.await` it from async
/// code. Dropping it turns the submission into fire-and-forget; a failure
/// is then logged by the worker.
#[must_use = "dropping a Pending discards the operation's result"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// Block the current thread until the worker has processed the submission
    ///
    /// Must not be called from within an async runtime; `.await` instead.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(Error::ManagerStopped))
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(Error::ManagerStopped)))
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

/// Cloneable submission handle to a running [`Manager`]
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl ManagerHandle {
    /// Queue `op` for the worker
    pub(crate) fn submit<T, F>(&self, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Worker) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |worker| {
            if let Err(Err(e)) = tx.send(op(worker)) {
                error!(error = %e, "Cache operation failed with nobody waiting for it");
            }
        });
        // On failure the job, and with it the reply sender, is dropped; the
        // Pending then resolves to ManagerStopped.
        let _ = self.tx.send(Message::Run(job));
        Pending { rx }
    }

    /// Insert or touch the row for `path`
    pub fn register(
        &self,
        path: PathBuf,
        owner: String,
        args: ArgValue,
        parent: Option<PathBuf>,
    ) -> Pending<CacheEntry> {
        self.submit(move |w| w.register(&path, &owner, &args, parent.as_deref()))
    }

    /// Record size, type and owner data for a freshly built artifact
    pub fn update_entry(&self, path: PathBuf, owner_data: Option<Value>) -> Pending<CacheEntry> {
        self.submit(move |w| w.update_entry(&path, owner_data.as_ref()))
    }

    /// Total recorded size in bytes
    pub fn cache_size(&self) -> Pending<u64> {
        self.submit(|w| w.cache_size())
    }

    /// Enforce the policy's size ceilings
    pub fn check_size(&self) -> Pending<()> {
        self.submit(Worker::check_size)
    }

    /// Evict at least `bytes` bytes if possible; returns bytes freed
    pub fn decache(&self, bytes: u64) -> Pending<u64> {
        self.submit(move |w| w.decache(bytes, false))
    }

    /// Adopt orphans found on disk
    pub fn housekeeping(&self, clean: bool) -> Pending<()> {
        self.submit(move |w| w.housekeeping(clean))
    }

    /// Delete matching entries, or everything evictable when `matcher` is `None`
    pub fn purge(&self, matcher: Option<Matcher>) -> Pending<u64> {
        self.submit(move |w| w.purge(matcher.as_ref()))
    }

    /// Delete the entry at `path` and its children; returns bytes freed
    pub fn delete_path(&self, path: PathBuf) -> Pending<u64> {
        self.submit(move |w| w.delete_path(&path))
    }

    /// All entries, most recently used first
    pub fn entries(&self) -> Pending<Vec<CacheEntry>> {
        self.submit(|w| w.entries())
    }

    /// Replace the worker's policy snapshot
    pub fn update_policy(&self, policy: Policy) -> Pending<()> {
        self.submit(move |w| {
            w.policy = policy;
            Ok(())
        })
    }
}

/// Owner of the worker thread
///
/// Dropping the manager lets the worker finish everything already queued,
/// then joins it.
#[derive(Debug)]
pub struct Manager {
    handle: ManagerHandle,
    thread: Option<JoinHandle<()>>,
}

impl Manager {
    /// Open the store in the policy's directory and start the worker
    pub fn start(policy: Policy) -> Result<Self> {
        let store = MetadataStore::open(policy.directory())?;
        Self::spawn(Worker::new(policy, store))
    }

    pub(crate) fn spawn(mut worker: Worker) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let span = info_span!(
            "cache_manager",
            directory = %worker.policy.directory().display()
        );
        let thread = std::thread::Builder::new()
            .name("hoard-cache-manager".to_string())
            .spawn(move || {
                let _guard = span.enter();
                debug!("Cache manager started");
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        Message::Run(job) => job(&mut worker),
                        Message::Shutdown => break,
                    }
                }
                debug!("Cache manager stopped");
            })
            .map_err(|e| Error::io_no_path(e, "spawn cache manager"))?;
        Ok(Self {
            handle: ManagerHandle { tx },
            thread: Some(thread),
        })
    }

    /// A new submission handle
    #[must_use]
    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Message::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Cache manager thread panicked");
        }
    }
}

/// Filesystem usage of the volume hosting the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    /// Capacity in bytes
    pub total: u64,
    /// Free bytes
    pub free: u64,
}

impl DiskUsage {
    /// Probe the volume holding `path`
    pub fn probe(path: &Path) -> Result<Self> {
        let stats = fs4::statvfs(path).map_err(|e| Error::io(e, path, "statvfs"))?;
        Ok(Self {
            total: stats.total_space(),
            free: stats.free_space(),
        })
    }

    /// Percentage of the volume in use
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.total.saturating_sub(self.free) as f64 * 100.0 / self.total as f64
    }

    /// Bytes to free to bring usage down to `target` percent
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn excess_over(&self, target: f64) -> u64 {
        let over = self.percent() - target;
        if over <= 0.0 {
            return 0;
        }
        (over * self.total as f64 / 100.0).ceil() as u64
    }
}

/// Size and type of the object at `path`
fn measure(path: &Path) -> std::io::Result<(u64, EntryKind)> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok((meta.len(), EntryKind::File));
    }
    let mut size = 0;
    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            size += entry.metadata().map_or(0, |m| m.len());
        }
    }
    Ok((size, EntryKind::Directory))
}

fn remove_object(path: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// State owned by the worker thread
pub(crate) struct Worker {
    store: MetadataStore,
    policy: Policy,
    grace: Duration,
}

impl Worker {
    pub(crate) fn new(policy: Policy, store: MetadataStore) -> Self {
        Self {
            store,
            policy,
            grace: ORPHAN_GRACE_PERIOD,
        }
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn ensure_in_cache(&self, path: &Path) -> Result<()> {
        if self.policy.contains(path) {
            Ok(())
        } else {
            Err(Error::outside_cache(path))
        }
    }

    fn register(
        &self,
        path: &Path,
        owner: &str,
        args: &ArgValue,
        parent: Option<&Path>,
    ) -> Result<CacheEntry> {
        self.ensure_in_cache(path)?;
        let entry = self.store.register(path, owner, args, parent, store::now())?;
        debug!(path = %path.display(), owner, accesses = entry.accesses, "Registered cache entry");
        Ok(entry)
    }

    fn update_entry(&self, path: &Path, owner_data: Option<&Value>) -> Result<CacheEntry> {
        let (size, kind) = measure(path).map_err(|e| Error::io(e, path, "stat"))?;
        self.store.populate(path, size, kind, owner_data)?;
        debug!(path = %path.display(), size, %kind, "Cache entry populated");
        self.store
            .get(path)?
            .ok_or_else(|| Error::configuration(format!("No cache entry for {}", path.display())))
    }

    fn cache_size(&self) -> Result<u64> {
        self.store.total_size()
    }

    fn entries(&self) -> Result<Vec<CacheEntry>> {
        self.store.entries()
    }

    fn check_size(&mut self) -> Result<()> {
        if let Some(maximum) = self.policy.maximum_cache_size() {
            let size = self.cache_size()?;
            if size > maximum {
                info!(
                    size = %bytes_to_string(size),
                    maximum = %bytes_to_string(maximum),
                    "Cache exceeds its size limit"
                );
                self.housekeeping(false)?;
                self.decache(size - maximum, false)?;
            }
        }

        if let Some(maximum) = self.policy.maximum_cache_disk_usage() {
            let usage = DiskUsage::probe(self.policy.directory())?;
            let excess = usage.excess_over(maximum);
            if excess > 0 {
                info!(
                    usage = %format_args!("{:.1}%", usage.percent()),
                    maximum = %format_args!("{maximum:.1}%"),
                    "Disk usage exceeds the cache limit"
                );
                self.housekeeping(false)?;
                self.decache(excess, false)?;
            }
        }
        Ok(())
    }

    /// Cut-off creation time below which completed entries may be evicted
    fn watermark(&self, purge: bool) -> Result<Timestamp> {
        if let Some(in_flight) = self.store.oldest_in_flight()? {
            return Ok(in_flight);
        }
        if !purge && let Some(newest) = self.store.newest_complete()? {
            return Ok(newest);
        }
        // Strictly-less-than comparison: step past "now" so a purge sees
        // everything created up to this instant.
        Ok(store::now() + 1)
    }

    fn decache(&mut self, bytes: u64, purge: bool) -> Result<u64> {
        if bytes == 0 {
            return Ok(0);
        }
        info!(target_bytes = %bytes_to_string(bytes), "Trying to free cache space");

        let latest = self.watermark(purge)?;
        let mut freed = 0;
        let scans = [
            self.store.orphans_before(latest)?,
            self.store.lru_before(latest)?,
        ];
        for candidates in scans {
            for candidate in candidates {
                // An earlier deletion may have cascaded to this one
                let Some(entry) = self.store.get(&candidate.path)? else {
                    continue;
                };
                freed += self.delete_entry(&entry)?;
                if freed >= bytes {
                    info!(freed = %bytes_to_string(freed), "Freed cache space");
                    return Ok(freed);
                }
            }
        }
        warn!(
            requested = %bytes_to_string(bytes),
            freed = %bytes_to_string(freed),
            "Could not free the requested cache space"
        );
        Ok(freed)
    }

    fn delete_path(&mut self, path: &Path) -> Result<u64> {
        self.ensure_in_cache(path)?;
        match self.store.get(path)? {
            Some(entry) => self.delete_entry(&entry),
            None => {
                // Untracked file in the cache directory
                match remove_object(path) {
                    Ok(()) => Ok(0),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
                    Err(e) => Err(Error::io(e, path, "remove")),
                }
            }
        }
    }

    /// Delete `entry` and, first, all of its children
    fn delete_entry(&mut self, entry: &CacheEntry) -> Result<u64> {
        let mut freed = 0;
        for child in self.store.children(&entry.path)? {
            freed += self.delete_entry(&child)?;
        }

        let path = &entry.path;
        self.ensure_in_cache(path)?;
        match remove_object(path) {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    owner = %entry.owner,
                    size = %bytes_to_string(entry.size.unwrap_or(0)),
                    "Deleted cache entry"
                );
                freed += entry.size.unwrap_or(0);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Cache file lost");
            }
            Err(e) => return Err(Error::io(e, path, "remove")),
        }
        self.store.remove(path)?;
        Ok(freed)
    }

    fn purge(&mut self, matcher: Option<&Matcher>) -> Result<u64> {
        let Some(matcher) = matcher else {
            self.housekeeping(true)?;
            let size = self.cache_size()?;
            return self.decache(size, true);
        };
        let mut freed = 0;
        for candidate in self.store.entries()? {
            if !matcher(&candidate) {
                continue;
            }
            if let Some(entry) = self.store.get(&candidate.path)? {
                freed += self.delete_entry(&entry)?;
            }
        }
        Ok(freed)
    }

    fn housekeeping(&mut self, clean: bool) -> Result<()> {
        let top = self.policy.directory().to_path_buf();
        let listing = std::fs::read_dir(&top).map_err(|e| Error::io(e, &top, "read_dir"))?;
        let now = SystemTime::now();

        for dirent in listing {
            let dirent = dirent.map_err(|e| Error::io(e, &top, "read_dir"))?;
            let full = dirent.path();
            let name = dirent.file_name();
            let Some(name) = name.to_str() else {
                warn!(path = %full.display(), "Skipping non UTF-8 name in cache directory");
                continue;
            };
            if is_database_file(name) || self.store.contains(&full)? {
                continue;
            }

            let young = std::fs::symlink_metadata(&full)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age < self.grace);
            if young {
                continue;
            }

            let parent = match self.store.root_prefix_of(&full)? {
                Some(p) => self.store.get(&p)?,
                None => None,
            };
            match &parent {
                Some(p) => {
                    debug!(path = %full.display(), parent = %p.path.display(), "Adopting derived file");
                    self.register(&full, &p.owner, &ArgValue::Null, Some(&p.path))?;
                }
                None => {
                    warn!(path = %full.display(), "Orphan found");
                    self.register(&full, ORPHANS_OWNER, &ArgValue::Null, None)?;
                }
            }
            if let Err(e) = self.update_entry(&full, None) {
                warn!(path = %full.display(), error = %e, "Could not size orphan");
            }
        }

        if clean {
            let cutoff = store::now() - i64::try_from(self.grace.as_micros()).unwrap_or(i64::MAX);
            for entry in self.store.incomplete()? {
                if entry.creation_date.timestamp_micros() < cutoff && !entry.path.exists() {
                    warn!(path = %entry.path.display(), "Dropping entry that never completed");
                    self.store.remove(&entry.path)?;
                }
            }
        }
        Ok(())
    }
}
