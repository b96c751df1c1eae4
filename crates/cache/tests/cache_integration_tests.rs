//! Integration tests for the artifact cache
//!
//! Each test owns the process-wide cache instance, so they run serially.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use hoard_cache::{
    ArgValue, BoxError, BuildOptions, Cache, CacheSettings, EntryFilter, Error, Force, Recipe,
};
use serde_json::{Value, json};
use serial_test::serial;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, mpsc};
use std::time::Duration;
use tempfile::TempDir;

fn settings(root: &Path, policy: &str) -> CacheSettings {
    CacheSettings::default()
        .with_policy(policy)
        .with_user_directory(root.join("cache"))
        .with_temporary_root(root.join("tmp"))
        .with_maximum_disk_usage(None)
}

fn write(bytes: &'static [u8]) -> impl FnOnce(&Path, &ArgValue) -> std::io::Result<Option<Value>> {
    move |target, _| std::fs::write(target, bytes).map(|()| None)
}

fn download(url: &str) -> Recipe {
    Recipe::new("url", ArgValue::map([("url", url)])).extension(".grib")
}

#[test]
#[serial]
fn test_same_recipe_resolves_to_same_path() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();

    let a = cache.cache_file(&download("https://a"), write(b"a")).unwrap();
    let b = cache.cache_file(&download("https://a"), write(b"b")).unwrap();
    let other = cache.cache_file(&download("https://b"), write(b"c")).unwrap();

    assert_eq!(a, b);
    assert_ne!(a, other);
    assert_eq!(a.parent(), Some(tmp.path().join("cache").as_path()));
    assert!(a.file_name().unwrap().to_str().unwrap().starts_with("url-"));
    assert_eq!(std::fs::read(&a).unwrap(), b"a");
}

#[test]
#[serial]
fn test_concurrent_builds_run_create_once() {
    const CALLERS: usize = 8;
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();
    let builds = AtomicUsize::new(0);
    let barrier = Barrier::new(CALLERS);
    let recipe = download("https://slow");

    let paths: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..CALLERS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache
                        .cache_file(&recipe, |target, _| {
                            builds.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(50));
                            std::fs::write(target, vec![7u8; 4096]).map(|()| None)
                        })
                        .unwrap()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(paths.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(std::fs::read(&paths[0]).unwrap(), vec![7u8; 4096]);

    let entry = cache
        .entries()
        .unwrap()
        .into_iter()
        .find(|e| e.path == paths[0])
        .unwrap();
    assert_eq!(entry.accesses, CALLERS as u64);
    assert_eq!(entry.size, Some(4096));
}

#[test]
#[serial]
fn test_failed_build_hands_lock_to_single_successor() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();
    let recipe = download("https://flaky");
    let builds = AtomicUsize::new(0);
    let active = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let enter = || {
        builds.fetch_add(1, Ordering::SeqCst);
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
    };
    let settle = || std::thread::sleep(Duration::from_millis(200));

    let (first_started, first_started_rx) = mpsc::channel();
    let (release_first, release_first_rx) = mpsc::channel::<()>();
    let (second_started, second_started_rx) = mpsc::channel();
    let (release_second, release_second_rx) = mpsc::channel::<()>();

    let (cache, recipe, enter, active) = (&cache, &recipe, &enter, &active);
    let (first, second, third) = std::thread::scope(|s| {
        let first = s.spawn(move || {
            cache.cache_file(recipe, |_, _| {
                first_started.send(()).unwrap();
                release_first_rx.recv().unwrap();
                Err::<Option<Value>, BoxError>("upstream unavailable".into())
            })
        });
        first_started_rx.recv().unwrap();

        // Queued behind the failing build
        let second = s.spawn(move || {
            cache.cache_file(recipe, |target, _| {
                enter();
                second_started.send(()).unwrap();
                release_second_rx.recv().unwrap();
                std::fs::write(target, b"second")?;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(None)
            })
        });
        settle();
        release_first.send(()).unwrap();
        second_started_rx.recv().unwrap();

        // Arrives while the successor is building
        let third = s.spawn(move || {
            cache.cache_file(recipe, |target, _| {
                enter();
                std::fs::write(target, b"third")?;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(None)
            })
        });
        settle();
        release_second.send(()).unwrap();

        (
            first.join().unwrap(),
            second.join().unwrap(),
            third.join().unwrap(),
        )
    });

    assert!(matches!(first, Err(Error::Recipe { .. })));
    let second = second.unwrap();
    let third = third.unwrap();
    assert_eq!(second, third);
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&second).unwrap(), b"second");
}

#[test]
#[serial]
fn test_owner_cannot_escape_cache_directory() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();

    let err = cache
        .cache_file(&Recipe::new("../escaped", 1), write(b"x"))
        .unwrap_err();

    assert!(matches!(err, Error::Configuration { .. }));
    assert!(std::fs::read_dir(tmp.path()).unwrap().all(|e| {
        !e.unwrap().file_name().to_string_lossy().starts_with("escaped")
    }));
}

#[test]
#[serial]
fn test_disabled_policy_never_reuses_or_records() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "off")).unwrap();

    let a = cache.cache_file(&download("https://a"), write(b"1")).unwrap();
    let b = cache.cache_file(&download("https://a"), write(b"2")).unwrap();

    assert_ne!(a, b);
    assert_eq!(std::fs::read(&a).unwrap(), b"1");
    assert_eq!(std::fs::read(&b).unwrap(), b"2");
    assert!(cache.entries().unwrap().is_empty());
    assert_eq!(cache.size().unwrap(), None);

    let db_files = std::fs::read_dir(a.parent().unwrap())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| hoard_cache::store::is_database_file(&e.file_name().to_string_lossy()))
        .count();
    assert_eq!(db_files, 0);
}

#[test]
#[serial]
fn test_existing_artifact_bumps_access_count_once_per_call() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();
    let recipe = download("https://a");
    let builds = AtomicUsize::new(0);

    let accesses = |expected: u64| {
        let path = cache
            .cache_file(&recipe, |target, _| {
                builds.fetch_add(1, Ordering::SeqCst);
                std::fs::write(target, b"x").map(|()| None)
            })
            .unwrap();
        let entries = cache.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, path);
        assert_eq!(entries[0].accesses, expected);
    };
    accesses(1);
    accesses(2);
    accesses(3);
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
#[serial]
fn test_recipe_failure_propagates_and_next_call_retries() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();
    let recipe = download("https://flaky");

    let err = cache
        .cache_file(&recipe, |target, _| {
            std::fs::write(target, b"trunc")?;
            Err::<Option<Value>, BoxError>("HTTP 503".into())
        })
        .unwrap_err();
    assert!(matches!(err, Error::Recipe { ref owner, .. } if owner == "url"));

    let path = recipe.path_in(&tmp.path().join("cache")).unwrap();
    assert!(!path.exists());
    let entry = &cache.entries().unwrap()[0];
    assert!(!entry.is_complete());

    let path = cache.cache_file(&recipe, write(b"complete")).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"complete");
    assert!(cache.entries().unwrap()[0].is_complete());
}

#[test]
#[serial]
fn test_owner_data_is_stored_and_drives_force() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();
    let recipe = download("https://a");

    let path = cache
        .cache_file(&recipe, |target, _| {
            std::fs::write(target, b"v1")?;
            Ok::<_, std::io::Error>(Some(json!({"etag": "v1"})))
        })
        .unwrap();
    assert_eq!(cache.entries().unwrap()[0].owner_data, Some(json!({"etag": "v1"})));

    let stale = || {
        BuildOptions::default().force(Force::When(Box::new(|_: &ArgValue, _: &Path, data: Option<&Value>| {
            data.and_then(|d| d.get("etag")) != Some(&json!("v2"))
        })))
    };
    cache
        .cache_file_with(&recipe, stale(), |target, _| {
            std::fs::write(target, b"v2")?;
            Ok::<_, std::io::Error>(Some(json!({"etag": "v2"})))
        })
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"v2");

    // Predicate now false: no rebuild
    cache
        .cache_file_with(&recipe, stale(), write(b"v3"))
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"v2");

    cache
        .cache_file_with(&recipe, BuildOptions::default().force(true), write(b"v4"))
        .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"v4");
    assert_eq!(cache.entries().unwrap().len(), 1);
}

#[test]
#[serial]
fn test_replace_discards_previous_artifact() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();

    let old = cache.cache_file(&download("https://v1"), write(b"1")).unwrap();
    let outside = tmp.path().join("keep.txt");
    std::fs::write(&outside, b"mine").unwrap();

    let new = cache
        .cache_file_with(
            &download("https://v2"),
            BuildOptions::default().replace(&old),
            write(b"2"),
        )
        .unwrap();
    assert!(new.exists());
    assert!(!old.exists());
    assert_eq!(cache.entries().unwrap().len(), 1);

    // Paths outside the cache directory are left alone
    cache
        .cache_file_with(
            &download("https://v3"),
            BuildOptions::default().replace(&outside),
            write(b"3"),
        )
        .unwrap();
    assert!(outside.exists());
}

#[test]
#[serial]
fn test_purge_with_filter_and_everything() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();

    let grib = cache.cache_file(&download("https://a"), write(b"aaaa")).unwrap();
    let index = cache
        .cache_file(&Recipe::new("index", 1).extension(".idx"), write(b"ii"))
        .unwrap();

    let filter = EntryFilter {
        owner: Some("index".into()),
        ..EntryFilter::default()
    };
    assert_eq!(cache.purge(Some(filter.into_matcher())).unwrap(), Some(2));
    assert!(grib.exists());
    assert!(!index.exists());

    assert_eq!(cache.purge(None).unwrap(), Some(4));
    assert!(!grib.exists());
    assert_eq!(cache.size().unwrap(), Some(0));
}

#[test]
#[serial]
fn test_size_limit_evicts_least_recently_used() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "user").with_maximum_size(Some(250))).unwrap();

    let first = cache.cache_file(&download("https://1"), write(&[1; 100])).unwrap();
    let second = cache.cache_file(&download("https://2"), write(&[2; 100])).unwrap();
    // Touch the first entry so the second becomes least recently used
    cache.cache_file(&download("https://1"), write(&[0; 1])).unwrap();
    let third = cache.cache_file(&download("https://3"), write(&[3; 100])).unwrap();

    cache.check_size().unwrap();

    assert!(first.exists());
    assert!(!second.exists());
    assert!(third.exists());
    assert_eq!(cache.size().unwrap(), Some(200));
}

#[test]
#[serial]
fn test_user_cache_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let path = {
        let cache = Cache::new(settings(tmp.path(), "user")).unwrap();
        cache.cache_file(&download("https://a"), write(b"persisted")).unwrap()
    };

    let cache = Cache::new(settings(tmp.path(), "user")).unwrap();
    let again = cache
        .cache_file(&download("https://a"), |_: &Path, _: &ArgValue| {
            Err::<Option<Value>, BoxError>("must not rebuild".into())
        })
        .unwrap();
    assert_eq!(path, again);
    assert_eq!(cache.entries().unwrap()[0].accesses, 2);
}

#[test]
#[serial]
fn test_temporary_cache_is_removed_on_drop() {
    let tmp = TempDir::new().unwrap();
    let cache = Cache::new(settings(tmp.path(), "temporary")).unwrap();
    let dir = cache.directory().unwrap().unwrap();
    assert!(dir.starts_with(tmp.path().join("tmp")));

    let path = cache.cache_file(&download("https://a"), write(b"x")).unwrap();
    assert!(path.starts_with(&dir));
    assert_eq!(cache.size().unwrap(), Some(1));

    drop(cache);
    assert!(!dir.exists());
}
