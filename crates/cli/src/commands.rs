//! Subcommand implementations

#![allow(clippy::print_stdout)]

use crate::cli::{Commands, OutputFormat, Selection};
use crate::errors::{CliError, Result};
use chrono::Utc;
use hoard_cache::settings::bytes_to_string;
use hoard_cache::{Cache, CacheEntry, EntryFilter};
use serde::Serialize;
use tracing::{info, instrument};

impl From<Selection> for EntryFilter {
    fn from(selection: Selection) -> Self {
        Self {
            owner: selection.owner,
            path_contains: selection.path_contains,
            accessed_before: selection
                .older_than
                .map(|days| Utc::now() - chrono::Duration::days(i64::from(days))),
            orphans_only: selection.orphans,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Info {
    policy: &'static str,
    directory: Option<String>,
    maximum_cache_size: Option<u64>,
    maximum_cache_disk_usage: Option<f64>,
    use_index_cache: bool,
    size: Option<u64>,
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|source| CliError::Output { source })
}

/// Run one subcommand against `cache`
#[instrument(skip(cache))]
pub fn execute(cache: &Cache, command: Commands) -> Result<()> {
    match command {
        Commands::Info { format } => info_command(cache, format),
        Commands::Size { bytes } => size_command(cache, bytes),
        Commands::Entries { selection, format } => entries_command(cache, selection, format),
        Commands::Purge { selection, all } => purge_command(cache, selection, all),
        Commands::CheckSize => {
            cache.check_size()?;
            size_command(cache, false)
        }
        Commands::Directory => {
            match cache.directory()? {
                Some(dir) => println!("{}", dir.display()),
                None => println!("Caching is disabled"),
            }
            Ok(())
        }
    }
}

fn info_command(cache: &Cache, format: OutputFormat) -> Result<()> {
    let settings = cache.settings()?;
    let info = Info {
        policy: cache.policy_name()?,
        directory: cache.directory()?.map(|d| d.display().to_string()),
        maximum_cache_size: settings.maximum_cache_size,
        maximum_cache_disk_usage: settings.maximum_cache_disk_usage,
        use_index_cache: cache.index_cache_enabled()?,
        size: cache.size()?,
    };
    match format {
        OutputFormat::Json => println!("{}", to_json(&info)?),
        OutputFormat::Text => {
            println!("policy:          {}", info.policy);
            println!(
                "directory:       {}",
                info.directory.as_deref().unwrap_or("-")
            );
            println!(
                "maximum size:    {}",
                info.maximum_cache_size.map_or_else(|| "-".to_string(), bytes_to_string)
            );
            println!(
                "maximum usage:   {}",
                info.maximum_cache_disk_usage
                    .map_or_else(|| "-".to_string(), |p| format!("{p}%"))
            );
            println!("index cache:     {}", info.use_index_cache);
            println!(
                "size:            {}",
                info.size.map_or_else(|| "-".to_string(), bytes_to_string)
            );
        }
    }
    Ok(())
}

fn size_command(cache: &Cache, bytes: bool) -> Result<()> {
    match cache.size()? {
        Some(size) if bytes => println!("{size}"),
        Some(size) => println!("{}", bytes_to_string(size)),
        None => println!("Caching is disabled"),
    }
    Ok(())
}

fn entry_line(entry: &CacheEntry) -> String {
    let size = entry
        .size
        .map_or_else(|| "building".to_string(), bytes_to_string);
    format!(
        "{:>10}  {}  {:>5}  {:<12}  {}",
        size,
        entry.last_access.format("%Y-%m-%d %H:%M"),
        entry.accesses,
        entry.owner,
        entry.path.display()
    )
}

fn entries_command(cache: &Cache, selection: Selection, format: OutputFormat) -> Result<()> {
    let filter = EntryFilter::from(selection);
    let entries: Vec<CacheEntry> = cache
        .entries()?
        .into_iter()
        .filter(|e| filter.matches(e))
        .collect();
    match format {
        OutputFormat::Json => println!("{}", to_json(&entries)?),
        OutputFormat::Text => {
            for entry in &entries {
                println!("{}", entry_line(entry));
            }
        }
    }
    Ok(())
}

fn purge_command(cache: &Cache, selection: Selection, all: bool) -> Result<()> {
    let filter = EntryFilter::from(selection);
    let matcher = match (filter.is_empty(), all) {
        (true, false) => return Err(CliError::PurgeNeedsSelection),
        (true, true) => None,
        (false, _) => Some(filter.into_matcher()),
    };
    match cache.purge(matcher)? {
        Some(freed) => {
            info!(freed, "Purge finished");
            println!("Freed {}", bytes_to_string(freed));
        }
        None => println!("Caching is disabled"),
    }
    Ok(())
}
