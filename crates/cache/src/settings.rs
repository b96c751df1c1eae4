//! Cache configuration
//!
//! The cache consumes a handful of named settings. They can come from
//! defaults, from `HOARD_*` environment variables, or from a TOML file;
//! changes are delivered to a running cache through
//! [`Cache::reconfigure`](crate::Cache::reconfigure).

use crate::{Error, Result};
use dirs::{cache_dir, home_dir};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache policy
pub const ENV_POLICY: &str = "HOARD_CACHE_POLICY";
/// Environment variable overriding the user cache directory
pub const ENV_USER_DIRECTORY: &str = "HOARD_USER_CACHE_DIRECTORY";
/// Environment variable overriding the temporary directory root
pub const ENV_TEMPORARY_ROOT: &str = "HOARD_TEMPORARY_DIRECTORY_ROOT";
/// Environment variable overriding the absolute size ceiling
pub const ENV_MAXIMUM_SIZE: &str = "HOARD_MAXIMUM_CACHE_SIZE";
/// Environment variable overriding the disk usage ceiling
pub const ENV_MAXIMUM_DISK_USAGE: &str = "HOARD_MAXIMUM_CACHE_DISK_USAGE";
/// Environment variable toggling auxiliary index caching
pub const ENV_USE_INDEX_CACHE: &str = "HOARD_USE_INDEX_CACHE";

/// Settings consumed by the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheSettings {
    /// Policy name: `off`, `temporary` or `user`
    pub cache_policy: String,
    /// Persistent directory used by the `user` policy
    pub user_cache_directory: PathBuf,
    /// Parent of the process-lifetime directory for `off` and `temporary`
    pub temporary_directory_root: Option<PathBuf>,
    /// Absolute ceiling in bytes
    #[serde(deserialize_with = "deserialize_size")]
    pub maximum_cache_size: Option<u64>,
    /// Ceiling on the percentage of the hosting disk in use
    #[serde(deserialize_with = "deserialize_percent")]
    pub maximum_cache_disk_usage: Option<f64>,
    /// Whether clients should cache auxiliary indexes
    pub use_index_cache: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_policy: "user".to_string(),
            user_cache_directory: default_user_directory(),
            temporary_directory_root: None,
            maximum_cache_size: None,
            maximum_cache_disk_usage: Some(95.0),
            use_index_cache: true,
        }
    }
}

impl CacheSettings {
    /// Defaults overlaid with `HOARD_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Overlay `HOARD_*` environment variables onto these settings
    pub fn with_env(mut self) -> Result<Self> {
        if let Some(policy) = env_value(ENV_POLICY) {
            self.cache_policy = policy;
        }
        if let Some(dir) = env_value(ENV_USER_DIRECTORY) {
            self.user_cache_directory = PathBuf::from(dir);
        }
        if let Some(root) = env_value(ENV_TEMPORARY_ROOT) {
            self.temporary_directory_root = Some(PathBuf::from(root));
        }
        if let Some(size) = env_value(ENV_MAXIMUM_SIZE) {
            self.maximum_cache_size = parse_size(&size)?;
        }
        if let Some(usage) = env_value(ENV_MAXIMUM_DISK_USAGE) {
            self.maximum_cache_disk_usage = parse_percent(&usage)?;
        }
        if let Some(flag) = env_value(ENV_USE_INDEX_CACHE) {
            self.use_index_cache = parse_bool(&flag)?;
        }
        Ok(self)
    }

    /// Parse settings from TOML text; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| Error::configuration(format!("Invalid cache settings: {e}")))
    }

    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read"))?;
        Self::from_toml_str(&text)
    }

    /// Set the policy name
    #[must_use]
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.cache_policy = policy.into();
        self
    }

    /// Set the user cache directory
    #[must_use]
    pub fn with_user_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_cache_directory = dir.into();
        self
    }

    /// Set the temporary directory root
    #[must_use]
    pub fn with_temporary_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temporary_directory_root = Some(root.into());
        self
    }

    /// Set the absolute size ceiling
    #[must_use]
    pub const fn with_maximum_size(mut self, bytes: Option<u64>) -> Self {
        self.maximum_cache_size = bytes;
        self
    }

    /// Set the disk usage ceiling
    #[must_use]
    pub const fn with_maximum_disk_usage(mut self, percent: Option<f64>) -> Self {
        self.maximum_cache_disk_usage = percent;
        self
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Inputs for determining the default user cache directory
#[derive(Debug, Clone)]
struct DirectoryInputs {
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn user_directory_from_inputs(inputs: DirectoryInputs) -> PathBuf {
    // Resolution order (first usable wins):
    // 1) XDG_CACHE_HOME/hoard
    // 2) OS cache dir/hoard
    // 3) ~/.cache/hoard
    // 4) TMPDIR/hoard
    [
        inputs.xdg_cache_home,
        inputs.os_cache_dir,
        inputs.home_dir.map(|h| h.join(".cache")),
    ]
    .into_iter()
    .flatten()
    .find(|p| !p.starts_with("/homeless-shelter"))
    .map_or_else(|| inputs.temp_dir.join("hoard"), |p| p.join("hoard"))
}

fn default_user_directory() -> PathBuf {
    user_directory_from_inputs(DirectoryInputs {
        xdg_cache_home: env_value("XDG_CACHE_HOME").map(PathBuf::from),
        os_cache_dir: cache_dir(),
        home_dir: home_dir(),
        temp_dir: std::env::temp_dir(),
    })
}

/// Parse a byte count such as `1024`, `"5GB"` or `"512 MiB"`
///
/// `"none"`/`"off"`/empty disable the limit.
pub fn parse_size(text: &str) -> Result<Option<u64>> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("none") || text.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| Error::configuration(format!("Invalid cache size: {text}")))?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        other => {
            return Err(Error::configuration(format!(
                "Unknown size unit '{other}' in {text}"
            )));
        }
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let bytes = (number * multiplier as f64) as u64;
    Ok(Some(bytes))
}

/// Parse a percentage such as `90` or `"90%"`
pub fn parse_percent(text: &str) -> Result<Option<f64>> {
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("none") || text.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let value: f64 = text
        .trim_end_matches('%')
        .trim()
        .parse()
        .map_err(|_| Error::configuration(format!("Invalid disk usage percentage: {text}")))?;
    if !(0.0..=100.0).contains(&value) {
        return Err(Error::configuration(format!(
            "Disk usage percentage must be between 0 and 100, got {value}"
        )));
    }
    Ok(Some(value))
}

fn parse_bool(text: &str) -> Result<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::configuration(format!("Invalid boolean: {other}"))),
    }
}

/// Render a byte count for log messages
#[must_use]
pub fn bytes_to_string(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(f64),
    Text(String),
}

fn deserialize_size<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    match Option::<NumberOrText>::deserialize(d)? {
        None => Ok(None),
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(NumberOrText::Number(n)) => Ok(Some(n as u64)),
        Some(NumberOrText::Text(s)) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_percent<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<f64>, D::Error> {
    match Option::<NumberOrText>::deserialize(d)? {
        None => Ok(None),
        Some(NumberOrText::Number(n)) => parse_percent(&n.to_string()).map_err(serde::de::Error::custom),
        Some(NumberOrText::Text(s)) => parse_percent(&s).map_err(serde::de::Error::custom),
    }
}
