//! Declarative purge predicates

use crate::manager::Matcher;
use crate::store::CacheEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entry selection for [`crate::Cache::purge`]
///
/// All set criteria must match. An empty filter matches every entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EntryFilter {
    /// Exact owner tag (case-insensitive)
    pub owner: Option<String>,
    /// Substring of the entry path
    pub path_contains: Option<String>,
    /// Only entries last used before this instant
    pub accessed_before: Option<DateTime<Utc>>,
    /// Only orphans
    pub orphans_only: bool,
}

impl EntryFilter {
    /// Whether `entry` satisfies every set criterion
    #[must_use]
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        if let Some(owner) = &self.owner
            && !entry.owner.eq_ignore_ascii_case(owner)
        {
            return false;
        }
        if let Some(needle) = &self.path_contains
            && !entry.path.to_string_lossy().contains(needle.as_str())
        {
            return false;
        }
        if let Some(cutoff) = self.accessed_before
            && entry.last_access >= cutoff
        {
            return false;
        }
        !self.orphans_only || entry.is_orphan()
    }

    /// Whether no criterion is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Box into a matcher for the manager
    #[must_use]
    pub fn into_matcher(self) -> Matcher {
        Box::new(move |entry| self.matches(entry))
    }
}
