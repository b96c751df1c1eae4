//! Recipes and their content-addressed file names

use crate::args::ArgValue;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

/// Default extension for cached artifacts
pub const DEFAULT_EXTENSION: &str = ".cache";

/// Everything that determines where an artifact lives in the cache
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    owner: String,
    tag: String,
    args: ArgValue,
    hash_extra: ArgValue,
    extension: String,
}

/// Hashed envelope for a recipe
#[derive(Serialize)]
struct RecipeEnvelope<'a> {
    owner: &'a str,
    args: &'a ArgValue,
    hash_extra: &'a ArgValue,
    extension: &'a str,
}

impl Recipe {
    /// Create a recipe for `owner` with the given arguments
    pub fn new(owner: impl Into<String>, args: impl Into<ArgValue>) -> Self {
        let owner = owner.into();
        Self {
            tag: owner.to_lowercase(),
            owner,
            args: args.into(),
            hash_extra: ArgValue::Null,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Mix extra data into the key without storing it as arguments
    #[must_use]
    pub fn hash_extra(mut self, extra: impl Into<ArgValue>) -> Self {
        self.hash_extra = extra.into();
        self
    }

    /// Set the artifact extension (including the leading dot)
    #[must_use]
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Owner tag, lower-cased
    ///
    /// Entries are recorded under this tag and file names start with it.
    /// The digest covers the owner as given.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.tag
    }

    /// Owner tag, refused when it could escape the cache directory
    pub(crate) fn file_prefix(&self) -> Result<&str> {
        let tag = self.tag.as_str();
        if tag.is_empty() || tag.contains("..") || tag.chars().any(std::path::is_separator) {
            return Err(Error::configuration(format!(
                "Invalid recipe owner {:?}: owners must be non-empty and contain no path separators or '..'",
                self.owner
            )));
        }
        Ok(tag)
    }

    /// Recipe arguments
    #[must_use]
    pub const fn args(&self) -> &ArgValue {
        &self.args
    }

    /// Artifact extension
    #[must_use]
    pub fn ext(&self) -> &str {
        &self.extension
    }

    /// Compute the hex SHA-256 digest identifying this recipe
    pub fn digest(&self) -> Result<String> {
        let envelope = RecipeEnvelope {
            owner: &self.owner,
            args: &self.args,
            hash_extra: &self.hash_extra,
            extension: &self.extension,
        };
        // BTreeMap-backed maps keep the encoding canonical
        let json: Value = serde_json::to_value(&envelope)
            .map_err(|e| Error::serialization(format!("Failed to encode recipe: {e}")))?;
        let bytes = serde_json::to_vec(&json)
            .map_err(|e| Error::serialization(format!("Failed to serialize recipe: {e}")))?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }

    /// File name of the artifact: `{owner}-{digest}{extension}`
    pub fn file_name(&self) -> Result<String> {
        Ok(format!("{}-{}{}", self.file_prefix()?, self.digest()?, self.extension))
    }

    /// Full artifact path inside `directory`
    pub fn path_in(&self, directory: &Path) -> Result<PathBuf> {
        Ok(directory.join(self.file_name()?))
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.owner, self.extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn baseline() -> Recipe {
        Recipe::new(
            "url",
            ArgValue::map([("url", "https://example.com/data.grib")]),
        )
    }

    #[test]
    fn file_name_has_owner_prefix_and_extension() {
        let name = baseline().extension(".grib").file_name().unwrap();
        assert!(name.starts_with("url-"));
        assert!(name.ends_with(".grib"));
        // owner + '-' + 64 hex chars + extension
        assert_eq!(name.len(), 4 + 64 + 5);
    }

    #[test]
    fn owner_case_is_folded_only_in_the_name() {
        let upper = Recipe::new("URL", ArgValue::Null);
        let lower = Recipe::new("url", ArgValue::Null);
        assert_eq!(upper.owner(), "url");
        assert!(upper.file_name().unwrap().starts_with("url-"));
        assert_ne!(upper.digest().unwrap(), lower.digest().unwrap());
        assert_ne!(upper.file_name().unwrap(), lower.file_name().unwrap());
    }

    #[test]
    fn owners_that_escape_the_directory_are_rejected() {
        for owner in ["../x", "a/b", "..", ""] {
            let err = Recipe::new(owner, ArgValue::Null).file_name().unwrap_err();
            assert!(matches!(err, Error::Configuration { .. }), "{owner}: {err}");
            assert!(Recipe::new(owner, ArgValue::Null).path_in(Path::new("/cache")).is_err());
        }
        assert!(Recipe::new("grib-index", ArgValue::Null).file_name().is_ok());
    }

    #[test]
    fn key_changes_with_each_component() {
        let base = baseline().digest().unwrap();
        assert_ne!(base, Recipe::new("file", baseline().args().clone()).digest().unwrap());
        assert_ne!(base, baseline().hash_extra("v2").digest().unwrap());
        assert_ne!(base, baseline().extension(".nc").digest().unwrap());
        assert_ne!(
            base,
            Recipe::new("url", ArgValue::map([("url", "https://example.com/other")]))
                .digest()
                .unwrap()
        );
    }

    #[test]
    fn key_is_stable_across_calls() {
        let recipe = baseline();
        assert_eq!(recipe.digest().unwrap(), recipe.digest().unwrap());
    }

    proptest! {
        #[test]
        fn key_ignores_map_insertion_order(
            pairs in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8)
        ) {
            let forward = ArgValue::map(pairs.clone());
            let reversed = ArgValue::map(pairs.into_iter().rev());
            let a = Recipe::new("owner", forward).file_name().unwrap();
            let b = Recipe::new("owner", reversed).file_name().unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
