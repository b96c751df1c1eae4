//! CLI-specific errors with miette diagnostics

use miette::Diagnostic;
use thiserror::Error;

/// Errors raised by the CLI itself; cache errors pass through unchanged
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("Refusing to purge the whole cache")]
    #[diagnostic(
        code(hoard::cli::purge_everything),
        help("Pass --all to evict every entry, or narrow the selection with --owner, --path-contains, --older-than or --orphans")
    )]
    PurgeNeedsSelection,

    #[error("Failed to render output")]
    #[diagnostic(code(hoard::cli::output))]
    Output {
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cache(#[from] hoard_cache::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
