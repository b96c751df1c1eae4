//! `hoard`: inspect and prune a content-addressed artifact cache

mod cli;
mod commands;
mod errors;
mod tracing;

use crate::cli::Cli;
use crate::tracing::{TracingConfig, TracingFormat};
use hoard_cache::{Cache, CacheSettings};

fn load_settings(cli: &Cli) -> hoard_cache::Result<CacheSettings> {
    let settings = match &cli.config {
        Some(path) => CacheSettings::load(path)?.with_env()?,
        None => CacheSettings::from_env()?,
    };
    Ok(match &cli.policy {
        Some(policy) => settings.with_policy(policy.as_str()),
        None => settings,
    })
}

fn tracing_config(cli: &Cli) -> TracingConfig {
    TracingConfig {
        format: if cli.json {
            TracingFormat::Json
        } else {
            TracingFormat::Compact
        },
        level: cli.level.into(),
    }
}

fn main() -> miette::Result<()> {
    let cli = cli::parse();

    crate::tracing::init_tracing(tracing_config(&cli))?;

    let span = ::tracing::info_span!("hoard", correlation_id = %crate::tracing::correlation_id());
    let _guard = span.enter();

    let settings = load_settings(&cli)?;
    let cache = Cache::new(settings)?;
    commands::execute(&cache, cli.command)?;
    Ok(())
}
