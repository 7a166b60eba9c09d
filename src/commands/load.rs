//! `sftd load <definitions.toml>`.

use anyhow::Context;
use clap::ArgMatches;
use sft_core::store::DefinitionBundle;
use sft_core::{Config, SqliteStore};
use std::path::PathBuf;

pub async fn run(config: &Config, matches: &ArgMatches) -> anyhow::Result<()> {
    let path = matches
        .get_one::<String>("file")
        .map(PathBuf::from)
        .context("a definitions file is required")?;
    let replace_downtime = matches.get_flag("replace-downtime");

    let bundle = DefinitionBundle::from_file(&path)?;
    let store = SqliteStore::open(&config.database_path())?;
    let summary = store.import(&bundle, replace_downtime).await?;
    tracing::info!(file = %path.display(), ?summary, "Definitions loaded");

    println!("✓ Loaded {} into {}", path.display(), config.database_path().display());
    println!("  clusters:  {}", summary.clusters);
    println!("  users:     {}", summary.users);
    println!("  tests:     {}", summary.tests);
    println!("  SFTs:      {}", summary.sfts);
    println!("  downtimes: {}", summary.downtimes);
    Ok(())
}
