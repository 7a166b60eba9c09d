//! `sftd check`: report the SFT definitions the daemon would drop.

use anyhow::bail;
use sft_core::scheduler::{resolve, ResolvedSft, Schedule};
use sft_core::{Config, DefinitionError, DefinitionStore, SftDefinition, SqliteStore};

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.database_path())?;
    let definitions = store.list_sfts().await?;
    if definitions.is_empty() {
        println!("No SFTs defined.");
        return Ok(());
    }

    let mut dropped = 0;
    for definition in definitions {
        let name = definition.name.clone();
        match check_definition(&store, definition).await {
            Ok(resolved) => println!(
                "✓ {:<20} {} clusters, {} VOs, {} tests",
                name,
                resolved.clusters.len(),
                resolved.vos.len(),
                resolved.tests.len()
            ),
            Err(e) => {
                dropped += 1;
                println!("✗ {:<20} {}", name, e);
            }
        }
    }

    if dropped > 0 {
        bail!("{} SFT definition(s) would be dropped", dropped);
    }
    Ok(())
}

/// Everything the housekeeper checks before it builds an event.
async fn check_definition(
    store: &dyn DefinitionStore,
    definition: SftDefinition,
) -> Result<ResolvedSft, DefinitionError> {
    let resolved = resolve(store, definition).await?;
    let d = &resolved.definition;
    Schedule::parse(&d.minute, &d.hour, &d.day, &d.month, &d.day_of_week).map_err(|source| {
        DefinitionError::InvalidSchedule {
            sft: d.name.clone(),
            source,
        }
    })?;
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sft_core::testing::seed_sft;

    #[tokio::test]
    async fn valid_definition_passes() {
        let store = SqliteStore::open_in_memory().unwrap();
        let def = SftDefinition::new("nightly", "ce-all", "swiss", "basic")
            .with_schedule("0", "2", "*", "*", "*");
        seed_sft(&store, &def, &["ce1"], &[("smscg", &["/CN=a"])], &["env"])
            .await
            .unwrap();

        let resolved = check_definition(&store, def).await.unwrap();
        assert_eq!(resolved.clusters.len(), 1);
    }

    #[tokio::test]
    async fn bad_schedule_is_reported() {
        let store = SqliteStore::open_in_memory().unwrap();
        let def = SftDefinition::new("nightly", "ce-all", "swiss", "basic")
            .with_schedule("1,a", "*", "*", "*", "*");
        seed_sft(&store, &def, &["ce1"], &[("smscg", &["/CN=a"])], &["env"])
            .await
            .unwrap();

        let err = check_definition(&store, def).await.unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidSchedule { .. }));
    }
}
