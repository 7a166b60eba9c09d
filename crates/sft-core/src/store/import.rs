//! Bulk definition loading from a TOML document.
//!
//! ```toml
//! [[cluster]]
//! hostname = "ce1.example.org"
//!
//! [[cluster_group]]
//! name = "swiss"
//! clusters = ["ce1.example.org"]
//!
//! [[vo]]
//! name = "smscg"
//!
//! [[user]]
//! dn = "/DC=ch/CN=tester"
//! secret = "passphrase"
//! vos = ["smscg"]
//!
//! [[vo_group]]
//! name = "swiss-vos"
//! vos = ["smscg"]
//!
//! [[test]]
//! name = "env"
//! description = "&(executable=/usr/bin/env)(stdout=stdout.txt)(stderr=stderr.txt)"
//!
//! [[test_suite]]
//! name = "basic"
//! tests = ["env"]
//!
//! [[sft]]
//! name = "nightly"
//! cluster_group = "swiss"
//! vo_group = "swiss-vos"
//! test_suite = "basic"
//! minute = "0"
//! hour = "2"
//!
//! [[downtime]]
//! host = "ce1.example.org"
//! start = "2024-05-01T08:00:00"
//! end = "2024-05-01T18:00:00"
//! ```

use serde::Deserialize;
use std::path::Path;

use super::{SqliteStore, StoreError};
use crate::types::{Cluster, DowntimeWindow, SftDefinition, Test, User};

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterGroupEntry {
    pub name: String,
    #[serde(default)]
    pub clusters: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoEntry {
    pub name: String,
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub vos: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoGroupEntry {
    pub name: String,
    #[serde(default)]
    pub vos: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestSuiteEntry {
    pub name: String,
    #[serde(default)]
    pub tests: Vec<String>,
}

/// Everything an administrator declares about SFTs, in load order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefinitionBundle {
    pub cluster: Vec<Cluster>,
    pub cluster_group: Vec<ClusterGroupEntry>,
    pub vo: Vec<VoEntry>,
    pub user: Vec<UserEntry>,
    pub vo_group: Vec<VoGroupEntry>,
    pub test: Vec<Test>,
    pub test_suite: Vec<TestSuiteEntry>,
    pub sft: Vec<SftDefinition>,
    pub downtime: Vec<DowntimeWindow>,
}

/// Counts of the entities written by [`SqliteStore::import`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub clusters: usize,
    pub users: usize,
    pub tests: usize,
    pub sfts: usize,
    pub downtimes: usize,
}

impl DefinitionBundle {
    pub fn from_toml(text: &str) -> Result<Self, StoreError> {
        toml::from_str(text).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }
}

impl SqliteStore {
    /// Write a bundle, leaves first so that memberships resolve.
    ///
    /// With `replace_downtime` the existing downtime table is cleared before
    /// the bundle's windows are added.
    pub async fn import(
        &self,
        bundle: &DefinitionBundle,
        replace_downtime: bool,
    ) -> Result<ImportSummary, StoreError> {
        for cluster in &bundle.cluster {
            self.upsert_cluster(cluster).await?;
        }
        for group in &bundle.cluster_group {
            self.upsert_cluster_group(&group.name, &group.clusters).await?;
        }
        for vo in &bundle.vo {
            self.upsert_vo(&vo.name, vo.server.as_deref()).await?;
        }
        for entry in &bundle.user {
            self.upsert_user(&entry.user, &entry.vos).await?;
        }
        for group in &bundle.vo_group {
            self.upsert_vo_group(&group.name, &group.vos).await?;
        }
        for test in &bundle.test {
            self.upsert_test(test).await?;
        }
        for suite in &bundle.test_suite {
            self.upsert_test_suite(&suite.name, &suite.tests).await?;
        }
        for sft in &bundle.sft {
            self.upsert_sft(sft).await?;
        }
        if replace_downtime {
            self.clear_downtime().await?;
        }
        for window in &bundle.downtime {
            self.add_downtime(window).await?;
        }

        Ok(ImportSummary {
            clusters: bundle.cluster.len(),
            users: bundle.user.len(),
            tests: bundle.test.len(),
            sfts: bundle.sft.len(),
            downtimes: bundle.downtime.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DefinitionStore, DowntimeSource};

    const BUNDLE: &str = r#"
        [[cluster]]
        hostname = "ce1.example.org"

        [[cluster_group]]
        name = "swiss"
        clusters = ["ce1.example.org"]

        [[vo]]
        name = "smscg"

        [[user]]
        dn = "/DC=ch/CN=tester"
        secret = "passphrase"
        vos = ["smscg"]

        [[vo_group]]
        name = "swiss-vos"
        vos = ["smscg"]

        [[test]]
        name = "env"
        description = "&(executable=/usr/bin/env)"

        [[test_suite]]
        name = "basic"
        tests = ["env"]

        [[sft]]
        name = "nightly"
        cluster_group = "swiss"
        vo_group = "swiss-vos"
        test_suite = "basic"
        minute = "0"
        hour = "2"

        [[downtime]]
        host = "ce1.example.org"
        start = "2024-05-01T08:00:00"
        end = "2024-05-01T18:00:00"
    "#;

    #[tokio::test]
    async fn import_populates_every_table() {
        let bundle = DefinitionBundle::from_toml(BUNDLE).unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        let summary = store.import(&bundle, true).await.unwrap();
        assert_eq!(summary.sfts, 1);

        let sft = store.get_sft("nightly").await.unwrap().unwrap();
        assert_eq!(sft.hour, "2");
        assert_eq!(sft.day, "*");

        let vos = store.get_vo_group("swiss-vos").await.unwrap().unwrap();
        assert_eq!(vos.vos[0].users[0].secret, "passphrase");
        assert_eq!(store.downtime_windows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reimport_replaces_downtime() {
        let bundle = DefinitionBundle::from_toml(BUNDLE).unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        store.import(&bundle, true).await.unwrap();
        store.import(&bundle, true).await.unwrap();
        assert_eq!(store.downtime_windows().await.unwrap().len(), 1);
    }

    #[test]
    fn unknown_membership_is_rejected_at_import() {
        let bundle = DefinitionBundle::from_toml(
            r#"
            [[cluster_group]]
            name = "g"
            clusters = ["missing.example.org"]
            "#,
        )
        .unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(rt.block_on(store.import(&bundle, false)).is_err());
    }
}
