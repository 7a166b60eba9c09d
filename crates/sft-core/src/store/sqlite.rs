//! SQLite-backed definition, job and downtime store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;

use super::{DefinitionStore, DowntimeSource, JobStore, StoreError};
use crate::types::{
    Cluster, ClusterGroup, DowntimeWindow, Job, JobId, JobStatus, SftDefinition, Test, TestSuite,
    User, Vo, VoGroup,
};

const DOWNTIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const JOB_COLUMNS: &str = "id, sft_name, cluster, vo, test_name, dn, remote_id, status,
    error_type, error_msg, output_dir, artifact, submitted_at, last_modified";

/// Single-connection SQLite store implementing every persistence trait.
pub struct SqliteStore {
    conn: tokio::sync::Mutex<rusqlite::Connection>,
}

fn sql_err(e: rusqlite::Error) -> StoreError {
    StoreError::Sqlite(e.to_string())
}

/// Fixed-width UTC timestamps so that text comparison orders correctly.
fn fmt_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("timestamp '{s}': {e}")))
}

fn status_list(statuses: &[JobStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = rusqlite::Connection::open(path).map_err(sql_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory().map_err(sql_err)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: tokio::sync::Mutex::new(conn),
        })
    }

    /// Default database path: `$XDG_DATA_HOME/sftd/sft.db`
    pub fn default_path() -> std::path::PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        base.join("sftd").join("sft.db")
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS cluster (
                hostname TEXT PRIMARY KEY,
                alias    TEXT
            );

            CREATE TABLE IF NOT EXISTS cluster_group (
                name TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS cluster_group_member (
                group_name TEXT NOT NULL REFERENCES cluster_group(name) ON DELETE CASCADE,
                hostname   TEXT NOT NULL REFERENCES cluster(hostname) ON DELETE CASCADE,
                PRIMARY KEY (group_name, hostname)
            );

            CREATE TABLE IF NOT EXISTS vo (
                name   TEXT PRIMARY KEY,
                server TEXT
            );

            CREATE TABLE IF NOT EXISTS vo_group (
                name TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS vo_group_member (
                group_name TEXT NOT NULL REFERENCES vo_group(name) ON DELETE CASCADE,
                vo_name    TEXT NOT NULL REFERENCES vo(name) ON DELETE CASCADE,
                PRIMARY KEY (group_name, vo_name)
            );

            CREATE TABLE IF NOT EXISTS grid_user (
                dn           TEXT PRIMARY KEY,
                display_name TEXT,
                secret       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vo_user (
                vo_name TEXT NOT NULL REFERENCES vo(name) ON DELETE CASCADE,
                dn      TEXT NOT NULL REFERENCES grid_user(dn) ON DELETE CASCADE,
                PRIMARY KEY (vo_name, dn)
            );

            CREATE TABLE IF NOT EXISTS test (
                name        TEXT PRIMARY KEY,
                description TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS test_suite (
                name TEXT PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS test_suite_member (
                suite_name TEXT NOT NULL REFERENCES test_suite(name) ON DELETE CASCADE,
                test_name  TEXT NOT NULL REFERENCES test(name) ON DELETE CASCADE,
                PRIMARY KEY (suite_name, test_name)
            );

            CREATE TABLE IF NOT EXISTS sft (
                name          TEXT PRIMARY KEY,
                cluster_group TEXT NOT NULL,
                vo_group      TEXT NOT NULL,
                test_suite    TEXT NOT NULL,
                minute        TEXT NOT NULL DEFAULT '*',
                hour          TEXT NOT NULL DEFAULT '*',
                day           TEXT NOT NULL DEFAULT '*',
                month         TEXT NOT NULL DEFAULT '*',
                day_of_week   TEXT NOT NULL DEFAULT '*'
            );

            CREATE TABLE IF NOT EXISTS sft_job (
                id            TEXT PRIMARY KEY,
                sft_name      TEXT NOT NULL,
                cluster       TEXT NOT NULL,
                vo            TEXT NOT NULL,
                test_name     TEXT NOT NULL,
                dn            TEXT NOT NULL,
                remote_id     TEXT,
                status        TEXT NOT NULL,
                error_type    TEXT,
                error_msg     TEXT,
                output_dir    TEXT,
                artifact      TEXT,
                submitted_at  TEXT NOT NULL,
                last_modified TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_downtime (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                host       TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time   TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sft_job_status ON sft_job(status);
            CREATE INDEX IF NOT EXISTS idx_sft_job_last_modified ON sft_job(last_modified);
            CREATE INDEX IF NOT EXISTS idx_sft_job_sft ON sft_job(sft_name);",
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ── Definition writers ────────────────────────────────────────────

    pub async fn upsert_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO cluster (hostname, alias) VALUES (?1, ?2)
             ON CONFLICT(hostname) DO UPDATE SET alias = excluded.alias",
            rusqlite::params![cluster.hostname, cluster.alias],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Create or replace a cluster group and its membership.
    pub async fn upsert_cluster_group(
        &self,
        name: &str,
        hostnames: &[String],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT OR IGNORE INTO cluster_group (name) VALUES (?1)",
            rusqlite::params![name],
        )
        .map_err(sql_err)?;
        tx.execute(
            "DELETE FROM cluster_group_member WHERE group_name = ?1",
            rusqlite::params![name],
        )
        .map_err(sql_err)?;
        for hostname in hostnames {
            tx.execute(
                "INSERT INTO cluster_group_member (group_name, hostname) VALUES (?1, ?2)",
                rusqlite::params![name, hostname],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    pub async fn upsert_vo(&self, name: &str, server: Option<&str>) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO vo (name, server) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET server = excluded.server",
            rusqlite::params![name, server],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Create or replace a user and the VOs it belongs to.
    pub async fn upsert_user(&self, user: &User, vos: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO grid_user (dn, display_name, secret) VALUES (?1, ?2, ?3)
             ON CONFLICT(dn) DO UPDATE SET display_name = excluded.display_name,
                                           secret = excluded.secret",
            rusqlite::params![user.dn, user.display_name, user.secret],
        )
        .map_err(sql_err)?;
        tx.execute(
            "DELETE FROM vo_user WHERE dn = ?1",
            rusqlite::params![user.dn],
        )
        .map_err(sql_err)?;
        for vo in vos {
            tx.execute(
                "INSERT INTO vo_user (vo_name, dn) VALUES (?1, ?2)",
                rusqlite::params![vo, user.dn],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    pub async fn upsert_vo_group(&self, name: &str, vos: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT OR IGNORE INTO vo_group (name) VALUES (?1)",
            rusqlite::params![name],
        )
        .map_err(sql_err)?;
        tx.execute(
            "DELETE FROM vo_group_member WHERE group_name = ?1",
            rusqlite::params![name],
        )
        .map_err(sql_err)?;
        for vo in vos {
            tx.execute(
                "INSERT INTO vo_group_member (group_name, vo_name) VALUES (?1, ?2)",
                rusqlite::params![name, vo],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    pub async fn upsert_test(&self, test: &Test) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO test (name, description) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET description = excluded.description",
            rusqlite::params![test.name, test.description],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub async fn upsert_test_suite(&self, name: &str, tests: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT OR IGNORE INTO test_suite (name) VALUES (?1)",
            rusqlite::params![name],
        )
        .map_err(sql_err)?;
        tx.execute(
            "DELETE FROM test_suite_member WHERE suite_name = ?1",
            rusqlite::params![name],
        )
        .map_err(sql_err)?;
        for test in tests {
            tx.execute(
                "INSERT INTO test_suite_member (suite_name, test_name) VALUES (?1, ?2)",
                rusqlite::params![name, test],
            )
            .map_err(sql_err)?;
        }
        tx.commit().map_err(sql_err)
    }

    pub async fn upsert_sft(&self, sft: &SftDefinition) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO sft
                (name, cluster_group, vo_group, test_suite, minute, hour, day, month, day_of_week)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                sft.name,
                sft.cluster_group,
                sft.vo_group,
                sft.test_suite,
                sft.minute,
                sft.hour,
                sft.day,
                sft.month,
                sft.day_of_week,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub async fn delete_sft(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute("DELETE FROM sft WHERE name = ?1", rusqlite::params![name])
            .map_err(sql_err)?;
        Ok(rows > 0)
    }

    pub async fn add_downtime(&self, window: &DowntimeWindow) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scheduled_downtime (host, start_time, end_time) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                window.host,
                window.start.format(DOWNTIME_FORMAT).to_string(),
                window.end.format(DOWNTIME_FORMAT).to_string(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub async fn clear_downtime(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM scheduled_downtime", [])
            .map_err(sql_err)
    }

    fn query_jobs(
        conn: &rusqlite::Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Job>, StoreError> {
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params, |row| Ok((row.get::<_, String>(0)?, row_to_job(row)?)))
            .map_err(sql_err)?;

        // One unreadable row must not hide every other job.
        let mut jobs = Vec::new();
        for row_result in rows {
            let (id, parsed) = row_result.map_err(sql_err)?;
            match parsed {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!(job = %id, "Skipping unreadable job row: {}", e),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl DefinitionStore for SqliteStore {
    async fn list_sfts(&self) -> Result<Vec<SftDefinition>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT name, cluster_group, vo_group, test_suite,
                        minute, hour, day, month, day_of_week
                 FROM sft ORDER BY name",
            )
            .map_err(sql_err)?;
        let rows = stmt.query_map([], row_to_sft).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    async fn get_sft(&self, name: &str) -> Result<Option<SftDefinition>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT name, cluster_group, vo_group, test_suite,
                    minute, hour, day, month, day_of_week
             FROM sft WHERE name = ?1",
            rusqlite::params![name],
            row_to_sft,
        )
        .optional()
        .map_err(sql_err)
    }

    async fn get_cluster_group(&self, name: &str) -> Result<Option<ClusterGroup>, StoreError> {
        let conn = self.conn.lock().await;
        if !group_exists(&conn, "cluster_group", name)? {
            return Ok(None);
        }
        let mut stmt = conn
            .prepare(
                "SELECT c.hostname, c.alias
                 FROM cluster_group_member m JOIN cluster c ON c.hostname = m.hostname
                 WHERE m.group_name = ?1 ORDER BY c.hostname",
            )
            .map_err(sql_err)?;
        let clusters = stmt
            .query_map(rusqlite::params![name], |row| {
                Ok(Cluster {
                    hostname: row.get(0)?,
                    alias: row.get(1)?,
                })
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(Some(ClusterGroup {
            name: name.to_string(),
            clusters,
        }))
    }

    async fn get_vo_group(&self, name: &str) -> Result<Option<VoGroup>, StoreError> {
        let conn = self.conn.lock().await;
        if !group_exists(&conn, "vo_group", name)? {
            return Ok(None);
        }
        let mut vo_stmt = conn
            .prepare(
                "SELECT v.name, v.server
                 FROM vo_group_member m JOIN vo v ON v.name = m.vo_name
                 WHERE m.group_name = ?1 ORDER BY v.name",
            )
            .map_err(sql_err)?;
        let heads = vo_stmt
            .query_map(rusqlite::params![name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;

        let mut user_stmt = conn
            .prepare(
                "SELECT u.dn, u.display_name, u.secret
                 FROM vo_user vu JOIN grid_user u ON u.dn = vu.dn
                 WHERE vu.vo_name = ?1 ORDER BY u.dn",
            )
            .map_err(sql_err)?;
        let mut vos = Vec::with_capacity(heads.len());
        for (vo_name, server) in heads {
            let users = user_stmt
                .query_map(rusqlite::params![vo_name], row_to_user)
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            vos.push(Vo {
                name: vo_name,
                server,
                users,
            });
        }
        Ok(Some(VoGroup {
            name: name.to_string(),
            vos,
        }))
    }

    async fn get_test_suite(&self, name: &str) -> Result<Option<TestSuite>, StoreError> {
        let conn = self.conn.lock().await;
        if !group_exists(&conn, "test_suite", name)? {
            return Ok(None);
        }
        let mut stmt = conn
            .prepare(
                "SELECT t.name, t.description
                 FROM test_suite_member m JOIN test t ON t.name = m.test_name
                 WHERE m.suite_name = ?1 ORDER BY t.name",
            )
            .map_err(sql_err)?;
        let tests = stmt
            .query_map(rusqlite::params![name], |row| {
                Ok(Test {
                    name: row.get(0)?,
                    description: row.get(1)?,
                })
            })
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(Some(TestSuite {
            name: name.to_string(),
            tests,
        }))
    }

    async fn get_user(&self, dn: &str) -> Result<Option<User>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT dn, display_name, secret FROM grid_user WHERE dn = ?1",
            rusqlite::params![dn],
            row_to_user,
        )
        .optional()
        .map_err(sql_err)
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sft_job
                (id, sft_name, cluster, vo, test_name, dn, remote_id, status,
                 error_type, error_msg, output_dir, artifact, submitted_at, last_modified)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            rusqlite::params![
                job.id.to_string(),
                job.sft_name,
                job.cluster,
                job.vo,
                job.test_name,
                job.dn,
                job.remote_id,
                job.status.as_str(),
                job.error_type.map(|e| e.as_str()),
                job.error_msg,
                job.output_dir,
                job.artifact,
                fmt_ts(&job.submitted_at),
                fmt_ts(&job.last_modified),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "UPDATE sft_job
                 SET remote_id = ?1, status = ?2, error_type = ?3, error_msg = ?4,
                     output_dir = ?5, artifact = ?6, last_modified = ?7
                 WHERE id = ?8",
                rusqlite::params![
                    job.remote_id,
                    job.status.as_str(),
                    job.error_type.map(|e| e.as_str()),
                    job.error_msg,
                    job.output_dir,
                    job.artifact,
                    fmt_ts(&job.last_modified),
                    job.id.to_string(),
                ],
            )
            .map_err(sql_err)?;
        if rows == 0 {
            return Err(StoreError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM sft_job WHERE id = ?1"),
                rusqlite::params![id.to_string()],
                row_to_job,
            )
            .optional()
            .map_err(sql_err)?;
        result.transpose()
    }

    async fn list_jobs(&self, sft: Option<&str>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let limit = limit as i64;
        match sft {
            Some(name) => Self::query_jobs(
                &conn,
                &format!(
                    "SELECT {JOB_COLUMNS} FROM sft_job WHERE sft_name = ?1
                     ORDER BY submitted_at DESC LIMIT ?2"
                ),
                rusqlite::params![name, limit],
            ),
            None => Self::query_jobs(
                &conn,
                &format!("SELECT {JOB_COLUMNS} FROM sft_job ORDER BY submitted_at DESC LIMIT ?1"),
                rusqlite::params![limit],
            ),
        }
    }

    async fn list_pollable_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sft_job
             WHERE remote_id IS NOT NULL AND status NOT IN ({})
             ORDER BY submitted_at",
            status_list(&JobStatus::TERMINAL)
        );
        Self::query_jobs(&conn, &sql, &[])
    }

    async fn list_fetchable_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sft_job
             WHERE remote_id IS NOT NULL AND status IN ({})
             ORDER BY submitted_at",
            status_list(&JobStatus::FETCHABLE)
        );
        Self::query_jobs(&conn, &sql, &[])
    }

    async fn purge_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.lock().await;
        let cutoff = fmt_ts(&cutoff);
        let tx = conn.transaction().map_err(sql_err)?;
        let purged = Self::query_jobs(
            &tx,
            &format!("SELECT {JOB_COLUMNS} FROM sft_job WHERE last_modified <= ?1"),
            rusqlite::params![cutoff],
        )?;
        tx.execute(
            "DELETE FROM sft_job WHERE last_modified <= ?1",
            rusqlite::params![cutoff],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)?;
        Ok(purged)
    }
}

#[async_trait]
impl DowntimeSource for SqliteStore {
    async fn downtime_windows(&self) -> Result<Vec<DowntimeWindow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT host, start_time, end_time FROM scheduled_downtime ORDER BY id")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(sql_err)?;

        let mut windows = Vec::new();
        for row in rows {
            let (host, start, end) = row.map_err(sql_err)?;
            windows.push(DowntimeWindow {
                host,
                start: parse_local(&start)?,
                end: parse_local(&end)?,
            });
        }
        Ok(windows)
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

fn group_exists(
    conn: &rusqlite::Connection,
    table: &str,
    name: &str,
) -> Result<bool, StoreError> {
    conn.query_row(
        &format!("SELECT 1 FROM {table} WHERE name = ?1"),
        rusqlite::params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(sql_err)
}

fn parse_local(s: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(s, DOWNTIME_FORMAT)
        .map_err(|e| StoreError::Serialization(format!("downtime '{s}': {e}")))
}

fn row_to_sft(row: &rusqlite::Row<'_>) -> rusqlite::Result<SftDefinition> {
    Ok(SftDefinition {
        name: row.get(0)?,
        cluster_group: row.get(1)?,
        vo_group: row.get(2)?,
        test_suite: row.get(3)?,
        minute: row.get(4)?,
        hour: row.get(5)?,
        day: row.get(6)?,
        month: row.get(7)?,
        day_of_week: row.get(8)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        dn: row.get(0)?,
        display_name: row.get(1)?,
        secret: row.get(2)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Job, StoreError>> {
    let id_str: String = row.get(0)?;
    let sft_name: String = row.get(1)?;
    let cluster: String = row.get(2)?;
    let vo: String = row.get(3)?;
    let test_name: String = row.get(4)?;
    let dn: String = row.get(5)?;
    let remote_id: Option<String> = row.get(6)?;
    let status_str: String = row.get(7)?;
    let error_type_str: Option<String> = row.get(8)?;
    let error_msg: Option<String> = row.get(9)?;
    let output_dir: Option<String> = row.get(10)?;
    let artifact: Option<String> = row.get(11)?;
    let submitted_str: String = row.get(12)?;
    let modified_str: String = row.get(13)?;

    Ok((|| -> Result<Job, StoreError> {
        let id: JobId = id_str
            .parse()
            .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?;
        let status: JobStatus = status_str.parse().map_err(StoreError::Serialization)?;
        let error_type = error_type_str
            .map(|s| s.parse().map_err(StoreError::Serialization))
            .transpose()?;
        Ok(Job {
            id,
            sft_name,
            cluster,
            vo,
            test_name,
            dn,
            remote_id,
            status,
            error_type,
            error_msg,
            output_dir,
            artifact,
            submitted_at: parse_ts(&submitted_str)?,
            last_modified: parse_ts(&modified_str)?,
        })
    })())
}
