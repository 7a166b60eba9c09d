//! `sftd jobs [--sft NAME] [--limit N]`.

use clap::ArgMatches;
use sft_core::{Config, Job, JobStore, SqliteStore};

pub async fn run(config: &Config, matches: &ArgMatches) -> anyhow::Result<()> {
    let sft = matches.get_one::<String>("sft").map(String::as_str);
    let limit = matches.get_one::<usize>("limit").copied().unwrap_or(50);

    let store = SqliteStore::open(&config.database_path())?;
    let jobs = store.list_jobs(sft, limit).await?;
    if jobs.is_empty() {
        println!("No jobs recorded.");
        return Ok(());
    }

    println!(
        "{:<20} {:<16} {:<28} {:<16} {:<12} {:<20} DETAIL",
        "MODIFIED", "SFT", "CLUSTER", "TEST", "STATUS", "ERROR"
    );
    println!("{}", "-".repeat(130));
    for job in &jobs {
        println!(
            "{:<20} {:<16} {:<28} {:<16} {:<12} {:<20} {}",
            job.last_modified.format("%Y-%m-%d %H:%M:%S").to_string(),
            truncate(&job.sft_name, 14),
            truncate(&job.cluster, 26),
            truncate(&job.test_name, 14),
            job.status.to_string(),
            job.error_type.map(|e| e.to_string()).unwrap_or_default(),
            detail(job),
        );
    }
    Ok(())
}

fn detail(job: &Job) -> String {
    job.artifact
        .clone()
        .or_else(|| job.error_msg.as_ref().map(|m| truncate(m, 60)))
        .or_else(|| job.remote_id.clone())
        .unwrap_or_default()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
