//! ARC client tools (`arcsub`, `arcstat`, `arcget`).

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::RemoteJobControl;
use crate::config::{Config, RemoteConfig};
use crate::credentials::Credential;
use crate::process::{self, ProcessError, ToolCommand, ToolOutput};
use crate::types::{Cluster, RemoteToolError, Test};

pub struct ArcClient {
    arcsub: PathBuf,
    arcstat: PathBuf,
    arcget: PathBuf,
    job_list: PathBuf,
    config: RemoteConfig,
}

impl ArcClient {
    pub fn new(
        arcsub: PathBuf,
        arcstat: PathBuf,
        arcget: PathBuf,
        job_list: PathBuf,
        config: RemoteConfig,
    ) -> Self {
        Self {
            arcsub,
            arcstat,
            arcget,
            job_list,
            config,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.arc_tool("arcsub"),
            config.arc_tool("arcstat"),
            config.arc_tool("arcget"),
            config.job_list_path(),
            config.remote.clone(),
        )
    }

    fn with_credential(cmd: ToolCommand, credential: &Credential) -> ToolCommand {
        cmd.env(
            "X509_USER_PROXY",
            credential.proxy_path.display().to_string(),
        )
    }

    async fn invoke(cmd: &ToolCommand) -> Result<ToolOutput, RemoteToolError> {
        tracing::debug!(command = %cmd.display(), "running ARC client tool");
        process::run(cmd).await.map_err(|e| match e {
            ProcessError::Timeout { .. } => RemoteToolError::timeout(e.to_string()),
            ProcessError::Spawn { .. } | ProcessError::Io { .. } => {
                RemoteToolError::invocation(e.to_string())
            }
        })
    }

    fn reports_unknown_job(&self, output: &ToolOutput) -> bool {
        contains_marker(&output.combined(), &self.config.unknown_job_markers)
    }
}

#[async_trait]
impl RemoteJobControl for ArcClient {
    async fn submit(
        &self,
        cluster: &Cluster,
        test: &Test,
        credential: &Credential,
    ) -> Result<String, RemoteToolError> {
        let description = test.description.replace('\n', " ");
        let cmd = ToolCommand::new(&self.arcsub, self.config.submit_timeout)
            .arg("-j")
            .arg(self.job_list.display().to_string())
            .arg("-c")
            .arg(&cluster.hostname)
            .arg("-e")
            .arg(description);
        let out = Self::invoke(&Self::with_credential(cmd, credential)).await?;

        if !out.success() {
            return Err(RemoteToolError::invocation(format!(
                "arcsub exited with {}: {}",
                out.exit_code,
                out.combined()
            )));
        }
        if contains_marker(&out.combined(), &self.config.submit_failure_markers) {
            return Err(RemoteToolError::logical(out.combined()));
        }
        parse_job_id(&out.stdout)
            .or_else(|| parse_job_id(&out.stderr))
            .ok_or_else(|| {
                RemoteToolError::parse(format!("no job id in arcsub output: {}", out.combined()))
            })
    }

    async fn status(
        &self,
        remote_id: &str,
        credential: &Credential,
    ) -> Result<String, RemoteToolError> {
        let cmd = ToolCommand::new(&self.arcstat, self.config.status_timeout)
            .arg("-j")
            .arg(self.job_list.display().to_string())
            .arg(remote_id);
        let out = Self::invoke(&Self::with_credential(cmd, credential)).await?;

        if self.reports_unknown_job(&out) {
            return Err(RemoteToolError::job_unknown(out.combined()));
        }
        if !out.success() {
            return Err(RemoteToolError::invocation(format!(
                "arcstat exited with {}: {}",
                out.exit_code,
                out.combined()
            )));
        }
        parse_state(&out.stdout).ok_or_else(|| {
            RemoteToolError::parse(format!("no state in arcstat output: {}", out.combined()))
        })
    }

    async fn fetch(
        &self,
        remote_id: &str,
        destination: &Path,
        credential: &Credential,
    ) -> Result<PathBuf, RemoteToolError> {
        tokio::fs::create_dir_all(destination).await.map_err(|e| {
            RemoteToolError::invocation(format!(
                "cannot create {}: {e}",
                destination.display()
            ))
        })?;
        let cmd = ToolCommand::new(&self.arcget, self.config.fetch_timeout)
            .arg("-j")
            .arg(self.job_list.display().to_string())
            .arg("-D")
            .arg(destination.display().to_string())
            .arg(remote_id);
        let out = Self::invoke(&Self::with_credential(cmd, credential)).await?;

        if self.reports_unknown_job(&out) {
            return Err(RemoteToolError::job_unknown(out.combined()));
        }
        if !out.success() {
            return Err(RemoteToolError::invocation(format!(
                "arcget exited with {}: {}",
                out.exit_code,
                out.combined()
            )));
        }
        Ok(parse_results_dir(&out.stdout)
            .unwrap_or_else(|| output_dir_for(destination, remote_id)))
    }
}

/// Case-insensitive search for any of `markers` in `text`.
pub fn contains_marker(text: &str, markers: &[String]) -> bool {
    let lower = text.to_lowercase();
    markers
        .iter()
        .filter(|m| !m.is_empty())
        .any(|m| lower.contains(&m.to_lowercase()))
}

/// Extract the job id following `jobid:` in submission output.
pub fn parse_job_id(output: &str) -> Option<String> {
    let lower = output.to_ascii_lowercase();
    let start = lower.find("jobid:")? + "jobid:".len();
    output[start..]
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Extract the job state from status output.
///
/// `State: Finished (FINISHED)` yields `FINISHED`; a state without a
/// parenthesised internal form is returned as written.
pub fn parse_state(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        let value = line
            .strip_prefix("State:")
            .or_else(|| line.strip_prefix("Status:"))?
            .trim();
        if value.is_empty() {
            return None;
        }
        let internal = value
            .rfind('(')
            .and_then(|open| value[open + 1..].split(')').next())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        Some(internal.unwrap_or(value).to_string())
    })
}

fn parse_results_dir(output: &str) -> Option<PathBuf> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Results stored at:")
            .map(|p| PathBuf::from(p.trim()))
            .filter(|p| !p.as_os_str().is_empty())
    })
}

/// Directory `arcget` creates for a job: the last path segment of its id.
pub fn output_dir_for(destination: &Path, remote_id: &str) -> PathBuf {
    let segment = remote_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(remote_id);
    destination.join(segment)
}
