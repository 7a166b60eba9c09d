//! MyProxy + VOMS proxy credential provider.
//!
//! For each user a long-lived credential is retrieved from the MyProxy
//! server, and from it one VOMS proxy per VO is derived. Both are cached
//! on disk under `proxy_dir` and only renewed when their remaining
//! lifetime drops below the configured minimum.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Credential, CredentialProvider};
use crate::config::{CredentialsConfig, ProxyType};
use crate::process::{self, ProcessError, ToolCommand};
use crate::types::{CredentialError, CredentialErrorKind, User};

/// Output fragments meaning the proxy was produced despite a non-zero exit.
const TOLERATED_OUTPUT: [&str; 2] = ["Your proxy is valid until", "Warning:"];

/// Output fragments meaning the credential service rejected the request.
const DENIAL_OUTPUT: [&str; 8] = [
    "invalid pass phrase",
    "bad passphrase",
    "bad password",
    "authentication failed",
    "not authorized",
    "not a member",
    "denied",
    "no credentials exist",
];

const TRANSIENT_OUTPUT: [&str; 4] = [
    "connection refused",
    "unable to connect",
    "timed out",
    "temporarily unavailable",
];

pub struct VomsProxyProvider {
    config: CredentialsConfig,
    proxy_dir: PathBuf,
}

impl VomsProxyProvider {
    pub fn new(config: CredentialsConfig, proxy_dir: PathBuf) -> Self {
        Self { config, proxy_dir }
    }

    fn file_stem(dn: &str) -> String {
        hex::encode(Sha256::digest(dn.as_bytes()))
    }

    pub fn myproxy_path(&self, dn: &str) -> PathBuf {
        self.proxy_dir.join(Self::file_stem(dn))
    }

    pub fn vomsproxy_path(&self, dn: &str, vo: &str) -> PathBuf {
        self.proxy_dir
            .join(format!("{}_{}", Self::file_stem(dn), vo))
    }

    /// Remaining lifetime of a proxy file, `None` if absent or unreadable.
    async fn remaining(&self, path: &Path) -> Option<Duration> {
        if !path.is_file() {
            return None;
        }
        let cmd = ToolCommand::new(&self.config.voms_proxy_info, self.config.timeout)
            .arg("-file")
            .arg(path.display().to_string())
            .arg("-timeleft");
        match process::run(&cmd).await {
            Ok(out) if out.success() => out
                .stdout
                .trim()
                .parse::<i64>()
                .ok()
                .map(|secs| Duration::from_secs(secs.max(0) as u64)),
            Ok(out) => {
                tracing::debug!(path = %path.display(), output = %out.combined(), "proxy lifetime query failed");
                None
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "proxy lifetime query failed");
                None
            }
        }
    }

    async fn ensure_myproxy(&self, user: &User) -> Result<PathBuf, CredentialError> {
        let path = self.myproxy_path(&user.dn);
        let min = hours(self.config.min_myproxy_valid_hours);
        if self.remaining(&path).await.is_some_and(|left| left >= min) {
            return Ok(path);
        }
        if self.config.myproxy_server.is_empty() {
            return Err(CredentialError::config("no MyProxy server configured"));
        }
        if user.secret.is_empty() {
            return Err(CredentialError::config(format!(
                "no MyProxy passphrase stored for {}",
                user.dn
            )));
        }

        tracing::info!(dn = %user.dn, "retrieving credential from MyProxy");
        let cmd = ToolCommand::new(&self.config.myproxy_logon, self.config.timeout)
            .arg("-s")
            .arg(&self.config.myproxy_server)
            .arg("-p")
            .arg(self.config.myproxy_port.to_string())
            .arg("-l")
            .arg(&user.dn)
            .arg("-t")
            .arg(self.config.myproxy_lifetime_hours.to_string())
            .arg("-o")
            .arg(path.display().to_string())
            .arg("-S")
            .stdin(user.secret.clone());
        self.run_credential_tool(&cmd, "MyProxy logon").await?;
        restrict_permissions(&path);
        Ok(path)
    }

    async fn ensure_vomsproxy(
        &self,
        user: &User,
        vo: &str,
        myproxy: &Path,
    ) -> Result<PathBuf, CredentialError> {
        let path = self.vomsproxy_path(&user.dn, vo);
        let min = hours(self.config.min_vomsproxy_valid_hours);
        if self.remaining(&path).await.is_some_and(|left| left >= min) {
            return Ok(path);
        }

        tracing::info!(dn = %user.dn, vo = %vo, "creating VOMS proxy");
        let myproxy = myproxy.display().to_string();
        let proxy_flag = match self.config.proxy_type {
            ProxyType::Old => "-old",
            ProxyType::Rfc => "-rfc",
        };
        let cmd = ToolCommand::new(&self.config.voms_proxy_init, self.config.timeout)
            .arg("-voms")
            .arg(vo)
            .arg("-cert")
            .arg(&myproxy)
            .arg("-key")
            .arg(&myproxy)
            .arg("-out")
            .arg(path.display().to_string())
            .arg("-hours")
            .arg(self.config.vomsproxy_hours.to_string())
            .arg(proxy_flag);
        self.run_credential_tool(&cmd, "VOMS proxy init").await?;
        restrict_permissions(&path);
        Ok(path)
    }

    async fn run_credential_tool(
        &self,
        cmd: &ToolCommand,
        what: &str,
    ) -> Result<(), CredentialError> {
        let out = process::run(cmd).await.map_err(|e| match e {
            ProcessError::Spawn { .. } => CredentialError::config(format!("{what}: {e}")),
            ProcessError::Timeout { .. } | ProcessError::Io { .. } => {
                CredentialError::transient(format!("{what}: {e}"))
            }
        })?;
        if out.success() {
            return Ok(());
        }
        let text = out.combined();
        if TOLERATED_OUTPUT.iter().any(|m| text.contains(m)) {
            tracing::debug!(tool = %cmd.display(), "non-zero exit tolerated: {}", text);
            return Ok(());
        }
        Err(CredentialError {
            kind: classify_failure(&text),
            message: format!("{what} failed: {text}"),
        })
    }
}

fn hours(h: u32) -> Duration {
    Duration::from_secs(u64::from(h) * 3600)
}

/// Map tool output to a failure kind. Unrecognised output is retried next time.
fn classify_failure(output: &str) -> CredentialErrorKind {
    let lower = output.to_lowercase();
    if TRANSIENT_OUTPUT.iter().any(|m| lower.contains(m)) {
        CredentialErrorKind::Transient
    } else if DENIAL_OUTPUT.iter().any(|m| lower.contains(m)) {
        CredentialErrorKind::Denied
    } else if lower.contains("no such file") || lower.contains("unknown option") {
        CredentialErrorKind::Config
    } else {
        CredentialErrorKind::Transient
    }
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
            tracing::warn!(path = %path.display(), error = %e, "could not restrict proxy permissions");
        }
    }
}

#[async_trait]
impl CredentialProvider for VomsProxyProvider {
    async fn acquire(&self, user: &User, vo: &str) -> Result<Credential, CredentialError> {
        if let Err(e) = tokio::fs::create_dir_all(&self.proxy_dir).await {
            return Err(CredentialError::config(format!(
                "cannot create proxy directory {}: {e}",
                self.proxy_dir.display()
            )));
        }
        let myproxy = self.ensure_myproxy(user).await?;
        let proxy_path = self.ensure_vomsproxy(user, vo, &myproxy).await?;
        Ok(Credential {
            identity: user.dn.clone(),
            vo: vo.to_string(),
            proxy_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(dir: &Path) -> VomsProxyProvider {
        VomsProxyProvider::new(CredentialsConfig::default(), dir.to_path_buf())
    }

    fn user() -> User {
        User {
            dn: "/DC=ch/O=example/CN=Tester".into(),
            display_name: None,
            secret: "pw".into(),
        }
    }

    #[test]
    fn proxy_paths_are_hashed_per_dn_and_vo() {
        let dir = tempfile::tempdir().unwrap();
        let p = provider(dir.path());
        let dn = "/DC=ch/O=example/CN=Tester";
        let base = p.myproxy_path(dn);
        let voms = p.vomsproxy_path(dn, "smscg");
        let stem = base.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(stem.len(), 64);
        assert!(!stem.contains('/'));
        assert_eq!(
            voms.file_name().unwrap().to_str().unwrap(),
            format!("{stem}_smscg")
        );
        assert_ne!(p.myproxy_path("/CN=other"), base);
    }

    #[test]
    fn failure_output_classification() {
        assert_eq!(
            classify_failure("ERROR: Connection refused by server"),
            CredentialErrorKind::Transient
        );
        assert_eq!(
            classify_failure("invalid pass phrase"),
            CredentialErrorKind::Denied
        );
        assert_eq!(
            classify_failure("VOMS Server for smscg: user is not a member"),
            CredentialErrorKind::Denied
        );
        assert_eq!(
            classify_failure("something odd happened"),
            CredentialErrorKind::Transient
        );
    }

    #[tokio::test]
    async fn missing_server_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = provider(dir.path()).acquire(&user(), "smscg").await.unwrap_err();
        assert_eq!(err.kind, CredentialErrorKind::Config);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tolerated_output_counts_as_success() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("fake-voms-proxy-init");
        std::fs::write(
            &tool,
            "#!/bin/sh\necho 'Your proxy is valid until Tue Mar 12'\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let p = provider(dir.path());
        let cmd = ToolCommand::new(&tool, Duration::from_secs(5));
        assert!(p.run_credential_tool(&cmd, "VOMS proxy init").await.is_ok());
    }
}
