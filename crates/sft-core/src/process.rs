//! External tool runner.
//!
//! Every grid client tool (submission, status, retrieval, credential
//! handling, NSCA forwarding) is executed through [`run`]: stdout and stderr
//! are captured, an optional secret is written to stdin, and the whole
//! process group is killed when the wall-clock limit is exceeded.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::Duration;

/// A fully described tool invocation.
#[derive(Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a variable in the child's environment only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Feed `input` followed by a newline to the child's stdin.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Program and arguments, for log lines.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, or -1 when the tool was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for marker scanning and messages.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.trim().to_string(),
            (true, false) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `cmd` to completion or until its timeout elapses.
pub async fn run(cmd: &ToolCommand) -> Result<ToolOutput, ProcessError> {
    let program = cmd.program.display().to_string();
    let mut command = Command::new(&cmd.program);
    command.args(&cmd.args);
    command.envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    command.stdin(if cmd.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);

    // Own process group so that a timeout also reaps grandchildren.
    #[cfg(unix)]
    {
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
    }

    let start = std::time::Instant::now();
    let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
        program: program.clone(),
        source,
    })?;

    if let (Some(mut stdin), Some(input)) = (child.stdin.take(), cmd.stdin.clone()) {
        tokio::spawn(async move {
            // The tool may exit without reading stdin; a broken pipe is expected then.
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.write_all(b"\n").await;
        });
    }

    let mut child_stdout = child.stdout.take();
    let mut child_stderr = child.stderr.take();

    let outcome = tokio::time::timeout(cmd.timeout, async {
        let stdout_future = async {
            let mut buf = Vec::new();
            if let Some(out) = child_stdout.as_mut() {
                out.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let stderr_future = async {
            let mut buf = Vec::new();
            if let Some(err) = child_stderr.as_mut() {
                err.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let (stdout, stderr) = tokio::join!(stdout_future, stderr_future);
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, stdout?, stderr?))
    })
    .await;

    let elapsed = start.elapsed();
    match outcome {
        Ok(Ok((status, stdout, stderr))) => Ok(ToolOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            execution_time_ms: elapsed.as_millis() as u64,
        }),
        Ok(Err(source)) => Err(ProcessError::Io { program, source }),
        Err(_) => {
            tracing::warn!(
                program = %program,
                timeout = ?cmd.timeout,
                "tool exceeded its time limit; killing process group"
            );
            kill_process(&mut child).await;
            Err(ProcessError::Timeout {
                program,
                timeout: cmd.timeout,
            })
        }
    }
}

/// Kill a child process and its entire process group (Unix).
async fn kill_process(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(id) = child.id() {
            unsafe {
                libc::killpg(id as i32, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill().await;
}
