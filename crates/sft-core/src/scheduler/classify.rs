//! Logical outcome of a fetched job.
//!
//! Two output conventions are recognised, checked in this order:
//!
//! 1. the error log (`stderr.txt`): present and empty passes, present and
//!    non-empty fails;
//! 2. the log directory (`gmlog`): a file named after the failure marker
//!    anywhere below it fails, otherwise the job passes.
//!
//! Output following neither convention is a [`ClassificationError`], never a pass.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ClassificationConfig;
use crate::types::ErrorType;

/// Which output convention decided the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    ErrorLog,
    LogDir,
}

impl Convention {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Convention::ErrorLog => ErrorType::ErrorLog,
            Convention::LogDir => ErrorType::LogDir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed(Convention),
    Failed { convention: Convention, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationErrorKind {
    /// Neither the error log nor the log directory is present.
    UnknownConvention,
    /// An expected artifact exists but could not be read.
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot classify {dir}: {message}")]
pub struct ClassificationError {
    pub kind: ClassificationErrorKind,
    pub dir: PathBuf,
    pub message: String,
}

impl ClassificationError {
    pub fn kind(&self) -> ClassificationErrorKind {
        self.kind
    }
}

#[derive(Debug, Clone)]
pub struct OutputClassifier {
    config: ClassificationConfig,
}

impl OutputClassifier {
    pub fn new(config: ClassificationConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, dir: &Path) -> Result<Verdict, ClassificationError> {
        let error_log = dir.join(&self.config.error_log);
        if error_log.is_file() {
            let size = std::fs::metadata(&error_log)
                .map_err(|e| self.unreadable(dir, &error_log, e))?
                .len();
            return Ok(if size == 0 {
                Verdict::Passed(Convention::ErrorLog)
            } else {
                Verdict::Failed {
                    convention: Convention::ErrorLog,
                    reason: format!("{} is not empty ({size} bytes)", self.config.error_log),
                }
            });
        }

        let log_dir = dir.join(&self.config.log_dir);
        if log_dir.is_dir() {
            for entry in WalkDir::new(&log_dir) {
                let entry = entry.map_err(|e| ClassificationError {
                    kind: ClassificationErrorKind::Unreadable,
                    dir: dir.to_path_buf(),
                    message: e.to_string(),
                })?;
                if entry.file_type().is_file()
                    && entry.file_name().to_string_lossy() == self.config.failure_marker
                {
                    return Ok(Verdict::Failed {
                        convention: Convention::LogDir,
                        reason: format!(
                            "failure marker found at {}",
                            entry.path().strip_prefix(dir).unwrap_or(entry.path()).display()
                        ),
                    });
                }
            }
            return Ok(Verdict::Passed(Convention::LogDir));
        }

        Err(ClassificationError {
            kind: ClassificationErrorKind::UnknownConvention,
            dir: dir.to_path_buf(),
            message: format!(
                "neither {} nor {} present",
                self.config.error_log, self.config.log_dir
            ),
        })
    }

    fn unreadable(&self, dir: &Path, path: &Path, e: std::io::Error) -> ClassificationError {
        ClassificationError {
            kind: ClassificationErrorKind::Unreadable,
            dir: dir.to_path_buf(),
            message: format!("{}: {e}", path.display()),
        }
    }
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::new(ClassificationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn empty_error_log_passes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "stderr.txt", "");
        assert_eq!(
            OutputClassifier::default().classify(dir.path()).unwrap(),
            Verdict::Passed(Convention::ErrorLog)
        );
    }

    #[test]
    fn non_empty_error_log_fails_even_with_clean_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "stderr.txt", "segfault\n");
        write(dir.path(), "gmlog/errors", "");
        assert!(matches!(
            OutputClassifier::default().classify(dir.path()).unwrap(),
            Verdict::Failed { convention: Convention::ErrorLog, .. }
        ));
    }

    #[test]
    fn log_dir_marker_decides_without_error_log() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "gmlog/errors", "all good");
        assert_eq!(
            OutputClassifier::default().classify(dir.path()).unwrap(),
            Verdict::Passed(Convention::LogDir)
        );

        write(dir.path(), "gmlog/failed", "LRMS error");
        assert!(matches!(
            OutputClassifier::default().classify(dir.path()).unwrap(),
            Verdict::Failed { convention: Convention::LogDir, .. }
        ));
    }

    #[test]
    fn missing_artifacts_are_unknown_not_success() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "stdout.txt", "hello");
        let err = OutputClassifier::default().classify(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ClassificationErrorKind::UnknownConvention);
    }

    #[test]
    fn names_come_from_configuration() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "logs/FAILURE", "x");
        let classifier = OutputClassifier::new(ClassificationConfig {
            error_log: "err.log".into(),
            log_dir: "logs".into(),
            failure_marker: "FAILURE".into(),
        });
        assert!(matches!(
            classifier.classify(dir.path()).unwrap(),
            Verdict::Failed { convention: Convention::LogDir, .. }
        ));
    }
}
