//! Browsable HTML index over fetched job output.
//!
//! Every output file is renamed to carry an `.html` suffix so the web server
//! shows it inline, and an `index.html` listing all files grouped by
//! directory is written at the top of the output directory. The artifact
//! reference returned is the index path relative to the URL root.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const INDEX_FILE: &str = "index.html";

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("{dir} is not below the URL root {root}")]
    OutsideRoot { dir: PathBuf, root: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot walk {0}")]
    Walk(String),

    #[error("indexer task failed: {0}")]
    Task(String),
}

/// Produces a browsable reference for a fetched output directory.
#[async_trait]
pub trait OutputIndexer: Send + Sync {
    async fn index(&self, dir: &Path) -> Result<String, IndexerError>;
}

pub struct HtmlIndexer {
    url_root: PathBuf,
}

struct Entry {
    name: String,
    size: u64,
}

impl HtmlIndexer {
    pub fn new(url_root: PathBuf) -> Self {
        Self { url_root }
    }

    /// Synchronous indexing; [`OutputIndexer::index`] runs this on the blocking pool.
    pub fn index_dir(&self, dir: &Path) -> Result<String, IndexerError> {
        let logical = dir
            .strip_prefix(&self.url_root)
            .map_err(|_| IndexerError::OutsideRoot {
                dir: dir.to_path_buf(),
                root: self.url_root.clone(),
            })?
            .to_path_buf();

        let mut groups: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
        for item in WalkDir::new(dir).sort_by_file_name() {
            let item = item.map_err(|e| IndexerError::Walk(e.to_string()))?;
            if !item.file_type().is_file() {
                continue;
            }
            let path = item.path();
            if path.parent() == Some(dir) && item.file_name() == INDEX_FILE {
                continue;
            }
            let target = browsable_name(path);
            if target != path {
                std::fs::rename(path, &target).map_err(|source| IndexerError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            let size = std::fs::metadata(&target)
                .map_err(|source| IndexerError::Io {
                    path: target.clone(),
                    source,
                })?
                .len();
            let rel = target.strip_prefix(dir).unwrap_or(&target);
            let group = rel
                .parent()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            groups.entry(group).or_default().push(Entry {
                name: rel.to_string_lossy().replace('\\', "/"),
                size,
            });
        }

        let index_path = dir.join(INDEX_FILE);
        std::fs::write(&index_path, render(&logical, &groups)).map_err(|source| {
            IndexerError::Io {
                path: index_path.clone(),
                source,
            }
        })?;

        Ok(logical
            .join(INDEX_FILE)
            .to_string_lossy()
            .replace('\\', "/"))
    }
}

#[async_trait]
impl OutputIndexer for HtmlIndexer {
    async fn index(&self, dir: &Path) -> Result<String, IndexerError> {
        let indexer = HtmlIndexer::new(self.url_root.clone());
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || indexer.index_dir(&dir))
            .await
            .map_err(|e| IndexerError::Task(e.to_string()))?
    }
}

fn browsable_name(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("html") => path.to_path_buf(),
        _ => {
            let mut name = path.file_name().unwrap_or_default().to_os_string();
            name.push(".html");
            path.with_file_name(name)
        }
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render(logical: &Path, groups: &BTreeMap<String, Vec<Entry>>) -> String {
    let title = escape(&logical.to_string_lossy());
    let mut html = String::new();
    let _ = writeln!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head><body>"
    );
    let _ = writeln!(html, "<h1>{title}</h1>");
    for (group, entries) in groups {
        let heading = if group.is_empty() { "." } else { group.as_str() };
        let _ = writeln!(html, "<h2>{}</h2>\n<table>", escape(heading));
        for entry in entries {
            let name = escape(&entry.name);
            let _ = writeln!(
                html,
                "<tr><td><a href=\"{name}\">{name}</a></td><td>{} bytes</td></tr>",
                entry.size
            );
        }
        let _ = writeln!(html, "</table>");
    }
    html.push_str("</body></html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_dir(root: &Path) -> PathBuf {
        let dir = root.join("jobs").join("abc123");
        std::fs::create_dir_all(dir.join("gmlog")).unwrap();
        std::fs::write(dir.join("stdout.txt"), "hello\n").unwrap();
        std::fs::write(dir.join("stderr.txt"), "").unwrap();
        std::fs::write(dir.join("gmlog").join("errors"), "ok").unwrap();
        dir
    }

    #[tokio::test]
    async fn renames_files_and_writes_index() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(root.path());
        let indexer = HtmlIndexer::new(root.path().to_path_buf());

        let artifact = indexer.index(&dir).await.unwrap();
        assert_eq!(artifact, "jobs/abc123/index.html");

        assert!(dir.join("stdout.txt.html").is_file());
        assert!(!dir.join("stdout.txt").exists());
        assert!(dir.join("gmlog").join("errors.html").is_file());

        let index = std::fs::read_to_string(dir.join("index.html")).unwrap();
        assert!(index.contains("stdout.txt.html"));
        assert!(index.contains("<h2>gmlog</h2>"));
        assert!(index.contains("6 bytes"));
    }

    #[test]
    fn directory_outside_root_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let indexer = HtmlIndexer::new(root.path().to_path_buf());
        assert!(matches!(
            indexer.index_dir(other.path()),
            Err(IndexerError::OutsideRoot { .. })
        ));
    }

    #[test]
    fn html_files_keep_their_name() {
        assert_eq!(
            browsable_name(Path::new("/x/report.HTML")),
            PathBuf::from("/x/report.HTML")
        );
        assert_eq!(
            browsable_name(Path::new("/x/stderr.txt")),
            PathBuf::from("/x/stderr.txt.html")
        );
    }
}
