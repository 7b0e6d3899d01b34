// # Dead Letter Log
//
// JSON-lines file of feed pages the sources gave up on, kept for manual
// replay. One `SkippedPage` per line.

use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::Error;
use crate::traits::feed_source::SkippedPage;

/// File name of the log inside the state directory
pub const DEAD_LETTER_FILE_NAME: &str = "dead_letters.jsonl";

/// Append-only log of skipped pages
#[derive(Debug, Clone)]
pub struct DeadLetterLog {
    path: PathBuf,
}

impl DeadLetterLog {
    /// Log at `<state_dir>/dead_letters.jsonl`
    pub fn in_dir(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(DEAD_LETTER_FILE_NAME),
        }
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append skipped pages
    pub async fn append(&self, pages: &[SkippedPage]) -> Result<(), Error> {
        if pages.is_empty() {
            return Ok(());
        }

        let mut lines = String::new();
        for page in pages {
            lines.push_str(&serde_json::to_string(page)?);
            lines.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every logged page, oldest first; unreadable lines are skipped
    pub async fn read_all(&self) -> Result<Vec<SkippedPage>, Error> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(page) => Some(page),
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable dead letter line");
                    None
                }
            })
            .collect())
    }
}
