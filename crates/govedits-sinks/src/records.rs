//! CSV record sink
//!
//! Two append-only files: every dispatched match goes to the main file, and
//! matches whose summary looks like personal data also go to the sensitive
//! file. Rows are serialized in memory and written with a single append, so
//! a crash leaves at most a truncated last line. The next append terminates
//! such a line first instead of continuing it.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use govedits_core::traits::{MatchRecord, RecordSink};
use govedits_core::{Error, EventId, Result};

/// Default main file name
pub const MAIN_FILE_NAME: &str = "government_changes.csv";

/// Default sensitive file name
pub const SENSITIVE_FILE_NAME: &str = "sensitive_content_changes.csv";

/// Timestamp format of both files (UTC)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const MAIN_HEADER: [&str; 13] = [
    "Title",
    "IP Address",
    "Government Organization",
    "Timestamp",
    "Edit ID",
    "Old Size",
    "New Size",
    "Revision ID",
    "Parent ID",
    "Diff URL",
    "Comment",
    "Screenshot Path",
    "Contains Sensitive Info",
];

const SENSITIVE_HEADER: [&str; 9] = [
    "Title",
    "IP Address",
    "Government Organization",
    "Timestamp",
    "Edit ID",
    "Diff URL",
    "Comment",
    "Sensitive Content Types",
    "Matched Content",
];

const TITLE_COLUMN: usize = 0;
const TIMESTAMP_COLUMN: usize = 3;
const REVISION_COLUMN: usize = 7;

/// Appends match records to a pair of CSV files
#[derive(Debug)]
pub struct CsvRecordSink {
    main_path: PathBuf,
    sensitive_path: PathBuf,
    // serializes appends so rows never interleave
    write_lock: Mutex<()>,
}

impl CsvRecordSink {
    /// Sink writing to the given files
    pub fn new(main_path: impl Into<PathBuf>, sensitive_path: impl Into<PathBuf>) -> Self {
        Self {
            main_path: main_path.into(),
            sensitive_path: sensitive_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Sink writing the default file names inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join(MAIN_FILE_NAME), dir.join(SENSITIVE_FILE_NAME))
    }

    /// Path of the main file
    pub fn main_path(&self) -> &Path {
        &self.main_path
    }

    /// Path of the sensitive file
    pub fn sensitive_path(&self) -> &Path {
        &self.sensitive_path
    }
}

#[async_trait]
impl RecordSink for CsvRecordSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn append(&self, record: &MatchRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        // The main row is the one recent_ids reads back, so it goes last: a
        // failure before it leaves the edit eligible for redispatch.
        if record.sensitivity.is_sensitive() {
            append_row(&self.sensitive_path, &SENSITIVE_HEADER, &sensitive_row(record)).await?;
            let matched: Vec<&str> = record
                .sensitivity
                .findings
                .iter()
                .map(|f| f.text.as_str())
                .collect();
            warn!(
                title = %record.title,
                address = %record.address,
                organization = %record.organization,
                matches = %matched.join(", "),
                "Sensitive content detected in edit summary"
            );
        }
        append_row(&self.main_path, &MAIN_HEADER, &main_row(record)).await?;

        debug!(id = %record.id, path = %self.main_path.display(), "Record appended");
        Ok(())
    }

    async fn recent_ids(&self, limit: usize) -> Result<Vec<EventId>> {
        let content = match fs::read(&self.main_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_slice());

        let mut ids = VecDeque::with_capacity(limit.min(4096));
        for row in reader.records() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable record row");
                    continue;
                }
            };
            let Some(id) = row_id(&row) else {
                continue;
            };
            if ids.len() == limit {
                ids.pop_front();
            }
            ids.push_back(id);
        }

        Ok(ids.into())
    }
}

/// Dedup id of a stored row
fn row_id(row: &csv::StringRecord) -> Option<EventId> {
    if let Some(rev) = row
        .get(REVISION_COLUMN)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|rev| *rev > 0)
    {
        return Some(EventId::revision(rev));
    }

    let title = row.get(TITLE_COLUMN)?;
    let naive = NaiveDateTime::parse_from_str(row.get(TIMESTAMP_COLUMN)?, TIMESTAMP_FORMAT).ok()?;
    let at = Utc.from_utc_datetime(&naive);
    Some(EventId(format!("edit:{}@{}", title, at.timestamp())))
}

fn optional(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn main_row(record: &MatchRecord) -> Vec<String> {
    vec![
        record.title.clone(),
        record.address.clone(),
        record.organization.clone(),
        record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        optional(record.change_id),
        optional(record.old_len),
        optional(record.new_len),
        optional(record.revision_id),
        optional(record.parent_revision_id),
        record.diff_url.clone(),
        record.comment.clone(),
        record
            .screenshot
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        if record.sensitivity.is_sensitive() { "Yes" } else { "No" }.to_string(),
    ]
}

fn sensitive_row(record: &MatchRecord) -> Vec<String> {
    let findings = &record.sensitivity.findings;
    let kinds: Vec<&str> = findings.iter().map(|f| f.kind.label()).collect();
    let texts: Vec<&str> = findings.iter().map(|f| f.text.as_str()).collect();
    vec![
        record.title.clone(),
        record.address.clone(),
        record.organization.clone(),
        record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
        optional(record.change_id),
        record.diff_url.clone(),
        record.comment.clone(),
        kinds.join(", "),
        texts.join("; "),
    ]
}

/// Append one row, writing `header` first when the file is new or empty
async fn append_row(path: &Path, header: &[&str], row: &[String]) -> Result<()> {
    let len = match fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    let needs_header = len == 0;
    let unterminated = len > 0 && !ends_with_newline(path, len).await?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut buffer = Vec::new();
    if unterminated {
        warn!(path = %path.display(), "Last row was cut short, terminating it");
        buffer.push(b'\n');
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(buffer);
    if needs_header {
        writer.write_record(header)?;
    }
    writer.write_record(row)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| Error::Other(format!("CSV buffer error: {}", e)))?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&bytes).await?;
    file.sync_data().await?;
    Ok(())
}

async fn ends_with_newline(path: &Path, len: u64) -> Result<bool> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use govedits_core::traits::{Finding, FindingKind, SensitivityReport};
    use std::path::PathBuf;

    fn record(rev: Option<u64>, sensitive: bool) -> MatchRecord {
        let findings = if sensitive {
            vec![
                Finding {
                    kind: FindingKind::PhoneNumber,
                    text: "555-123-4567".to_string(),
                },
                Finding {
                    kind: FindingKind::Address,
                    text: "12 Main Street".to_string(),
                },
            ]
        } else {
            Vec::new()
        };
        MatchRecord {
            id: match rev {
                Some(rev) => EventId::revision(rev),
                None => EventId("edit:Example, Page@1714564800".to_string()),
            },
            title: "Example, Page".to_string(),
            address: "203.0.113.5".to_string(),
            organization: "Example Gov".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            change_id: Some(77),
            old_len: Some(100),
            new_len: Some(120),
            revision_id: rev,
            parent_revision_id: rev.map(|r| r - 1),
            diff_url: "https://en.wikipedia.org/w/index.php?diff=1001&oldid=1000".to_string(),
            comment: "call 555-123-4567".to_string(),
            screenshot: Some(PathBuf::from("shots/a.png")),
            sensitivity: SensitivityReport { findings },
        }
    }

    #[tokio::test]
    async fn writes_header_once_and_quotes_fields() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvRecordSink::in_dir(dir.path());

        sink.append(&record(Some(1001), false)).await.unwrap();
        sink.append(&record(Some(1002), false)).await.unwrap();

        let content = std::fs::read_to_string(sink.main_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Title,IP Address,Government Organization,Timestamp"));
        assert!(lines[1].starts_with("\"Example, Page\",203.0.113.5,Example Gov,2024-05-01 12:00:00,77,"));
        assert!(lines[1].ends_with(",shots/a.png,No"));
        assert!(!sink.sensitive_path().exists());
    }

    #[tokio::test]
    async fn sensitive_rows_go_to_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvRecordSink::in_dir(dir.path());

        sink.append(&record(Some(1001), true)).await.unwrap();

        let main = std::fs::read_to_string(sink.main_path()).unwrap();
        assert!(main.lines().nth(1).unwrap().ends_with(",Yes"));

        let sensitive = std::fs::read_to_string(sink.sensitive_path()).unwrap();
        let lines: Vec<&str> = sensitive.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Sensitive Content Types,Matched Content"));
        assert!(lines[1].ends_with("\"phone_number, address\",555-123-4567; 12 Main Street"));
    }

    #[tokio::test]
    async fn recent_ids_reads_back_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvRecordSink::in_dir(dir.path());

        assert!(sink.recent_ids(10).await.unwrap().is_empty());

        for rev in 1001..1005 {
            sink.append(&record(Some(rev), false)).await.unwrap();
        }
        sink.append(&record(None, false)).await.unwrap();

        let ids = sink.recent_ids(3).await.unwrap();
        assert_eq!(
            ids,
            vec![
                EventId::revision(1003),
                EventId::revision(1004),
                EventId("edit:Example, Page@1714564800".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn truncated_last_row_is_terminated_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvRecordSink::in_dir(dir.path());
        sink.append(&record(Some(1001), false)).await.unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(sink.main_path())
            .unwrap();
        std::io::Write::write_all(&mut file, b"Cut Off,203.0.113").unwrap();

        sink.append(&record(Some(1002), false)).await.unwrap();

        let content = std::fs::read_to_string(sink.main_path()).unwrap();
        let last = content.lines().last().unwrap();
        assert!(last.starts_with("\"Example, Page\",203.0.113.5,"));
        assert!(content.contains("203.0.113\n"));
        assert_eq!(
            sink.recent_ids(10).await.unwrap(),
            vec![EventId::revision(1001), EventId::revision(1002)]
        );
    }

    #[tokio::test]
    async fn recent_ids_skips_damaged_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvRecordSink::in_dir(dir.path());
        sink.append(&record(Some(1001), false)).await.unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(sink.main_path())
            .unwrap();
        std::io::Write::write_all(&mut file, b"half a row,no timestamp\n").unwrap();

        let ids = sink.recent_ids(10).await.unwrap();
        assert_eq!(ids, vec![EventId::revision(1001)]);
    }
}
