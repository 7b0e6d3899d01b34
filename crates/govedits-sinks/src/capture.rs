//! Diff capture through an external renderer
//!
//! The renderer is any program that takes a URL and writes an image, e.g.
//! headless Chromium's `--screenshot`. Its argument list is a template where
//! `{url}`, `{output}` and `{title}` are substituted per capture.
//!
//! Images land in `<dir>/<YYYY-MM-DD>/<YYYY-MM-DD> - <title> - <HHMMSS>.png`,
//! dated by the edit, not by the capture.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use govedits_core::traits::DiffCapture;
use govedits_core::{EditEvent, Error, MatchResult, Result};

const NAME: &str = "capture";

/// Characters replaced by `_` in file names
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Headless Chromium with a 1000x1200 viewport
pub fn default_command() -> Vec<String> {
    [
        "chromium",
        "--headless",
        "--disable-gpu",
        "--hide-scrollbars",
        "--window-size=1000,1200",
        "--screenshot={output}",
        "{url}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Replace characters that are invalid in file names
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if INVALID_FILENAME_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Where the image for `event` is written
pub fn screenshot_path(dir: &Path, event: &EditEvent) -> PathBuf {
    let date = event.timestamp.format("%Y-%m-%d").to_string();
    let file = format!(
        "{} - {} - {}.png",
        date,
        sanitize_filename(&event.title),
        event.timestamp.format("%H%M%S")
    );
    dir.join(&date).join(file)
}

/// Runs a renderer command per match
#[derive(Debug, Clone)]
pub struct CommandCapture {
    dir: PathBuf,
    command: Vec<String>,
}

impl CommandCapture {
    /// Capture into `dir` with the given command template
    pub fn new(dir: impl Into<PathBuf>, command: Vec<String>) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(Error::config("Capture command cannot be empty"));
        }
        if !command.iter().any(|arg| arg.contains("{output}")) {
            return Err(Error::config("Capture command must reference {output}"));
        }
        Ok(Self {
            dir: dir.into(),
            command,
        })
    }

    /// Screenshot directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn render_args(&self, url: &str, output: &Path, title: &str) -> Vec<String> {
        let output = output.display().to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{url}", url)
                    .replace("{output}", &output)
                    .replace("{title}", title)
            })
            .collect()
    }
}

#[async_trait]
impl DiffCapture for CommandCapture {
    fn name(&self) -> &str {
        NAME
    }

    async fn capture(&self, result: &MatchResult) -> Result<PathBuf> {
        let event = &result.event;
        let output = screenshot_path(&self.dir, event);
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::dispatch(NAME, format!("Cannot create {}: {}", parent.display(), e)))?;
        }

        let url = event.diff_url();
        let args = self.render_args(&url, &output, &event.title);
        debug!(program = %args[0], %url, output = %output.display(), "Capturing diff");

        // dropped on timeout, which must not leave a renderer behind
        let rendered = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::dispatch(NAME, format!("Failed to spawn '{}': {}", args[0], e)))?;

        if !rendered.status.success() {
            let stderr = String::from_utf8_lossy(&rendered.stderr);
            warn!(
                exit_code = ?rendered.status.code(),
                stderr = %stderr.trim(),
                title = %event.title,
                "Renderer failed"
            );
            return Err(Error::dispatch(
                NAME,
                format!(
                    "Renderer exited with code {}: {}",
                    rendered.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        match fs::metadata(&output).await {
            Ok(meta) if meta.len() > 0 => Ok(output),
            _ => Err(Error::dispatch(
                NAME,
                format!("Renderer produced no image at {}", output.display()),
            )),
        }
    }
}
