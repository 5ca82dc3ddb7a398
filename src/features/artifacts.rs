//! Write-only run artifacts under `<artifacts_dir>/<run_id>/`:
//! `outcomes.jsonl` (one line per request) and, for failed requests,
//! `<request_id>/page.png` plus `<request_id>/dom.html`.
//!
//! Artifact I/O never changes a request's outcome; errors are logged only.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::types::OutcomeRecord;
use crate::scraping::PortalDriver;

pub struct ArtifactWriter {
    run_dir: PathBuf,
    // Serializes appends so concurrent workers never interleave lines.
    journal: Mutex<()>,
}

#[derive(Serialize)]
struct JournalLine<'a> {
    #[serde(flatten)]
    outcome: &'a OutcomeRecord,
    label: &'a str,
}

/// Request ids come from user input; keep path components tame.
fn path_safe(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "request".to_string()
    } else {
        cleaned
    }
}

impl ArtifactWriter {
    pub fn new(artifacts_dir: &Path, run_id: &str) -> Self {
        Self {
            run_dir: artifacts_dir.join(path_safe(run_id)),
            journal: Mutex::new(()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn journal_path(&self) -> PathBuf {
        self.run_dir.join("outcomes.jsonl")
    }

    pub fn request_dir(&self, request_id: &str) -> PathBuf {
        self.run_dir.join(path_safe(request_id))
    }

    /// Append one outcome line.
    pub async fn append_outcome(&self, outcome: &OutcomeRecord) {
        let line = match serde_json::to_string(&JournalLine {
            outcome,
            label: outcome.outcome.label(),
        }) {
            Ok(l) => l,
            Err(e) => {
                warn!("artifacts: cannot serialize outcome {}: {}", outcome.request_id, e);
                return;
            }
        };

        let _guard = self.journal.lock().await;
        if let Err(e) = self.append_line(&line).await {
            warn!("artifacts: failed to append to {}: {}", self.journal_path().display(), e);
        }
    }

    async fn append_line(&self, line: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.run_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }

    /// Screenshot and DOM of the page a failed request ended on.
    pub async fn capture_failure(&self, portal: &mut dyn PortalDriver, request_id: &str) {
        let dir = self.request_dir(request_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!("artifacts: cannot create {}: {}", dir.display(), e);
            return;
        }

        match portal.screenshot().await {
            Ok(png) => {
                if let Err(e) = tokio::fs::write(dir.join("page.png"), png).await {
                    warn!("artifacts: page.png for {}: {}", request_id, e);
                }
            }
            Err(e) => warn!("artifacts: screenshot for {} failed: {}", request_id, e),
        }

        match portal.content().await {
            Ok(html) => {
                if let Err(e) = tokio::fs::write(dir.join("dom.html"), html).await {
                    warn!("artifacts: dom.html for {}: {}", request_id, e);
                }
            }
            Err(e) => warn!("artifacts: DOM snapshot for {} failed: {}", request_id, e),
        }

        info!("📸 Failure snapshot saved to {}", dir.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RunOutcome, SearchType};
    use chrono::Utc;

    #[test]
    fn test_path_safe() {
        assert_eq!(path_safe("req-1_a"), "req-1_a");
        assert_eq!(path_safe("../../etc"), "______etc");
        assert_eq!(path_safe(""), "request");
    }

    #[tokio::test]
    async fn test_outcome_journal_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), "run-1");
        for id in ["a", "b"] {
            writer
                .append_outcome(&OutcomeRecord {
                    run_id: "run-1".into(),
                    request_id: id.into(),
                    court_id: "C1".into(),
                    bench_id: "B1".into(),
                    search_type: SearchType::PartyName,
                    query: "kumar".into(),
                    outcome: RunOutcome::NoResults,
                    captcha_attempts: 1,
                    pipeline_attempts: 1,
                    topology_refreshes: 0,
                    recorded_at: Utc::now(),
                })
                .await;
        }

        let text = std::fs::read_to_string(writer.journal_path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["request_id"], "a");
        assert_eq!(first["label"], "no_results");
    }
}
