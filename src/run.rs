//! Per-run output directory
//!
//! Each collection run gets `data/runs/<timestamp>_<type>_<id>/` holding
//! the batch it produced (NDJSON), a pretty-printed run summary, the
//! quality report for that batch, and the failed-task list when tasks
//! failed. The batch itself is discarded after merge; these files are the
//! audit trail.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::model::{Conversation, Message, TaskOutcome, TaskStatus};
use crate::pacing::PacingStats;
use crate::quality::QualityReport;
use crate::store::MergeResult;

pub struct RunWriter {
    run_id: String,
    dir: PathBuf,
}

impl RunWriter {
    pub fn create(data_dir: &Path, run_type: &str) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string()[..8].to_string();
        let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let dir = data_dir
            .join("runs")
            .join(format!("{timestamp}_{run_type}_{run_id}"));
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating run directory {}", dir.display()))?;
        info!(run_id = %run_id, dir = %dir.display(), "run started");
        Ok(Self { run_id, dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_conversations(&self, conversations: &[Conversation]) -> Result<PathBuf> {
        self.write_jsonl("conversations.jsonl", conversations)
    }

    pub fn write_messages(&self, messages: &[Message]) -> Result<PathBuf> {
        self.write_jsonl("messages.jsonl", messages)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        self.write_pretty("run_summary.json", summary)
    }

    pub fn write_quality(&self, report: &QualityReport) -> Result<PathBuf> {
        self.write_pretty("quality_report.json", report)
    }

    /// Failed tasks only, one per line, for targeted retries. `None` when
    /// nothing failed.
    pub fn write_failures(&self, outcomes: &[TaskOutcome]) -> Result<Option<PathBuf>> {
        let failed: Vec<&TaskOutcome> = outcomes
            .iter()
            .filter(|o| o.status == TaskStatus::Failed || o.status == TaskStatus::Partial)
            .collect();
        if failed.is_empty() {
            return Ok(None);
        }
        self.write_jsonl("failed_conversations.jsonl", &failed)
            .map(Some)
    }

    fn write_jsonl<T: Serialize>(&self, name: &str, items: &[T]) -> Result<PathBuf> {
        let path = self.dir.join(name);
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for item in items {
            serde_json::to_writer(&mut writer, item)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(path)
    }

    fn write_pretty<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

/// Persisted once per run; the only part of a batch that outlives merge.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub run_type: String,
    pub status: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub conversations_collected: usize,
    pub messages_collected: usize,
    pub tasks: TaskTally,
    pub merge: Option<MergeResult>,
    pub pacing: PacingStats,
    pub outcomes: Vec<TaskOutcome>,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TaskTally {
    pub attempted: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl TaskTally {
    pub fn count(outcomes: &[TaskOutcome]) -> Self {
        let mut tally = Self {
            attempted: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome.status {
                TaskStatus::Success => tally.succeeded += 1,
                TaskStatus::Partial => tally.partial += 1,
                TaskStatus::Failed => tally.failed += 1,
                TaskStatus::Skipped => tally.skipped += 1,
                TaskStatus::Cancelled => tally.cancelled += 1,
            }
        }
        tally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Termination;

    fn outcome(id: i64, status: TaskStatus) -> TaskOutcome {
        TaskOutcome {
            conversation_id: id,
            status,
            message_count: 0,
            pages: 0,
            termination: Some(Termination::Exhausted),
            duration_secs: 0.1,
            error: None,
        }
    }

    #[test]
    fn test_tally_counts_every_status() {
        let outcomes = vec![
            outcome(1, TaskStatus::Success),
            outcome(2, TaskStatus::Success),
            outcome(3, TaskStatus::Partial),
            outcome(4, TaskStatus::Failed),
            outcome(5, TaskStatus::Skipped),
        ];
        let tally = TaskTally::count(&outcomes);
        assert_eq!(tally.attempted, 5);
        assert_eq!(tally.succeeded, 2);
        assert_eq!(tally.partial, 1);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.skipped, 1);
        assert_eq!(tally.cancelled, 0);
    }

    #[test]
    fn test_run_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RunWriter::create(dir.path(), "messages").unwrap();

        assert!(writer.dir().starts_with(dir.path().join("runs")));
        let name = writer
            .dir()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        assert!(name.contains("_messages_"));
        assert!(name.ends_with(writer.run_id()));

        writer.write_conversations(&[]).unwrap();
        let failures = writer
            .write_failures(&[outcome(3, TaskStatus::Failed)])
            .unwrap();
        assert!(failures.is_some());
        assert!(writer.dir().join("conversations.jsonl").exists());
        assert!(writer.dir().join("failed_conversations.jsonl").exists());

        // Nothing failed, nothing written
        let none = writer.write_failures(&[outcome(1, TaskStatus::Success)]);
        assert!(none.unwrap().is_none());
    }
}
