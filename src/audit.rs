//! Append-only record of every evaluated candidate.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{Candidate, EvaluatedCandidate, QualityRecord};
use crate::errors::PipelineError;
use crate::transport::fs::{ensure_parent_dir, read_optional};

/// One audit line: a candidate and its verdict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Identifier of the run that produced the candidate.
    pub run_id: String,
    /// When the entry was appended.
    pub recorded_at: DateTime<Utc>,
    /// The evaluated candidate.
    pub candidate: Candidate,
    /// Its quality verdict.
    pub record: QualityRecord,
}

impl AuditEntry {
    /// Entry for `evaluated` stamped with the current time.
    pub fn new(run_id: impl Into<String>, evaluated: &EvaluatedCandidate) -> Self {
        Self {
            run_id: run_id.into(),
            recorded_at: Utc::now(),
            candidate: evaluated.candidate.clone(),
            record: evaluated.record.clone(),
        }
    }
}

/// Sink for audit entries. Appends from concurrent workers must not interleave.
pub trait AuditLog: Send + Sync {
    /// Append one entry.
    fn append(&self, entry: &AuditEntry) -> Result<(), PipelineError>;

    /// Every complete entry written so far, in append order.
    fn entries(&self) -> Result<Vec<AuditEntry>, PipelineError>;
}

/// Process-local audit log.
#[derive(Default)]
pub struct InMemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditLog for InMemoryAuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<(), PipelineError> {
        self.entries
            .lock()
            .map_err(|_| PipelineError::Audit("audit log lock poisoned".into()))?
            .push(entry.clone());
        Ok(())
    }

    fn entries(&self) -> Result<Vec<AuditEntry>, PipelineError> {
        Ok(self
            .entries
            .lock()
            .map_err(|_| PipelineError::Audit("audit log lock poisoned".into()))?
            .clone())
    }
}

/// JSON-lines audit file. Each entry is written with a single `write_all`.
pub struct JsonlAuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditLog {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, PipelineError> {
        let path = path.into();
        ensure_parent_dir(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditLog for JsonlAuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<(), PipelineError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| PipelineError::Audit("audit log lock poisoned".into()))?;
        file.write_all(&line)
            .map_err(|err| PipelineError::Audit(format!("append failed: {err}")))
    }

    fn entries(&self) -> Result<Vec<AuditEntry>, PipelineError> {
        let Some(bytes) = read_optional(&self.path)? else {
            return Ok(Vec::new());
        };
        let text = String::from_utf8_lossy(&bytes);
        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    debug!("[counterfactuals:audit] skipping unreadable line: {err}");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{C2Score, LabeledExample};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn evaluated(id: &str) -> EvaluatedCandidate {
        let seed = LabeledExample::new("s1", "Great food.", "food");
        let candidate = Candidate::new(
            id.into(),
            &seed,
            "service".into(),
            None,
            "Great service.".into(),
            0,
            0,
        )
        .unwrap();
        EvaluatedCandidate {
            record: QualityRecord {
                candidate_id: id.into(),
                label: "service".into(),
                passed_c1: true,
                c2_score: C2Score::NotApplicable,
                c3_flip_score: 0.9,
                c3_soft_flip_score: 0.8,
                overall_pass: true,
                rejection_reason: None,
                detail: None,
            },
            candidate,
        }
    }

    #[test]
    fn jsonl_log_round_trips_and_skips_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("run.jsonl");
        let log = JsonlAuditLog::open(&path).unwrap();
        log.append(&AuditEntry::new("run-1", &evaluated("c1"))).unwrap();
        log.append(&AuditEntry::new("run-1", &evaluated("c2"))).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"run_id\":\"run-1\",\"recor")
            .unwrap();
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].candidate.id, "c2");
    }

    #[test]
    fn reopening_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.jsonl");
        JsonlAuditLog::open(&path)
            .unwrap()
            .append(&AuditEntry::new("a", &evaluated("c1")))
            .unwrap();
        let log = JsonlAuditLog::open(&path).unwrap();
        log.append(&AuditEntry::new("b", &evaluated("c2"))).unwrap();
        let runs: Vec<_> = log.entries().unwrap().into_iter().map(|e| e.run_id).collect();
        assert_eq!(runs, vec!["a", "b"]);
    }

    #[test]
    fn concurrent_appends_stay_line_delimited() {
        let dir = tempdir().unwrap();
        let log = Arc::new(JsonlAuditLog::open(dir.path().join("run.jsonl")).unwrap());
        std::thread::scope(|scope| {
            for worker in 0..4 {
                let log = Arc::clone(&log);
                scope.spawn(move || {
                    for idx in 0..25 {
                        let id = format!("w{worker}-{idx}");
                        log.append(&AuditEntry::new("run", &evaluated(&id))).unwrap();
                    }
                });
            }
        });
        assert_eq!(log.entries().unwrap().len(), 100);
    }

    #[test]
    fn in_memory_log_keeps_order() {
        let log = InMemoryAuditLog::new();
        log.append(&AuditEntry::new("r", &evaluated("x"))).unwrap();
        log.append(&AuditEntry::new("r", &evaluated("y"))).unwrap();
        let ids: Vec<_> = log
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.candidate.id)
            .collect();
        assert_eq!(ids, vec!["x", "y"]);
    }
}
