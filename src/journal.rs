//! C3 — Probe Journal: an append-only per-model log of probe attempts,
//! used for resume and auditing. Never coupled into the tester's happy-path
//! resume logic (that reads only the registry); this is audit trail and a
//! recovery path if the registry's durable fields are ever lost.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::LmsError;

/// One immutable journal entry — one probe attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeAttempt {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub model_id: String,
    pub requested_ctx: u64,
    pub load_ok: bool,
    pub inference_ok: bool,
    #[serde(default)]
    pub response_excerpt: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
    pub duration_seconds: f64,
}

impl ProbeAttempt {
    /// `inference_ok ⟹ load_ok` — the journal's one cross-field invariant.
    pub fn is_consistent(&self) -> bool {
        !self.inference_ok || self.load_ok
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Handle to one model's append-only journal file.
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one JSON-encoded entry as a single line. Write-then-flush: by
    /// the time this returns, the entry is durable from the process's point
    /// of view (no buffered-but-unflushed window for a crash to lose).
    pub async fn append(&self, entry: &ProbeAttempt) -> Result<(), LmsError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| LmsError::JournalIo {
                    path: self.path.clone(),
                    source,
                })?;
        }

        let mut line = serde_json::to_string(entry).map_err(|e| LmsError::Other(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| LmsError::JournalIo {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| LmsError::JournalIo {
                path: self.path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| LmsError::JournalIo {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Read all entries back, in append order. Used only by recovery tooling
    /// and tests — the tester's normal resume path never calls this.
    pub async fn read_all(&self) -> Result<Vec<ProbeAttempt>, LmsError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LmsError::JournalIo {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let mut entries = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: ProbeAttempt =
                serde_json::from_str(line).map_err(|e| LmsError::Other(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

pub fn new_entry(
    model_id: impl Into<String>,
    requested_ctx: u64,
    load_ok: bool,
    inference_ok: bool,
    response_excerpt: Option<String>,
    error_kind: Option<&str>,
    error_detail: Option<String>,
    duration_seconds: f64,
) -> ProbeAttempt {
    ProbeAttempt {
        timestamp: epoch_ms(),
        model_id: model_id.into(),
        requested_ctx,
        load_ok,
        inference_ok,
        response_excerpt,
        error_kind: error_kind.map(|s| s.to_string()),
        error_detail,
        duration_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "lmstrix-test-journal-{name}-{}.jsonl",
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn append_then_read_all_preserves_order() {
        let path = test_path("order");
        let journal = Journal::new(&path);

        for size in [1024u64, 11264, 21504] {
            let entry = new_entry("model-a", size, true, true, Some("hello".into()), None, None, 0.5);
            journal.append(&entry).await.unwrap();
        }

        let entries = journal.read_all().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].requested_ctx, 1024);
        assert_eq!(entries[2].requested_ctx, 21504);
        for e in &entries {
            assert!(e.is_consistent());
        }
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_journal_reads_as_empty() {
        let path = test_path("missing");
        let journal = Journal::new(&path);
        let entries = journal.read_all().await.unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn inference_ok_implies_load_ok() {
        let bad = ProbeAttempt {
            timestamp: 0,
            model_id: "m".into(),
            requested_ctx: 1024,
            load_ok: false,
            inference_ok: true,
            response_excerpt: None,
            error_kind: None,
            error_detail: None,
            duration_seconds: 0.0,
        };
        assert!(!bad.is_consistent());
    }
}
