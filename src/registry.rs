//! C2 — Registry Store: the durable catalog of known models and their test
//! state. Atomic load/save, identifier-agnostic resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LmsError;

/// One of `{untested, in_progress, completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Untested,
    InProgress,
    Completed,
    Failed,
}

impl Default for TestStatus {
    fn default() -> Self {
        Self::Untested
    }
}

/// The registry's unit of persistence — one locally-known model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    /// Storage path as reported by the backend — the registry's primary key.
    pub path: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub has_tools: bool,
    #[serde(default)]
    pub has_vision: bool,
    pub ctx_in_declared: u64,
    #[serde(default)]
    pub ctx_out_default: Option<u64>,
    #[serde(default)]
    pub tested_max_context: Option<u64>,
    #[serde(default)]
    pub loadable_max_context: Option<u64>,
    #[serde(default)]
    pub last_known_good_context: Option<u64>,
    #[serde(default)]
    pub last_known_bad_context: Option<u64>,
    #[serde(default)]
    pub context_test_status: TestStatus,
    #[serde(default)]
    pub context_test_date: Option<String>,
    #[serde(default)]
    pub context_test_log_path: Option<String>,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub error_msg: Option<String>,
    /// Probes taken so far in the current bisect run. Not part of spec.md's
    /// documented Model Record fields (it's the persisted half of the
    /// transient Test Plan's `iterations_spent`, kept here so the bisect
    /// iteration cap survives a crash-and-resume); `#[serde(default)]` keeps
    /// older registry files parsing as 0.
    #[serde(default)]
    pub bisect_iterations: u32,
}

impl ModelRecord {
    /// A freshly-scanned record: untested, no bounds, no journal yet.
    pub fn new(
        id: String,
        path: String,
        ctx_in_declared: u64,
        ctx_out_default: Option<u64>,
        size_bytes: Option<u64>,
        has_tools: bool,
        has_vision: bool,
    ) -> Self {
        Self {
            id,
            short_id: None,
            path,
            size_bytes,
            has_tools,
            has_vision,
            ctx_in_declared,
            ctx_out_default,
            tested_max_context: None,
            loadable_max_context: None,
            last_known_good_context: None,
            last_known_bad_context: None,
            context_test_status: TestStatus::Untested,
            context_test_date: None,
            context_test_log_path: None,
            failed: false,
            error_msg: None,
            bisect_iterations: 0,
        }
    }

    /// good < bad whenever both are set.
    pub fn bounds_consistent(&self) -> bool {
        match (self.last_known_good_context, self.last_known_bad_context) {
            (Some(g), Some(b)) => g < b,
            _ => true,
        }
    }

    /// a completed test has either a tested max or a sticky failure.
    pub fn completion_consistent(&self) -> bool {
        if self.context_test_status != TestStatus::Completed {
            return true;
        }
        self.tested_max_context.is_some() || self.failed
    }
}

/// Which field of a [`ModelRecord`] an identifier matched, used to break ties
/// by the `path > id > short_id` resolution precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum MatchKind {
    ShortId = 0,
    Id = 1,
    Path = 2,
}

/// Owns the on-disk registry file: a JSON object keyed by `path`.
pub struct Registry {
    path: PathBuf,
    records: HashMap<String, ModelRecord>,
}

impl Registry {
    /// Load the registry from `path`, or start empty if the file doesn't exist.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, LmsError> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let map: HashMap<String, ModelRecord> =
                    serde_json::from_slice(&bytes).map_err(|e| LmsError::RegistryCorrupt {
                        path: path.clone(),
                        detail: e.to_string(),
                    })?;
                map
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(LmsError::RegistryIo {
                    path: path.clone(),
                    source,
                });
            }
        };
        Ok(Self { path, records })
    }

    pub fn list(&self) -> Vec<ModelRecord> {
        let mut v: Vec<ModelRecord> = self.records.values().cloned().collect();
        v.sort_by(|a, b| a.path.cmp(&b.path));
        v
    }

    /// Resolve `identifier` against `path`, `id`, or `short_id`, in that
    /// precedence. Matching more than one record under the same precedence
    /// tier is reported as an ambiguity error rather than silently resolved.
    pub fn get(&self, identifier: &str) -> Result<Option<&ModelRecord>, LmsError> {
        let mut matches: Vec<(MatchKind, &ModelRecord)> = Vec::new();
        for record in self.records.values() {
            if record.path == identifier {
                matches.push((MatchKind::Path, record));
            } else if record.id == identifier {
                matches.push((MatchKind::Id, record));
            } else if record.short_id.as_deref() == Some(identifier) {
                matches.push((MatchKind::ShortId, record));
            }
        }

        if matches.is_empty() {
            return Ok(None);
        }

        let best_kind = matches.iter().map(|(k, _)| *k).max().unwrap();
        let at_best: Vec<&ModelRecord> = matches
            .iter()
            .filter(|(k, _)| *k == best_kind)
            .map(|(_, r)| *r)
            .collect();

        if at_best.len() > 1 {
            return Err(LmsError::AmbiguousIdentifier(identifier.to_string()));
        }

        Ok(Some(at_best[0]))
    }

    pub fn get_mut(&mut self, identifier: &str) -> Result<Option<&mut ModelRecord>, LmsError> {
        // Re-resolve the key through the immutable path, then fetch mutably by
        // that key — avoids duplicating the precedence/ambiguity logic above
        // while sidestepping borrow-checker aliasing on `&mut self.records`.
        let key = match self.get(identifier)? {
            Some(r) => r.path.clone(),
            None => return Ok(None),
        };
        Ok(self.records.get_mut(&key))
    }

    /// Atomic upsert: merges into the in-memory map and persists via
    /// temp-file-then-rename, fsyncing the temp file first.
    pub async fn upsert(&mut self, record: ModelRecord) -> Result<(), LmsError> {
        self.records.insert(record.path.clone(), record);
        self.save().await
    }

    /// Replace the entire catalog (used after a scan), preserving nothing by
    /// itself — callers merge existing test state into the new records
    /// before calling this — a fresh scan's records carry no test history.
    pub async fn replace_all(&mut self, records: Vec<ModelRecord>) -> Result<(), LmsError> {
        self.records = records.into_iter().map(|r| (r.path.clone(), r)).collect();
        self.save().await
    }

    async fn save(&self) -> Result<(), LmsError> {
        atomic_write_json(&self.path, &self.records).await
    }
}

/// Serialize `value` and write it to `path` via temp-file-then-rename,
/// fsyncing the temp file before rename so the registry file is always
/// either the pre- or post-state, never a partial write.
async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), LmsError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| LmsError::RegistryIo {
                path: path.to_path_buf(),
                source,
            })?;
    }

    let json = serde_json::to_vec_pretty(value).map_err(|e| LmsError::RegistryCorrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));

    let io_err = |source: std::io::Error| LmsError::RegistryIo {
        path: path.to_path_buf(),
        source,
    };

    let file = tokio::fs::File::create(&tmp_path).await.map_err(io_err)?;
    {
        use tokio::io::AsyncWriteExt;
        let mut file = file;
        file.write_all(&json).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
    }

    if let Err(source) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(LmsError::RegistryIo {
            path: path.to_path_buf(),
            source,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lmstrix-test-registry-{name}-{}", std::process::id()))
    }

    fn sample(path: &str, id: &str) -> ModelRecord {
        ModelRecord::new(id.to_string(), path.to_string(), 4096, None, None, false, false)
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips() {
        let dir = test_dir("roundtrip");
        let file = dir.join("registry.json");
        let mut registry = Registry::load(&file).await.unwrap();
        registry.upsert(sample("models/a.gguf", "model-a")).await.unwrap();

        let reloaded = Registry::load(&file).await.unwrap();
        let got = reloaded.get("model-a").unwrap().unwrap();
        assert_eq!(got.path, "models/a.gguf");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn get_resolves_by_any_identifier_with_precedence() {
        let dir = test_dir("precedence");
        let file = dir.join("registry.json");
        let mut registry = Registry::load(&file).await.unwrap();
        let mut rec = sample("models/a.gguf", "model-a");
        rec.short_id = Some("a".to_string());
        registry.upsert(rec).await.unwrap();

        assert_eq!(registry.get("models/a.gguf").unwrap().unwrap().path, "models/a.gguf");
        assert_eq!(registry.get("model-a").unwrap().unwrap().path, "models/a.gguf");
        assert_eq!(registry.get("a").unwrap().unwrap().path, "models/a.gguf");
        assert!(registry.get("nope").unwrap().is_none());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn get_reports_ambiguity_instead_of_silently_resolving() {
        let dir = test_dir("ambiguous");
        let file = dir.join("registry.json");
        let mut registry = Registry::load(&file).await.unwrap();
        // Two records whose short_id collides — same precedence tier, no
        // higher-precedence match to break the tie.
        let mut a = sample("models/a.gguf", "model-a");
        a.short_id = Some("dup".to_string());
        let mut b = sample("models/b.gguf", "model-b");
        b.short_id = Some("dup".to_string());
        registry.upsert(a).await.unwrap();
        registry.upsert(b).await.unwrap();

        assert!(matches!(registry.get("dup"), Err(LmsError::AmbiguousIdentifier(_))));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn corrupt_registry_is_not_overwritten() {
        let dir = test_dir("corrupt");
        let file = dir.join("registry.json");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(&file, b"{not valid json").await.unwrap();

        let result = Registry::load(&file).await;
        assert!(matches!(result, Err(LmsError::RegistryCorrupt { .. })));

        // The file on disk is untouched.
        let bytes = tokio::fs::read(&file).await.unwrap();
        assert_eq!(bytes, b"{not valid json");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn bounds_consistency_invariant() {
        let mut r = sample("p", "i");
        r.last_known_good_context = Some(100);
        r.last_known_bad_context = Some(50);
        assert!(!r.bounds_consistent());
        r.last_known_bad_context = Some(200);
        assert!(r.bounds_consistent());
    }
}
