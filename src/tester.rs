//! C4 — Single-Model Tester: given one model record, repeatedly drive the
//! Backend Adapter and update the record until the test is `completed` or
//! `failed`. No suspendable entry points are exposed: every public
//! method here runs to completion (or to the next natural probe boundary
//! for [`step_once`], used by the fleet scheduler) — a backend that
//! serializes on a single loaded model gets nothing from an
//! async-everything design, since only one probe can ever be in flight.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::backend::{is_semantic_good, Backend, ProbeOutcome, PROBE_PROMPT};
use crate::error::{ErrorKind, LmsError};
use crate::journal::{self, Journal};
use crate::registry::{ModelRecord, Registry, TestStatus};

/// Strategy constants, overridable per invocation.
#[derive(Debug, Clone)]
pub struct TestOptions {
    /// Safety ceiling above which the tester refuses to probe regardless of
    /// the model's declared context.
    pub threshold: u64,
    /// Smallest size ever probed.
    pub min_probe: u64,
    /// Climb step size.
    pub step: u64,
    /// Bisect stops once `hi - lo <= convergence`.
    pub convergence: u64,
    /// Bisect iteration cap.
    pub max_iterations: u32,
    /// When set, probe exactly once at this size and return — the CLI's
    /// "test at a specific size" mode.
    pub target: Option<u64>,
    /// Re-enter `in_progress` even if the record is `completed`/`failed`.
    pub reset: bool,
    pub load_timeout: Duration,
    pub inference_timeout: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            threshold: 102_400,
            min_probe: 1_024,
            step: 10_240,
            convergence: 256,
            max_iterations: 25,
            target: None,
            reset: false,
            load_timeout: Duration::from_secs(120),
            inference_timeout: Duration::from_secs(60),
        }
    }
}

/// Phase of the in-memory search plan. Lives only for the
/// duration of one model's test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    VerifyMinimum,
    Climb,
    Bisect,
    Done,
}

/// What [`Tester::step_once`] reports back to its caller (notably the fleet
/// scheduler, which needs to know whether to keep this model in rotation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// One probe happened; the model may still need more.
    Continued,
    /// The test reached a terminal state (`completed` or `failed`).
    Terminal,
}

fn now_iso() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let days = secs / 86_400;
    let day_secs = secs % 86_400;
    let (y, m, d) = days_to_ymd(days);
    let (hh, mm, ss) = (day_secs / 3600, (day_secs % 3600) / 60, day_secs % 60);
    format!("{y:04}-{m:02}-{d:02}T{hh:02}:{mm:02}:{ss:02}Z")
}

/// Civil-from-days, the well-known branchless algorithm (Howard Hinnant).
fn days_to_ymd(z: u64) -> (u64, u64, u64) {
    let z = z as i64 + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y as u64, m, d)
}

/// Drives one model record through the climb-then-bisect strategy to termination.
pub struct Tester<'a, B: Backend> {
    backend: &'a B,
}

impl<'a, B: Backend> Tester<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Run to termination: `completed` or `failed`.
    pub async fn test_one(
        &self,
        registry: &mut Registry,
        identifier: &str,
        options: &TestOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelRecord, LmsError> {
        loop {
            if cancel.is_cancelled() {
                return self.current_record(registry, identifier);
            }
            match self.step_once(registry, identifier, options, cancel).await? {
                StepResult::Terminal => return self.current_record(registry, identifier),
                StepResult::Continued => continue,
            }
        }
    }

    fn current_record(&self, registry: &Registry, identifier: &str) -> Result<ModelRecord, LmsError> {
        registry
            .get(identifier)?
            .cloned()
            .ok_or_else(|| LmsError::NotFound(identifier.to_string()))
    }

    /// Advance the model by exactly one probe (used directly by the fleet
    /// scheduler's single-probe-per-pass rotation, and internally by
    /// `test_one`'s loop).
    pub async fn step_once(
        &self,
        registry: &mut Registry,
        identifier: &str,
        options: &TestOptions,
        cancel: &CancellationToken,
    ) -> Result<StepResult, LmsError> {
        let mut record = registry
            .get(identifier)?
            .cloned()
            .ok_or_else(|| LmsError::NotFound(identifier.to_string()))?;

        let terminal_already = record.failed || record.context_test_status == TestStatus::Completed;
        if terminal_already && !options.reset {
            return Ok(StepResult::Terminal);
        }
        if terminal_already && options.reset {
            // A reset discards prior findings outright rather than resuming
            // from them — otherwise plan_phase would read the very bounds
            // the operator asked to re-establish.
            record.tested_max_context = None;
            record.loadable_max_context = None;
            record.last_known_good_context = None;
            record.last_known_bad_context = None;
            record.bisect_iterations = 0;
            record.failed = false;
            record.error_msg = None;
            record.context_test_status = TestStatus::Untested;
            registry.upsert(record.clone()).await?;
        }

        if let Some(target) = options.target {
            return self
                .probe_and_finish_at_target(registry, &record, target, options, cancel)
                .await;
        }

        let declared = record.ctx_in_declared;
        let cap = declared.min(options.threshold);

        // Declared below the floor — one probe, final answer.
        if declared < options.min_probe && record.last_known_good_context.is_none() {
            return self
                .probe_and_finish_at_target(registry, &record, declared, options, cancel)
                .await;
        }

        let phase = self.plan_phase(&record, options);

        match phase {
            Phase::VerifyMinimum => {
                let outcome = self
                    .run_probe(registry, &record, options.min_probe, options, cancel)
                    .await?;
                let mut updated = self.current_record(registry, identifier)?;
                match classify(&outcome) {
                    Class::Good => {
                        if updated.last_known_good_context == Some(options.min_probe)
                            && options.min_probe >= cap
                        {
                            self.finish(registry, &mut updated, options.min_probe).await?;
                        }
                    }
                    _ => {
                        updated.failed = true;
                        updated.context_test_status = TestStatus::Completed;
                        updated.error_msg = Some("model failed minimum-size verification".to_string());
                        updated.context_test_date = Some(now_iso());
                        registry.upsert(updated).await?;
                    }
                }
                Ok(StepResult::Continued)
            }
            Phase::Climb => {
                // plan_phase only selects Climb when no bad bound is known
                // yet, so the cap is the only ceiling to respect here — a
                // known bad routes through Bisect via the next step_once
                // call instead.
                let good = record.last_known_good_context.unwrap_or(options.min_probe);
                let candidate = good.saturating_add(options.step).min(cap);

                if candidate <= good {
                    // Nothing left to climb toward; fall through to bisect/done.
                    return self.advance_after_climb_stall(registry, &record, options).await;
                }

                let outcome = self.run_probe(registry, &record, candidate, options, cancel).await?;
                let mut updated = self.current_record(registry, identifier)?;
                if matches!(classify(&outcome), Class::Good) && candidate >= cap {
                    self.finish(registry, &mut updated, candidate).await?;
                }
                Ok(StepResult::Continued)
            }
            Phase::Bisect => {
                let lo = record.last_known_good_context.unwrap_or(options.min_probe);
                let hi = record
                    .last_known_bad_context
                    .unwrap_or(cap.saturating_add(1));

                if hi.saturating_sub(lo) <= options.convergence {
                    let mut updated = record.clone();
                    self.finish(registry, &mut updated, lo).await?;
                    return Ok(StepResult::Terminal);
                }

                let mid = lo + (hi - lo) / 2;
                let _ = self.run_probe(registry, &record, mid, options, cancel).await?;

                // Every bisect probe is one iteration, win or lose — persist
                // the count so the cap survives a crash-and-resume, not just
                // one in-process run.
                let mut refreshed = self.current_record(registry, identifier)?;
                refreshed.bisect_iterations = refreshed.bisect_iterations.saturating_add(1);
                registry.upsert(refreshed.clone()).await?;

                let new_lo = refreshed.last_known_good_context.unwrap_or(lo);
                let new_hi = refreshed.last_known_bad_context.unwrap_or(hi);
                if new_hi.saturating_sub(new_lo) <= options.convergence
                    || refreshed.bisect_iterations >= options.max_iterations
                {
                    let mut updated = refreshed;
                    self.finish(registry, &mut updated, new_lo).await?;
                    return Ok(StepResult::Terminal);
                }
                Ok(StepResult::Continued)
            }
            Phase::Done => Ok(StepResult::Terminal),
        }
    }

    /// Resume logic: infer which phase to run next from the bounds already
    /// on the record, never re-verifying an already-known region.
    fn plan_phase(&self, record: &ModelRecord, _options: &TestOptions) -> Phase {
        match (record.last_known_good_context, record.last_known_bad_context) {
            (None, None) => Phase::VerifyMinimum,
            (Some(_), None) => Phase::Climb,
            (_, Some(_)) => Phase::Bisect,
        }
    }

    /// When climb can't step further (cap already reached without a bad
    /// bound, or the next candidate wouldn't exceed the current good), decide
    /// whether the test is done or must fall back to bisect.
    async fn advance_after_climb_stall(
        &self,
        registry: &mut Registry,
        record: &ModelRecord,
        _options: &TestOptions,
    ) -> Result<StepResult, LmsError> {
        if record.last_known_bad_context.is_some() {
            // Let the next step_once invocation pick Phase::Bisect naturally.
            return Ok(StepResult::Continued);
        }
        // Cap reached and it was GOOD (climb only stalls this way when the
        // last good size already equals the cap): done.
        let mut updated = record.clone();
        let good = record.last_known_good_context.unwrap_or_default();
        self.finish(registry, &mut updated, good).await?;
        Ok(StepResult::Terminal)
    }

    /// Explicit-target mode and the "declared below the floor" tie-break:
    /// probe exactly once, report the outcome as the final answer.
    async fn probe_and_finish_at_target(
        &self,
        registry: &mut Registry,
        record: &ModelRecord,
        target: u64,
        options: &TestOptions,
        cancel: &CancellationToken,
    ) -> Result<StepResult, LmsError> {
        let outcome = self.run_probe(registry, record, target, options, cancel).await?;
        let mut updated = registry
            .get(&record.path)?
            .cloned()
            .ok_or_else(|| LmsError::NotFound(record.path.clone()))?;

        match classify(&outcome) {
            Class::Good => {
                self.finish(registry, &mut updated, target).await?;
            }
            class => {
                // A single-shot probe that doesn't come back GOOD has no
                // tested_max_context to report, so the record must be marked
                // failed to satisfy "completed ⟹ tested_max_context set OR
                // failed = true" — this is the final word for this run,
                // there's no further phase to fall back on.
                updated.context_test_status = TestStatus::Completed;
                updated.context_test_date = Some(now_iso());
                updated.failed = true;
                updated.error_msg = Some(match (class, outcome.error_kind()) {
                    (_, Some(ErrorKind::NotFound)) => "model not resolvable".to_string(),
                    (Class::BadSemantic, _) => {
                        format!("probe at size {target} did not contain the expected probe substring")
                    }
                    (_, Some(kind)) => format!("probe at size {target} failed: {kind}"),
                    (_, None) => format!("probe at size {target} failed"),
                });
                registry.upsert(updated).await?;
            }
        }
        Ok(StepResult::Terminal)
    }

    async fn finish(
        &self,
        registry: &mut Registry,
        record: &mut ModelRecord,
        tested_max: u64,
    ) -> Result<(), LmsError> {
        record.tested_max_context = Some(tested_max);
        record.context_test_status = TestStatus::Completed;
        record.context_test_date = Some(now_iso());
        record.failed = false;
        registry.upsert(record.clone()).await
    }

    /// Run one probe, journal it, and fold the outcome into the record's
    /// bounds. Returns the raw outcome so the caller can decide
    /// what happens next.
    async fn run_probe(
        &self,
        registry: &mut Registry,
        record: &ModelRecord,
        size: u64,
        options: &TestOptions,
        cancel: &CancellationToken,
    ) -> Result<ProbeOutcome, LmsError> {
        let journal_path = record.context_test_log_path.clone().unwrap_or_else(|| {
            default_journal_path(&record.path)
        });

        let mut current = registry
            .get(&record.path)?
            .cloned()
            .ok_or_else(|| LmsError::NotFound(record.path.clone()))?;
        if current.context_test_status == TestStatus::Untested {
            current.context_test_status = TestStatus::InProgress;
            current.context_test_log_path = Some(journal_path.clone());
            current.context_test_date = Some(now_iso());
            registry.upsert(current.clone()).await?;
        }

        let start = Instant::now();
        let outcome = self
            .backend
            .probe(
                &record.id,
                size,
                PROBE_PROMPT,
                options.load_timeout,
                options.inference_timeout,
                cancel,
            )
            .await;
        let elapsed = start.elapsed();

        let semantic_good = match &outcome {
            ProbeOutcome::Success { response_text, .. } => is_semantic_good(response_text),
            _ => false,
        };

        let entry = journal::new_entry(
            record.id.clone(),
            size,
            outcome.load_ok(),
            outcome.inference_ok() && semantic_good,
            outcome.response_excerpt(),
            outcome.error_kind().map(|k| k.as_str()),
            outcome.error_detail(),
            elapsed.as_secs_f64(),
        );
        Journal::new(&journal_path).append(&entry).await?;

        let mut record = registry
            .get(&record.path)?
            .cloned()
            .ok_or_else(|| LmsError::NotFound(record.path.clone()))?;

        apply_classification(&mut record, size, &outcome, semantic_good);
        registry.upsert(record).await?;

        Ok(outcome)
    }
}

fn default_journal_path(path_key: &str) -> String {
    let sanitized: String = path_key
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!(".lmstrix/journals/{sanitized}.jsonl")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Good,
    BadSemantic,
    BadInfer,
    BadLoad,
}

fn classify(outcome: &ProbeOutcome) -> Class {
    match outcome {
        ProbeOutcome::Success { response_text, .. } => {
            if is_semantic_good(response_text) {
                Class::Good
            } else {
                Class::BadSemantic
            }
        }
        ProbeOutcome::InferenceFailed { .. } | ProbeOutcome::InferenceHung { .. } => Class::BadInfer,
        ProbeOutcome::LoadFailed { .. } => Class::BadLoad,
    }
}

/// Folds one probe outcome into a record's known-good/known-bad bounds.
fn apply_classification(record: &mut ModelRecord, size: u64, outcome: &ProbeOutcome, semantic_good: bool) {
    match classify(outcome) {
        Class::Good => {
            if record.last_known_good_context.is_none_or(|g| size > g) {
                record.last_known_good_context = Some(size);
            }
            if record.loadable_max_context.is_none_or(|l| size > l) {
                record.loadable_max_context = Some(size);
            }
        }
        Class::BadSemantic => {
            debug_assert!(!semantic_good);
            if record.last_known_bad_context.is_none_or(|b| size < b) {
                record.last_known_bad_context = Some(size);
            }
            if record.loadable_max_context.is_none_or(|l| size > l) {
                record.loadable_max_context = Some(size);
            }
        }
        Class::BadInfer => {
            if record.last_known_bad_context.is_none_or(|b| size < b) {
                record.last_known_bad_context = Some(size);
            }
            if record.loadable_max_context.is_none_or(|l| size > l) {
                record.loadable_max_context = Some(size);
            }
        }
        Class::BadLoad => {
            if record.last_known_bad_context.is_none_or(|b| size < b) {
                record.last_known_bad_context = Some(size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, ScriptedOutcome};
    use crate::registry::ModelRecord;

    async fn fresh_registry(path: &str) -> Registry {
        let dir = std::env::temp_dir().join(format!(
            "lmstrix-test-tester-{path}-{}",
            std::process::id()
        ));
        Registry::load(dir.join("registry.json")).await.unwrap()
    }

    fn options() -> TestOptions {
        TestOptions {
            threshold: 102_400,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scenario_small_model_that_works_everywhere() {
        let backend = FakeBackend::always(ScriptedOutcome::Good);
        let mut registry = fresh_registry("small-ok").await;
        registry
            .upsert(ModelRecord::new(
                "small".into(),
                "models/small.gguf".into(),
                4096,
                None,
                None,
                false,
                false,
            ))
            .await
            .unwrap();

        let tester = Tester::new(&backend);
        let cancel = CancellationToken::new();
        let record = tester
            .test_one(&mut registry, "models/small.gguf", &options(), &cancel)
            .await
            .unwrap();

        assert_eq!(record.tested_max_context, Some(4096));
        assert_eq!(record.context_test_status, TestStatus::Completed);
        assert_eq!(backend.probed_sizes(), vec![1024, 4096]);
    }

    #[tokio::test]
    async fn scenario_model_that_hangs_fails_fast() {
        let backend = FakeBackend::always(ScriptedOutcome::Hung);
        let mut registry = fresh_registry("hangs").await;
        registry
            .upsert(ModelRecord::new(
                "hangy".into(),
                "models/hangy.gguf".into(),
                131_072,
                None,
                None,
                false,
                false,
            ))
            .await
            .unwrap();

        let tester = Tester::new(&backend);
        let cancel = CancellationToken::new();
        let record = tester
            .test_one(&mut registry, "models/hangy.gguf", &options(), &cancel)
            .await
            .unwrap();

        assert!(record.failed);
        assert_eq!(record.context_test_status, TestStatus::Completed);
        assert_eq!(backend.probed_sizes(), vec![1024]);
    }

    #[tokio::test]
    async fn scenario_threshold_clamp_never_exceeded() {
        let backend = FakeBackend::always(ScriptedOutcome::Good);
        let mut registry = fresh_registry("threshold").await;
        registry
            .upsert(ModelRecord::new(
                "huge".into(),
                "models/huge.gguf".into(),
                1_048_576,
                None,
                None,
                false,
                false,
            ))
            .await
            .unwrap();

        let tester = Tester::new(&backend);
        let cancel = CancellationToken::new();
        let record = tester
            .test_one(&mut registry, "models/huge.gguf", &options(), &cancel)
            .await
            .unwrap();

        assert_eq!(record.tested_max_context, Some(102_400));
        for size in backend.probed_sizes() {
            assert!(size <= 102_400);
        }
    }

    #[tokio::test]
    async fn scenario_model_that_lies_bisects_down() {
        let backend = FakeBackend::good_up_to(29_696, ScriptedOutcome::BadLoad);
        let mut registry = fresh_registry("lies").await;
        registry
            .upsert(ModelRecord::new(
                "liar".into(),
                "models/liar.gguf".into(),
                131_072,
                None,
                None,
                false,
                false,
            ))
            .await
            .unwrap();

        let tester = Tester::new(&backend);
        let cancel = CancellationToken::new();
        let record = tester
            .test_one(&mut registry, "models/liar.gguf", &options(), &cancel)
            .await
            .unwrap();

        let tested = record.tested_max_context.unwrap();
        assert!((29_440..=29_696).contains(&tested), "tested={tested}");
        assert!(record.last_known_bad_context.unwrap() <= 102_400);
        assert_eq!(record.context_test_status, TestStatus::Completed);
    }

    #[tokio::test]
    async fn resume_skips_verify_minimum_when_bounds_known() {
        let backend = FakeBackend::always(ScriptedOutcome::Good);
        let mut registry = fresh_registry("resume").await;
        let mut record = ModelRecord::new(
            "resumed".into(),
            "models/resumed.gguf".into(),
            131_072,
            None,
            None,
            false,
            false,
        );
        record.last_known_good_context = Some(32_768);
        record.last_known_bad_context = Some(65_536);
        record.context_test_status = TestStatus::InProgress;
        registry.upsert(record).await.unwrap();

        let tester = Tester::new(&backend);
        let cancel = CancellationToken::new();
        tester
            .step_once(&mut registry, "models/resumed.gguf", &options(), &cancel)
            .await
            .unwrap();

        // The first probe after resume must be a bisect midpoint, never
        // min_probe (1024) — Phase V must be skipped entirely.
        let probed = backend.probed_sizes();
        assert_eq!(probed.len(), 1);
        assert_ne!(probed[0], 1024);
        assert!(probed[0] > 32_768 && probed[0] < 65_536);
    }

    #[tokio::test]
    async fn declared_below_floor_probes_once() {
        let backend = FakeBackend::always(ScriptedOutcome::Good);
        let mut registry = fresh_registry("below-floor").await;
        registry
            .upsert(ModelRecord::new(
                "tiny".into(),
                "models/tiny.gguf".into(),
                512,
                None,
                None,
                false,
                false,
            ))
            .await
            .unwrap();

        let tester = Tester::new(&backend);
        let cancel = CancellationToken::new();
        let record = tester
            .test_one(&mut registry, "models/tiny.gguf", &options(), &cancel)
            .await
            .unwrap();

        assert_eq!(backend.probed_sizes(), vec![512]);
        assert_eq!(record.tested_max_context, Some(512));
    }
}
