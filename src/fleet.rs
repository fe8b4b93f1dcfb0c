//! C5 — Fleet Scheduler: drives the Single-Model Tester across many models,
//! one probe per model per pass, so a whole fleet's journals stay current at
//! all times and an abort loses at most one in-flight probe per model.

use tokio_util::sync::CancellationToken;

use crate::error::LmsError;
use crate::registry::{ModelRecord, Registry, TestStatus};
use crate::tester::{StepResult, TestOptions, Tester};
use crate::backend::Backend;

/// Sort eligible models by declared context ascending, ties broken by path —
/// small-context models converge fastest and free hardware sooner.
fn eligible_sorted(registry: &Registry, options: &TestOptions) -> Vec<ModelRecord> {
    let mut models: Vec<ModelRecord> = registry
        .list()
        .into_iter()
        .filter(|m| is_eligible(m, options))
        .collect();
    models.sort_by(|a, b| {
        a.ctx_in_declared
            .cmp(&b.ctx_in_declared)
            .then_with(|| a.path.cmp(&b.path))
    });
    models
}

/// `options.reset` is never passed in here — [`Fleet::test_fleet`] applies a
/// reset exactly once, up front, and then drives every pass with a plain
/// (non-reset) options value. A model that completes mid-run must become
/// ineligible like any other completed model, not look reset-eligible again
/// on the next pass.
fn is_eligible(record: &ModelRecord, options: &TestOptions) -> bool {
    if record.failed || record.context_test_status == TestStatus::Completed {
        return false;
    }
    if options.target.is_none() {
        if let Some(bad) = record.last_known_bad_context {
            let cap = record.ctx_in_declared.min(options.threshold);
            if bad <= options.min_probe || bad > cap {
                // A bad bound already at or below the floor, or already above
                // the cap, leaves no size left for the intended probe to try.
                return false;
            }
        }
    }
    true
}

/// Clears prior findings for every model that is terminal right now, so the
/// fleet run re-verifies them from scratch. Applied exactly once, before any
/// pass runs — never threaded into per-pass options.
async fn reset_terminal_models(registry: &mut Registry) -> Result<(), LmsError> {
    let to_reset: Vec<String> = registry
        .list()
        .into_iter()
        .filter(|m| m.failed || m.context_test_status == TestStatus::Completed)
        .map(|m| m.path)
        .collect();

    for path in to_reset {
        let Some(mut record) = registry.get(&path)?.cloned() else {
            continue;
        };
        record.tested_max_context = None;
        record.loadable_max_context = None;
        record.last_known_good_context = None;
        record.last_known_bad_context = None;
        record.bisect_iterations = 0;
        record.failed = false;
        record.error_msg = None;
        record.context_test_status = TestStatus::Untested;
        registry.upsert(record).await?;
    }
    Ok(())
}

/// Drives every eligible model to termination, one probe per model per pass.
pub struct Fleet<'a, B: Backend> {
    backend: &'a B,
}

impl<'a, B: Backend> Fleet<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Run every eligible model to termination and return the final records
    /// of every model the fleet knows about — including ones skipped outright
    /// because they were already terminal before this run started.
    pub async fn test_fleet(
        &self,
        registry: &mut Registry,
        options: &TestOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelRecord>, LmsError> {
        let tester = Tester::new(self.backend);

        // Reset is a one-time action on whatever is terminal right now, not a
        // per-pass eligibility rule — otherwise a model that reaches
        // Completed mid-run would look reset-eligible again on the very next
        // pass and the fleet would never converge.
        if options.reset {
            reset_terminal_models(registry).await?;
        }
        let run_options = TestOptions {
            reset: false,
            ..options.clone()
        };

        // Models that were already terminal before this run started are
        // never handed to the pass loop, so they'd otherwise be silently
        // dropped from the result set. Surface them unchanged.
        let mut done: Vec<ModelRecord> = registry
            .list()
            .into_iter()
            .filter(|m| m.failed || m.context_test_status == TestStatus::Completed)
            .collect();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let pending = eligible_sorted(registry, &run_options);
            if pending.is_empty() {
                break;
            }

            for record in pending {
                if cancel.is_cancelled() {
                    break;
                }
                let result = tester
                    .step_once(registry, &record.path, &run_options, cancel)
                    .await?;
                if result == StepResult::Terminal {
                    let finished = registry
                        .get(&record.path)?
                        .cloned()
                        .ok_or_else(|| LmsError::NotFound(record.path.clone()))?;
                    tracing::info!(
                        model = %finished.id,
                        tested_max_context = ?finished.tested_max_context,
                        failed = finished.failed,
                        "fleet_model_terminal"
                    );
                    done.push(finished);
                }
            }
        }

        // Anything still mid-run when cancellation hit the loop — surface it
        // too, so the caller's result list covers every model touched.
        for record in eligible_sorted(registry, &run_options) {
            if !done.iter().any(|d| d.path == record.path) {
                done.push(record);
            }
        }

        Ok(done)
    }
}
