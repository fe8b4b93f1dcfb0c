//! C1 — Backend Adapter: a single synchronous-shaped probe operation that
//! hides all backend-specific detail behind one probe operation.

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;

/// One locally-downloaded model as enumerated by the backend.
#[derive(Debug, Clone)]
pub struct DownloadedModel {
    pub id: String,
    pub path: String,
    pub size_bytes: Option<u64>,
    pub ctx_in: u64,
    pub ctx_out: Option<u64>,
    pub has_tools: bool,
    pub has_vision: bool,
}

/// Result of one probe: load at `ctx_size`, run one bounded completion,
/// unload. Exactly one of these variants is returned — never an `Err`, since
/// every outcome here is a strategy input the tester classifies, not an
/// exceptional condition.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    LoadFailed {
        error_kind: ErrorKind,
        detail: String,
    },
    InferenceFailed {
        error_kind: ErrorKind,
        detail: String,
        load_duration: Duration,
    },
    /// The inference timeout expired with no tokens emitted.
    InferenceHung { load_duration: Duration },
    Success {
        response_text: String,
        total_duration: Duration,
    },
}

impl ProbeOutcome {
    /// The response excerpt the journal stores, capped to keep entries small.
    pub fn response_excerpt(&self) -> Option<String> {
        match self {
            Self::Success { response_text, .. } => {
                Some(response_text.chars().take(200).collect())
            }
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::LoadFailed { error_kind, .. } => Some(*error_kind),
            Self::InferenceFailed { error_kind, .. } => Some(*error_kind),
            Self::InferenceHung { .. } => Some(ErrorKind::InferenceTimeout),
            Self::Success { .. } => None,
        }
    }

    pub fn error_detail(&self) -> Option<String> {
        match self {
            Self::LoadFailed { detail, .. } => Some(detail.clone()),
            Self::InferenceFailed { detail, .. } => Some(detail.clone()),
            _ => None,
        }
    }

    pub fn load_ok(&self) -> bool {
        !matches!(self, Self::LoadFailed { .. })
    }

    pub fn inference_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn total_duration(&self) -> Duration {
        match self {
            Self::LoadFailed { .. } => Duration::ZERO,
            Self::InferenceFailed { load_duration, .. } => *load_duration,
            Self::InferenceHung { load_duration } => *load_duration,
            Self::Success { total_duration, .. } => *total_duration,
        }
    }
}

/// A probe's fixed trivial prompt and its bounded generation length.
pub const PROBE_PROMPT: &str = "Say hello";
pub const PROBE_MAX_TOKENS: u32 = 32;

/// The literal substring that distinguishes semantic-good from
/// semantic-bad.
pub fn is_semantic_good(response_text: &str) -> bool {
    response_text.to_lowercase().contains("hello")
}

/// Hides all backend-specific detail behind one probe operation. The
/// Backend Adapter contract requires that a probe *always* unloads before
/// returning, on every error and cancellation path — implementations
/// achieve this with a drop guard around the loaded handle, not by trusting
/// every early-return branch to remember to unload.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Enumerate locally available models.
    async fn list_downloaded_models(&self) -> Result<Vec<DownloadedModel>, crate::error::LmsError>;

    /// Load `model_id` at `ctx_size`, run one completion of `probe_prompt`,
    /// unload — always, regardless of outcome or cancellation. `load_timeout`
    /// and `inference_timeout` are independent and both strictly positive.
    async fn probe(
        &self,
        model_id: &str,
        ctx_size: u64,
        probe_prompt: &str,
        load_timeout: Duration,
        inference_timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeOutcome;
}

pub mod fake {
    //! A deterministic, scriptable [`Backend`] double — the in-memory
    //! stand-in for the real HTTP server, used across the tester and fleet
    //! test suites. Grounded on the sibling workspace's `ScriptedMockProvider`
    //! pattern: a provider trait with a hand-rolled deterministic double,
    //! rather than a mocking-framework macro.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// What the fake should return for a probe at a given size.
    #[derive(Debug, Clone)]
    pub enum ScriptedOutcome {
        Good,
        SemanticBad,
        BadLoad,
        BadInfer,
        Hung,
    }

    pub struct FakeBackend {
        models: Vec<DownloadedModel>,
        /// Default outcome for sizes with no explicit rule.
        default: ScriptedOutcome,
        /// `good_at_or_below`: every size <= this is GOOD, every size above
        /// it is `above` (used for scenario 2, "a model that lies").
        threshold_rule: Option<(u64, ScriptedOutcome)>,
        overrides: HashMap<u64, ScriptedOutcome>,
        pub probe_log: Mutex<Vec<u64>>,
    }

    impl FakeBackend {
        pub fn always(outcome: ScriptedOutcome) -> Self {
            Self {
                models: Vec::new(),
                default: outcome,
                threshold_rule: None,
                overrides: HashMap::new(),
                probe_log: Mutex::new(Vec::new()),
            }
        }

        /// GOOD for every size <= `good_at_or_below`, `above` otherwise.
        pub fn good_up_to(good_at_or_below: u64, above: ScriptedOutcome) -> Self {
            Self {
                models: Vec::new(),
                default: ScriptedOutcome::Good,
                threshold_rule: Some((good_at_or_below, above)),
                overrides: HashMap::new(),
                probe_log: Mutex::new(Vec::new()),
            }
        }

        pub fn with_models(mut self, models: Vec<DownloadedModel>) -> Self {
            self.models = models;
            self
        }

        pub fn with_override(mut self, size: u64, outcome: ScriptedOutcome) -> Self {
            self.overrides.insert(size, outcome);
            self
        }

        pub fn probed_sizes(&self) -> Vec<u64> {
            self.probe_log.lock().unwrap().clone()
        }

        fn outcome_for(&self, size: u64) -> ScriptedOutcome {
            if let Some(o) = self.overrides.get(&size) {
                return o.clone();
            }
            if let Some((limit, ref above)) = self.threshold_rule {
                return if size <= limit {
                    ScriptedOutcome::Good
                } else {
                    above.clone()
                };
            }
            self.default.clone()
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn list_downloaded_models(
            &self,
        ) -> Result<Vec<DownloadedModel>, crate::error::LmsError> {
            Ok(self.models.clone())
        }

        async fn probe(
            &self,
            _model_id: &str,
            ctx_size: u64,
            _probe_prompt: &str,
            _load_timeout: Duration,
            _inference_timeout: Duration,
            _cancel: &CancellationToken,
        ) -> ProbeOutcome {
            self.probe_log.lock().unwrap().push(ctx_size);
            match self.outcome_for(ctx_size) {
                ScriptedOutcome::Good => ProbeOutcome::Success {
                    response_text: "hello there".to_string(),
                    total_duration: Duration::from_millis(10),
                },
                ScriptedOutcome::SemanticBad => ProbeOutcome::Success {
                    response_text: "42".to_string(),
                    total_duration: Duration::from_millis(10),
                },
                ScriptedOutcome::BadLoad => ProbeOutcome::LoadFailed {
                    error_kind: ErrorKind::OutOfMemory,
                    detail: "scripted load failure".to_string(),
                },
                ScriptedOutcome::BadInfer => ProbeOutcome::InferenceFailed {
                    error_kind: ErrorKind::InferenceError,
                    detail: "scripted inference failure".to_string(),
                    load_duration: Duration::from_millis(5),
                },
                ScriptedOutcome::Hung => ProbeOutcome::InferenceHung {
                    load_duration: Duration::from_millis(5),
                },
            }
        }
    }
}
