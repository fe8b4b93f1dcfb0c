//! The shipped [`Backend`]: an HTTP client against an LM-Studio-shaped,
//! OpenAI-compatible local inference server. Built once, per-call
//! timeouts via `tokio::time::timeout`, no SSE — streaming is out of scope.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{Backend, DownloadedModel, ProbeOutcome};
use crate::error::{ErrorKind, LmsError};

/// Delay inserted on both sides of load/unload between adjacent probes, to
/// avoid rapid-cycle connection resets against the backend.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct ListModelsResponse {
    data: Vec<ListedModel>,
}

#[derive(Deserialize)]
struct ListedModel {
    id: String,
    path: String,
    #[serde(default)]
    size_bytes: Option<u64>,
    #[serde(default)]
    ctx_in: u64,
    #[serde(default)]
    ctx_out: Option<u64>,
    #[serde(default)]
    has_tools: bool,
    #[serde(default)]
    has_vision: bool,
}

#[derive(Deserialize)]
struct LoadResponse {
    handle: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    response_text: String,
    #[serde(default)]
    #[allow(dead_code)]
    stop_reason: Option<String>,
}

/// A handle is unloaded when dropped if it hasn't been explicitly released,
/// so every early return still triggers best-effort unload.
struct UnloadGuard<'a> {
    backend: &'a HttpBackend,
    handle: Option<String>,
}

impl<'a> UnloadGuard<'a> {
    fn new(backend: &'a HttpBackend, handle: String) -> Self {
        Self {
            backend,
            handle: Some(handle),
        }
    }

    /// Take the handle so `Drop` won't double-unload after an explicit call.
    fn take(&mut self) -> Option<String> {
        self.handle.take()
    }
}

impl Drop for UnloadGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let client = self.backend.client.clone();
            let base_url = self.backend.base_url.clone();
            let api_key = self.backend.api_key.clone();
            // Best-effort: the guard fires during unwind/early-return paths
            // where we can't `.await`, so the unload request is fire-and-forget.
            tokio::spawn(async move {
                let _ = send_unload(&client, &base_url, api_key.as_deref(), &handle).await;
            });
        }
    }
}

async fn send_unload(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    handle: &str,
) -> Result<(), LmsError> {
    let mut req = client.post(format!("{base_url}/v1/unload"));
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }
    req.json(&serde_json::json!({ "handle": handle }))
        .send()
        .await?;
    Ok(())
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    settle_delay: Duration,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client for backend adapter");
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_downloaded_models(&self) -> Result<Vec<DownloadedModel>, LmsError> {
        let resp = self
            .authed(self.client.get(format!("{}/v1/models/downloaded", self.base_url)))
            .send()
            .await?;
        let parsed: ListModelsResponse = resp.json().await?;
        Ok(parsed
            .data
            .into_iter()
            .map(|m| DownloadedModel {
                id: m.id,
                path: m.path,
                size_bytes: m.size_bytes,
                ctx_in: m.ctx_in,
                ctx_out: m.ctx_out,
                has_tools: m.has_tools,
                has_vision: m.has_vision,
            })
            .collect())
    }

    async fn probe(
        &self,
        model_id: &str,
        ctx_size: u64,
        probe_prompt: &str,
        load_timeout: Duration,
        inference_timeout: Duration,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        let start = Instant::now();

        if cancel.is_cancelled() {
            return ProbeOutcome::LoadFailed {
                error_kind: ErrorKind::LoadError,
                detail: "cancelled before load".to_string(),
            };
        }

        tokio::time::sleep(self.settle_delay).await;

        let load_req = self
            .authed(self.client.post(format!("{}/v1/models/load", self.base_url)))
            .json(&serde_json::json!({
                "model_id": model_id,
                "context_length": ctx_size,
            }))
            .send();

        let load_result = tokio::select! {
            r = tokio::time::timeout(load_timeout, load_req) => r,
            _ = cancel.cancelled() => {
                return ProbeOutcome::LoadFailed {
                    error_kind: ErrorKind::LoadError,
                    detail: "cancelled during load".to_string(),
                };
            }
        };

        let load_resp = match load_result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                return ProbeOutcome::LoadFailed {
                    error_kind: classify_load_error(&e),
                    detail: e.to_string(),
                };
            }
            Err(_) => {
                return ProbeOutcome::LoadFailed {
                    error_kind: ErrorKind::LoadError,
                    detail: format!("load timed out after {:?}", load_timeout),
                };
            }
        };

        if load_resp.status() == reqwest::StatusCode::NOT_FOUND {
            return ProbeOutcome::LoadFailed {
                error_kind: ErrorKind::NotFound,
                detail: format!("model {model_id} not found"),
            };
        }
        if load_resp.status() == reqwest::StatusCode::INSUFFICIENT_STORAGE
            || load_resp.status() == reqwest::StatusCode::PAYLOAD_TOO_LARGE
        {
            return ProbeOutcome::LoadFailed {
                error_kind: ErrorKind::OutOfMemory,
                detail: format!("HTTP {} loading at ctx={ctx_size}", load_resp.status()),
            };
        }
        if !load_resp.status().is_success() {
            return ProbeOutcome::LoadFailed {
                error_kind: ErrorKind::LoadError,
                detail: format!("HTTP {} loading at ctx={ctx_size}", load_resp.status()),
            };
        }

        let load_duration = start.elapsed();
        let loaded: LoadResponse = match load_resp.json().await {
            Ok(v) => v,
            Err(e) => {
                return ProbeOutcome::LoadFailed {
                    error_kind: ErrorKind::LoadError,
                    detail: format!("malformed load response: {e}"),
                };
            }
        };

        let mut guard = UnloadGuard::new(self, loaded.handle.clone());

        let completion_req = self
            .authed(self.client.post(format!("{}/v1/completions", self.base_url)))
            .json(&serde_json::json!({
                "handle": loaded.handle,
                "prompt": probe_prompt,
                "max_tokens": super::PROBE_MAX_TOKENS,
                "temperature": 0.0,
            }))
            .send();

        let completion_result = tokio::select! {
            r = tokio::time::timeout(inference_timeout, completion_req) => r,
            _ = cancel.cancelled() => {
                let handle = guard.take().unwrap();
                let _ = send_unload(&self.client, &self.base_url, self.api_key.as_deref(), &handle).await;
                return ProbeOutcome::InferenceFailed {
                    error_kind: ErrorKind::InferenceError,
                    detail: "cancelled during inference".to_string(),
                    load_duration,
                };
            }
        };

        let outcome = match completion_result {
            Err(_) => ProbeOutcome::InferenceHung { load_duration },
            Ok(Err(e)) => ProbeOutcome::InferenceFailed {
                error_kind: classify_connection_error(&e),
                detail: e.to_string(),
                load_duration,
            },
            Ok(Ok(resp)) if !resp.status().is_success() => ProbeOutcome::InferenceFailed {
                error_kind: ErrorKind::InferenceError,
                detail: format!("HTTP {}", resp.status()),
                load_duration,
            },
            Ok(Ok(resp)) => match resp.json::<CompletionResponse>().await {
                Ok(parsed) => ProbeOutcome::Success {
                    response_text: parsed.response_text,
                    total_duration: start.elapsed(),
                },
                Err(e) => ProbeOutcome::InferenceFailed {
                    error_kind: ErrorKind::InferenceError,
                    detail: format!("malformed completion response: {e}"),
                    load_duration,
                },
            },
        };

        // Explicit unload on the happy path; the guard is now a no-op on drop.
        if let Some(handle) = guard.take() {
            tokio::time::sleep(self.settle_delay).await;
            if let Err(e) = send_unload(&self.client, &self.base_url, self.api_key.as_deref(), &handle).await {
                tracing::warn!(model_id, "unload_error: {e}");
            }
        }

        outcome
    }
}

fn classify_load_error(e: &reqwest::Error) -> ErrorKind {
    if e.is_connect() {
        ErrorKind::ConnectionError
    } else {
        ErrorKind::LoadError
    }
}

fn classify_connection_error(e: &reqwest::Error) -> ErrorKind {
    if e.is_timeout() {
        ErrorKind::InferenceTimeout
    } else if e.is_connect() {
        ErrorKind::ConnectionError
    } else {
        ErrorKind::InferenceError
    }
}
