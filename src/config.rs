//! Environment-sourced configuration for the backend connection and the
//! default strategy constants, read once at process start.

use std::env;

use crate::tester::TestOptions;

fn default_registry_path() -> String {
    let base = env::var("XDG_DATA_HOME")
        .or_else(|_| env::var("HOME").map(|h| format!("{h}/.local/share")))
        .unwrap_or_else(|_| ".".to_string());
    format!("{base}/lmstrix/registry.json")
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub struct Config {
    pub base_url: String,
    pub api_key: Option<String>,
    pub registry_path: String,
    pub threshold: u64,
    pub min_probe: u64,
    pub step: u64,
    pub convergence: u64,
    pub max_iterations: u32,
}

impl Config {
    pub fn from_env() -> Self {
        let api_key = env::var("LMSTRIX_API_KEY").ok();
        if api_key.is_none() {
            tracing::debug!("LMSTRIX_API_KEY not set — assuming an unauthenticated local server");
        }

        Self {
            base_url: env::var("LMSTRIX_BASE_URL").unwrap_or_else(|_| "http://localhost:1234".to_string()),
            api_key,
            registry_path: env::var("LMSTRIX_REGISTRY_PATH").unwrap_or_else(|_| default_registry_path()),
            threshold: env_u64("LMSTRIX_THRESHOLD", 102_400),
            min_probe: env_u64("LMSTRIX_MIN_PROBE", 1_024),
            step: env_u64("LMSTRIX_STEP", 10_240),
            convergence: env_u64("LMSTRIX_CONVERGENCE", 256),
            max_iterations: env_u32("LMSTRIX_MAX_ITERATIONS", 25),
        }
    }

    /// The strategy defaults this configuration implies, with `target`/`reset`
    /// left for the caller to fill in per invocation.
    pub fn test_options(&self) -> TestOptions {
        TestOptions {
            threshold: self.threshold,
            min_probe: self.min_probe,
            step: self.step,
            convergence: self.convergence,
            max_iterations: self.max_iterations,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        // Clear the vars this test cares about so a polluted environment
        // can't make it flaky.
        for key in [
            "LMSTRIX_BASE_URL",
            "LMSTRIX_API_KEY",
            "LMSTRIX_REGISTRY_PATH",
            "LMSTRIX_THRESHOLD",
            "LMSTRIX_MIN_PROBE",
            "LMSTRIX_STEP",
            "LMSTRIX_CONVERGENCE",
            "LMSTRIX_MAX_ITERATIONS",
        ] {
            unsafe { env::remove_var(key) };
        }
        let config = Config::from_env();
        assert_eq!(config.base_url, "http://localhost:1234");
        assert_eq!(config.threshold, 102_400);
        assert_eq!(config.min_probe, 1_024);
        assert_eq!(config.step, 10_240);
        assert_eq!(config.convergence, 256);
        assert_eq!(config.max_iterations, 25);
    }
}
