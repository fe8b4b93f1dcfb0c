//! Adaptive context tester for locally-hosted language models: empirically
//! discovers the largest context size at which a model both loads and
//! responds sensibly, by probing a running inference server.

pub mod backend;
pub mod config;
pub mod error;
pub mod fleet;
pub mod journal;
pub mod registry;
pub mod tester;

use tokio_util::sync::CancellationToken;

use backend::{Backend, DownloadedModel};
use error::LmsError;
use fleet::Fleet;
use registry::{ModelRecord, Registry};
use tester::{TestOptions, Tester};

/// The four operations this crate exposes to any outer shell: a CLI, a batch
/// script, or a library user embedding the tester directly.
pub struct Toolkit<B: Backend> {
    backend: B,
    registry: Registry,
}

impl<B: Backend> Toolkit<B> {
    pub async fn open(backend: B, registry_path: impl Into<std::path::PathBuf>) -> Result<Self, LmsError> {
        let registry = Registry::load(registry_path).await?;
        Ok(Self { backend, registry })
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Synchronize the registry to the backend's current download set.
    /// Existing test state is preserved on matching `path`; scanning never
    /// clears a tested model's bounds or status.
    pub async fn scan(&mut self) -> Result<usize, LmsError> {
        let downloaded = self.backend.list_downloaded_models().await?;
        let mut merged: Vec<ModelRecord> = Vec::with_capacity(downloaded.len());

        for model in &downloaded {
            match self.registry.get(&model.path)? {
                Some(existing) => merged.push(merge_scanned(existing.clone(), model)),
                None => merged.push(fresh_record(model)),
            }
        }

        let n = merged.len();
        self.registry.replace_all(merged).await?;
        Ok(n)
    }

    pub fn list(&self) -> Vec<ModelRecord> {
        self.registry.list()
    }

    pub async fn test_one(
        &mut self,
        identifier: &str,
        options: &TestOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelRecord, LmsError> {
        let tester = Tester::new(&self.backend);
        tester.test_one(&mut self.registry, identifier, options, cancel).await
    }

    pub async fn test_fleet(
        &mut self,
        options: &TestOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModelRecord>, LmsError> {
        let fleet = Fleet::new(&self.backend);
        fleet.test_fleet(&mut self.registry, options, cancel).await
    }
}

/// A scanned model already known to the registry: carry over every test-state
/// field, refresh only what the backend itself reports.
fn merge_scanned(mut existing: ModelRecord, scanned: &DownloadedModel) -> ModelRecord {
    existing.id = scanned.id.clone();
    existing.size_bytes = scanned.size_bytes;
    existing.has_tools = scanned.has_tools;
    existing.has_vision = scanned.has_vision;
    existing.ctx_in_declared = scanned.ctx_in;
    existing.ctx_out_default = scanned.ctx_out;
    existing
}

fn fresh_record(scanned: &DownloadedModel) -> ModelRecord {
    ModelRecord::new(
        scanned.id.clone(),
        scanned.path.clone(),
        scanned.ctx_in,
        scanned.ctx_out,
        scanned.size_bytes,
        scanned.has_tools,
        scanned.has_vision,
    )
}
