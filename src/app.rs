//! Application context shared by every command.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Runtime;

use crate::backend::{Backends, SharedCorpus, build_backends};
use crate::cli::Cli;
use crate::config::Config;
use crate::error::Result;
use crate::pipeline::{Orchestrator, PipelineEvent};
use crate::storage::Store;
use crate::views::SavedViews;

pub struct AppContext {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config: Config,
    pub db: Arc<Store>,
    pub backends: Backends,
    /// Corpus snapshot shared by the orchestrator and saved views.
    pub corpus: Arc<SharedCorpus>,
    pub runtime: Runtime,
    pub robot_mode: bool,
    pub verbosity: u8,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("data_dir", &self.data_dir)
            .field("db_path", &self.db_path)
            .field("robot_mode", &self.robot_mode)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let data_dir = match &cli.data_dir {
            Some(dir) => dir.clone(),
            None => Config::default_data_dir()?,
        };
        std::fs::create_dir_all(&data_dir)?;

        let config = Config::load(cli.config.as_deref(), &data_dir)?;
        let db_path = cli
            .db
            .clone()
            .unwrap_or_else(|| config.db_path(&data_dir));
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Arc::new(Store::open(&db_path, config.storage.read_pool_size as usize)?);
        let backends = build_backends(&config.backend, Arc::clone(&db))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("ferret-worker")
            .build()?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            db = %db_path.display(),
            "context ready"
        );

        Ok(Self {
            data_dir,
            db_path,
            config,
            db,
            backends,
            corpus: Arc::new(SharedCorpus::new()),
            runtime,
            robot_mode: cli.robot,
            verbosity: cli.verbose,
        })
    }

    /// Fresh orchestrator bound to this context's runtime.
    pub fn orchestrator(
        &self,
    ) -> (Orchestrator, tokio::sync::mpsc::UnboundedReceiver<PipelineEvent>) {
        Orchestrator::new(
            Arc::clone(&self.db),
            self.backends.clone(),
            Arc::clone(&self.corpus),
            &self.config,
            self.runtime.handle().clone(),
        )
    }

    pub fn saved_views(&self) -> Arc<SavedViews> {
        Arc::new(SavedViews::new(
            Arc::clone(&self.db),
            self.backends.clone(),
            Arc::clone(&self.corpus),
            &self.config,
        ))
    }
}
