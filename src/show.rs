//! Running show: the stage plus one thread per chain.

use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::chain::{ChainRunner, ChainWorker};
use crate::config::ShowConfig;
use crate::output::open_output;
use crate::registry::EffectRegistry;
use crate::stage::{Stage, StageError};

#[derive(Error, Debug)]
pub enum ShowError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("Failed to start chain thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct Show {
    stage: Arc<Stage>,
    workers: Vec<ChainWorker>,
}

impl Show {
    /// Assembles `config` with real outputs and starts every chain.
    pub fn launch(config: &ShowConfig, registry: Arc<EffectRegistry>) -> Result<Self, ShowError> {
        let (stage, runners) = Stage::assemble(config, registry, |chain| open_output(&chain.output))?;
        Ok(Self::start(stage, runners)?)
    }

    /// Starts one thread per runner. If a thread cannot be spawned, the
    /// chains already started are stopped again and the outputs of the
    /// rest are closed as their runners drop.
    pub fn start(stage: Arc<Stage>, runners: Vec<ChainRunner>) -> std::io::Result<Self> {
        let mut workers = Vec::with_capacity(runners.len());
        for runner in runners {
            workers.push(runner.spawn()?);
        }
        info!(chains = workers.len(), "show started");
        Ok(Self { stage, workers })
    }

    pub fn stage(&self) -> &Arc<Stage> {
        &self.stage
    }

    /// Stops every chain and waits for its thread; outputs are closed by
    /// their chain threads on the way out.
    pub fn shutdown(mut self) {
        for worker in self.workers.iter_mut() {
            worker.stop();
        }
        info!(chains = self.workers.len(), "show stopped");
    }
}
