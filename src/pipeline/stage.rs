//! Pipeline stage trait and runner
//!
//! Defines the interface for pipeline stages and a small runner that spawns
//! them, one task each, and reports how they exit.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::task::JoinSet;

/// Trait for pipeline stages that process media data
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Run the stage, processing data until its input closes or it is cancelled
    async fn run(&mut self) -> Result<()>;

    /// Get the name of this stage for logging
    fn name(&self) -> &'static str;

    /// Gracefully shutdown the stage
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// How a spawned stage ended
#[derive(Debug)]
pub struct StageExit {
    pub name: &'static str,
    pub result: Result<()>,
}

/// Owns the tasks of one running pipeline
pub struct StageRunner {
    tasks: JoinSet<StageExit>,
}

impl StageRunner {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
        }
    }

    /// Spawn a stage on its own task
    pub fn spawn(&mut self, mut stage: Box<dyn PipelineStage>) {
        let name = stage.name();
        debug!("StageRunner: spawning {}", name);
        self.tasks.spawn(async move {
            let mut result = stage.run().await;
            if let Err(e) = stage.shutdown().await {
                warn!("{}: shutdown failed: {}", name, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
            StageExit { name, result }
        });
    }

    /// Number of stages still running
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for the next stage to exit; `None` once all have
    pub async fn next_exit(&mut self) -> Option<StageExit> {
        loop {
            match self.tasks.join_next().await? {
                Ok(exit) => return Some(exit),
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    return Some(StageExit {
                        name: "unknown",
                        result: Err(anyhow::anyhow!("stage task panicked: {}", e)),
                    });
                }
            }
        }
    }

    /// Wait for every remaining stage, returning the first failure
    pub async fn join_all(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(exit) = self.next_exit().await {
            if let Err(e) = exit.result {
                warn!("{}: exited with error: {:#}", exit.name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }
}

impl Default for StageRunner {
    fn default() -> Self {
        Self::new()
    }
}
