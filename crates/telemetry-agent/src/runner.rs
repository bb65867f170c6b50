//! Collection cycles driven from loaded configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use telemetry_core::{
    process_event, CollectionOutput, Collector, CollectorConfig, Context, Declaration,
    EndpointLoader, StopSignal,
};

use crate::config::load_context;
use crate::error::AgentResult;
use crate::fixtures::FixtureLoader;

/// Output of one cycle as printed by the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub output: CollectionOutput,
}

pub struct Agent {
    collector: Collector,
    declaration: Declaration,
    context: Context,
}

impl Agent {
    pub fn new(
        loader: Arc<dyn EndpointLoader>,
        config: CollectorConfig,
        declaration: Declaration,
        context: Context,
    ) -> Self {
        Self {
            collector: Collector::new(loader, config),
            declaration,
            context,
        }
    }

    /// Build an agent that serves endpoints from `fixtures_dir`.
    pub fn from_paths(
        declaration_path: &Path,
        fixtures_dir: &Path,
        context_path: Option<&Path>,
        config: CollectorConfig,
    ) -> AgentResult<Self> {
        let declaration = Declaration::from_file(declaration_path)?;
        let context = load_context(context_path)?;
        tracing::info!(
            "loaded {} stats from {}, fixtures in {}",
            declaration.stats.len(),
            declaration_path.display(),
            fixtures_dir.display()
        );
        Ok(Self::new(
            Arc::new(FixtureLoader::new(fixtures_dir)),
            config,
            declaration,
            context,
        ))
    }

    pub fn declaration(&self) -> &Declaration {
        &self.declaration
    }

    pub fn stop_signal(&self) -> Arc<StopSignal> {
        self.collector.stop_signal()
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let cycle_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        tracing::debug!("cycle {cycle_id} starting");
        let output = self.collector.collect(&self.declaration, &self.context).await;
        CycleReport {
            cycle_id,
            started_at,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            output,
        }
    }

    /// Run a cycle every `interval` until a stop is requested. Returns the
    /// number of cycles run.
    pub async fn run_every<F>(&self, interval: Duration, mut on_report: F) -> usize
    where
        F: FnMut(&CycleReport),
    {
        let stop = self.stop_signal();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cycles = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    cycles += 1;
                    on_report(&report);
                    if stop.is_stopped() {
                        break;
                    }
                }
                _ = stop.stopped() => break,
            }
        }
        tracing::info!("stopped after {cycles} cycles");
        cycles
    }

    /// Apply the declaration's data actions to one event line.
    pub fn process_event(&self, line: &str) -> Value {
        process_event(line, &self.declaration.actions, &self.declaration.definitions)
    }
}
