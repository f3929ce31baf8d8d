//! # Processor Bootstrap
//!
//! Builds every configured trigger from the registries and drives their
//! lifecycle as a unit. Construction is all-or-nothing: an unknown kind, bad
//! attributes or a failed factory aborts the whole bootstrap so the process
//! never runs with a partial set of triggers.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::config::ProcessorConfig;
use crate::error::{DispatchError, Result};
use crate::logging::{log_error, log_source_operation};
use crate::registry::Registries;
use crate::source::{Checkpoint, EventSource};
use crate::statistics::{SourceStatisticsSnapshot, WorkerStatisticsSnapshot};
use crate::worker::WorkerFactory;

/// Counters of every source and its workers, keyed by trigger ID
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessorStatistics {
    pub sources: BTreeMap<String, SourceStatisticsSnapshot>,
    pub workers: BTreeMap<String, Vec<WorkerStatisticsSnapshot>>,
}

impl ProcessorStatistics {
    /// Per-source change since `previous`; sources missing from `previous`
    /// are reported in full
    pub fn diff(&self, previous: &Self) -> BTreeMap<String, SourceStatisticsSnapshot> {
        self.sources
            .iter()
            .map(|(id, current)| {
                let delta = previous
                    .sources
                    .get(id)
                    .map(|before| current.diff(before))
                    .unwrap_or(*current);
                (id.clone(), delta)
            })
            .collect()
    }
}

pub struct Processor {
    sources: BTreeMap<String, Arc<dyn EventSource>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl Processor {
    #[instrument(skip_all, fields(runtime = %config.runtime.kind, triggers = config.triggers.len()))]
    pub fn new(config: &ProcessorConfig, registries: &Registries) -> Result<Self> {
        config.validate()?;

        let runtime_factory = registries.runtimes.get(&config.runtime.kind)?;
        let worker_factory = WorkerFactory::new(runtime_factory, config.runtime.clone());

        let mut sources = BTreeMap::new();
        for (id, trigger) in &config.triggers {
            let factory = registries.sources.get(&trigger.kind)?;
            let source = factory.create(id, trigger, &worker_factory).map_err(|e| {
                log_error("processor", "create_source", &e.to_string(), Some(id));
                e
            })?;

            info!(
                source_id = %id,
                kind = %trigger.kind,
                class = %source.class(),
                workers = source.workers().len(),
                "Created event source"
            );
            sources.insert(id.clone(), source);
        }

        Ok(Self {
            sources,
            running: AtomicBool::new(false),
        })
    }

    pub fn sources(&self) -> impl Iterator<Item = (&String, &Arc<dyn EventSource>)> {
        self.sources.iter()
    }

    pub fn source(&self, id: &str) -> Option<&Arc<dyn EventSource>> {
        self.sources.get(id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start every source from a cold start
    pub async fn start(&self) -> Result<()> {
        self.start_from(&BTreeMap::new()).await
    }

    /// Start every source, resuming those with a checkpoint in `checkpoints`.
    /// If any source fails to start, the ones already started are stopped.
    pub async fn start_from(&self, checkpoints: &BTreeMap<String, Checkpoint>) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DispatchError::InvalidState(
                "Processor is already running".to_string(),
            ));
        }

        let mut started: Vec<&Arc<dyn EventSource>> = Vec::new();
        for (id, source) in &self.sources {
            let checkpoint = checkpoints.get(id).cloned().unwrap_or_default();
            if let Err(e) = source.start(checkpoint).await {
                error!(source_id = %id, error = %e, "Failed to start event source");
                for source in started {
                    if let Err(stop_error) = source.stop(true).await {
                        error!(source_id = %source.id(), error = %stop_error, "Failed to stop event source");
                    }
                }
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
            started.push(source);
        }

        info!(sources = self.sources.len(), "Processor started");
        Ok(())
    }

    /// Stop every source and collect the checkpoints to resume from
    pub async fn stop(&self, force: bool) -> Result<BTreeMap<String, Checkpoint>> {
        self.running.store(false, Ordering::Release);

        let mut checkpoints = BTreeMap::new();
        let mut first_error = None;

        for (id, source) in &self.sources {
            match source.stop(force).await {
                Ok(checkpoint) => {
                    checkpoints.insert(id.clone(), checkpoint);
                }
                Err(e) => {
                    log_source_operation("stop", id, source.kind(), "failed", Some(&e.to_string()));
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(sources = checkpoints.len(), force = force, "Processor stopped");
                Ok(checkpoints)
            }
        }
    }

    pub fn statistics(&self) -> ProcessorStatistics {
        let mut statistics = ProcessorStatistics::default();
        for (id, source) in &self.sources {
            statistics.sources.insert(id.clone(), source.statistics());
            statistics.workers.insert(
                id.clone(),
                source.workers().iter().map(|w| w.statistics()).collect(),
            );
        }
        statistics
    }
}
