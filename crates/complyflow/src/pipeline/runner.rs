//! Wires the database, queue, model invoker, coordinator and stage handlers
//! together from a [`Config`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::coordinator::{Advance, Coordinator, CoordinatorSettings};
use super::dead_letter::DeadLetterHandler;
use super::events::PipelineEventBroadcaster;
use super::stage::Stage;
use crate::config::Config;
use crate::db::Database;
use crate::error::{ConfigError, Result};
use crate::model::{
    CircuitBreaker, HttpTransport, HttpTransportSettings, InvokerSettings, ModelInvoker,
    ModelTransport, SchemaRegistry,
};
use crate::processor::ProcessorRegistry;
use crate::queue::sqlite::QueueSettings;
use crate::queue::{SqliteQueue, StageQueue};
use crate::retry::Backoff;
use crate::secrets;
use crate::stages::{Categorizer, Extractor, Planner, Reporter, StageContext, StageHandler};
use crate::storage::{FsObjectStore, ObjectStore};
use crate::worker::{PollOutcome, StageWorker, WorkerGroup, WorkerPool, WorkerSettings};

const EVENT_CAPACITY: usize = 1024;

/// Tally of one [`Pipeline::drain`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Messages received, whatever their outcome.
    pub processed: u64,
    /// Stage completions, duplicates excluded.
    pub completed: u64,
    /// Generations that reached the end of the pipeline.
    pub finished: u64,
    pub retried: u64,
    pub deferred: u64,
    pub failed: u64,
    pub coordinator_faults: u64,
    pub dead_lettered: u64,
    /// Whether the queues still held messages when the deadline passed.
    pub timed_out: bool,
}

impl DrainReport {
    fn record(&mut self, outcome: &PollOutcome) {
        self.processed += 1;
        match outcome {
            PollOutcome::Completed(advance) => {
                self.completed += 1;
                if *advance == Advance::Finished {
                    self.finished += 1;
                }
            }
            PollOutcome::Retrying { .. } => self.retried += 1,
            PollOutcome::Deferred(_) => self.deferred += 1,
            PollOutcome::Failed { .. } => self.failed += 1,
            PollOutcome::CoordinatorFault(_) => self.coordinator_faults += 1,
            PollOutcome::Idle | PollOutcome::Duplicate(_) | PollOutcome::Discarded => {}
        }
    }
}

pub struct Pipeline {
    config: Config,
    ctx: Arc<StageContext>,
    coordinator: Arc<Coordinator>,
    dead_letters: Arc<DeadLetterHandler>,
    reporter: Reporter,
}

impl Pipeline {
    /// Production constructor: opens the database, the object store and the
    /// HTTP model transport named by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let db = Database::open(&config.database_path())?;
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(config.storage_root()));

        let model = &config.model;
        let transport = HttpTransport::new(HttpTransportSettings {
            endpoint: model.endpoint.clone(),
            model_id: model.model_id.clone(),
            api_key: secrets::model_api_key(model)?,
            max_tokens: model.max_tokens,
            temperature: model.temperature,
            timeout: Duration::from_secs(model.timeout_secs),
        })
        .map_err(|e| ConfigError::Validation {
            message: format!("model transport: {}", e),
        })?;

        Self::with_parts(config, db, store, Arc::new(transport))
    }

    /// Builds the pipeline around caller-provided storage and transport.
    pub fn with_parts(
        config: Config,
        db: Database,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn ModelTransport>,
    ) -> Result<Self> {
        let model = &config.model;
        let schemas = SchemaRegistry::builtin().map_err(|message| ConfigError::Validation {
            message: format!("model response schemas: {}", message),
        })?;
        let invoker = ModelInvoker::new(
            transport,
            Arc::new(CircuitBreaker::new(
                model.breaker_threshold,
                Duration::from_secs(model.breaker_cooldown_secs),
            )),
            Arc::new(schemas),
            InvokerSettings {
                max_retries: model.max_retries,
                backoff: Backoff::new(
                    Duration::from_millis(model.base_delay_ms),
                    Duration::from_millis(model.max_delay_ms),
                ),
                max_total_wait: Duration::from_secs(model.max_total_wait_secs),
            },
        );

        let queue: Arc<dyn StageQueue> = Arc::new(SqliteQueue::new(
            db.clone(),
            QueueSettings {
                visibility_timeout: Duration::from_secs(config.queue.visibility_timeout_secs),
                max_receives: config.queue.max_receives,
            },
        ));
        let coordinator = Arc::new(Coordinator::new(
            db.clone(),
            queue,
            PipelineEventBroadcaster::new(EVENT_CAPACITY),
            config.workers.lease_timeout(),
            CoordinatorSettings {
                enqueue_attempts: config.coordinator.enqueue_attempts,
                enqueue_backoff: Duration::from_millis(config.coordinator.enqueue_backoff_ms),
            },
        ));
        let dead_letters = Arc::new(DeadLetterHandler::new(
            Arc::clone(&coordinator),
            config.queue.max_redrives,
        ));

        let ctx = Arc::new(StageContext {
            db,
            store,
            invoker: Arc::new(invoker),
            processors: ProcessorRegistry::new(),
            refine_tasks: config.planning.refine_with_model,
        });
        let reporter = Reporter::new(Arc::clone(&ctx));

        Ok(Self {
            config,
            ctx,
            coordinator,
            dead_letters,
            reporter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.ctx.db
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.ctx.store
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterHandler> {
        &self.dead_letters
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn events(&self) -> &PipelineEventBroadcaster {
        self.coordinator.events()
    }

    /// Stage-level retry budgets from the `retry` config section.
    pub fn worker_settings(&self) -> std::result::Result<WorkerSettings, ConfigError> {
        let retry = &self.config.retry;
        let mut stage_retry = HashMap::new();
        for (name, policy) in &retry.stages {
            let stage: Stage = name.parse().map_err(|e| ConfigError::Validation {
                message: format!("retry.stages: {}", e),
            })?;
            stage_retry.insert(stage, policy.policy());
        }
        Ok(WorkerSettings {
            default_retry: retry.default.policy(),
            stage_retry,
            defer_delay: self.config.workers.defer_delay(),
        })
    }

    fn worker(&self, handlers: Vec<Arc<dyn StageHandler>>) -> Result<Arc<StageWorker>> {
        Ok(Arc::new(StageWorker::new(
            Arc::clone(&self.coordinator),
            handlers,
            self.worker_settings()?,
        )))
    }

    /// Starts the long-running worker threads: extractors also serve the
    /// categorization queue, planners and reporters their own stage.
    pub fn start_workers(&self) -> Result<WorkerPool> {
        let workers = &self.config.workers;
        let ctx = &self.ctx;
        let groups = vec![
            WorkerGroup {
                name: "extractor".to_string(),
                worker: self.worker(vec![
                    Arc::new(Extractor::new(Arc::clone(ctx))),
                    Arc::new(Categorizer::new(Arc::clone(ctx))),
                ])?,
                threads: workers.extractor,
            },
            WorkerGroup {
                name: "planner".to_string(),
                worker: self.worker(vec![Arc::new(Planner::new(Arc::clone(ctx)))])?,
                threads: workers.planner,
            },
            WorkerGroup {
                name: "reporter".to_string(),
                worker: self.worker(vec![Arc::new(Reporter::new(Arc::clone(ctx)))])?,
                threads: workers.reporter,
            },
        ];
        Ok(WorkerPool::start(groups, workers.poll_interval())?)
    }

    /// Messages waiting or in flight across every stage queue.
    pub fn queue_depth(&self) -> Result<u64> {
        let queue = self.coordinator.queue();
        let mut total = 0;
        for stage in Stage::ORDER {
            total += queue.depth(stage)?;
        }
        Ok(total)
    }

    /// Processes messages on the calling thread until every queue is empty
    /// or `timeout` elapses. Delayed retries are waited for.
    pub fn drain(&self, timeout: Duration) -> Result<DrainReport> {
        let worker = self.worker(crate::stages::handlers(&self.ctx))?;
        let deadline = Instant::now() + timeout;
        let idle_wait = self.config.workers.poll_interval().min(Duration::from_millis(50));
        let mut report = DrainReport::default();

        loop {
            match worker.poll_once()? {
                (Some(_), outcome) => report.record(&outcome),
                (None, _) => {
                    if self.queue_depth()? == 0 {
                        break;
                    }
                    if Instant::now() >= deadline {
                        report.timed_out = true;
                        break;
                    }
                    std::thread::sleep(idle_wait);
                }
            }
            if Instant::now() >= deadline && self.queue_depth()? > 0 {
                report.timed_out = true;
                break;
            }
        }

        report.dead_lettered = self.dead_letters.announce_new()?.len() as u64;
        if report.timed_out {
            log::warn!("Drain stopped at its deadline with messages still queued: {:?}", report);
        } else {
            log::info!("Drain finished: {:?}", report);
        }
        Ok(report)
    }
}
