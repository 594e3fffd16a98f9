use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};

use super::stage_worker::{PollOutcome, StageWorker};
use crate::error::WorkerError;
use crate::pipeline::stage::Stage;
use crate::queue::StageMessage;

/// A named set of threads that all run the same [`StageWorker`].
pub struct WorkerGroup {
    pub name: String,
    pub worker: Arc<StageWorker>,
    pub threads: usize,
}

/// One processed message, as reported back by a pool thread.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub group: String,
    pub thread_id: usize,
    pub document_id: String,
    pub generation_id: String,
    pub stage: Stage,
    pub outcome: PollOutcome,
}

pub struct WorkerPool {
    report_receiver: Receiver<WorkerReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Starts one OS thread per slot of every group. Each thread polls its
    /// queues and sleeps for `poll_interval` whenever they are empty.
    pub fn start(groups: Vec<WorkerGroup>, poll_interval: Duration) -> Result<Self, WorkerError> {
        let (report_sender, report_receiver) = unbounded::<WorkerReport>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        for group in groups {
            for thread_id in 0..group.threads.max(1) {
                let worker = Arc::clone(&group.worker);
                let report_tx = report_sender.clone();
                let shutdown_flag = Arc::clone(&shutdown);
                let name = group.name.clone();

                let handle = thread::Builder::new()
                    .name(format!("{}-{}", group.name, thread_id))
                    .spawn(move || {
                        run_worker(&name, thread_id, &worker, &report_tx, &shutdown_flag, poll_interval)
                    })
                    .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
                workers.push(handle);
            }
            info!(
                "Started {} {} worker(s) for {:?}",
                group.threads.max(1),
                group.name,
                group.worker.stages()
            );
        }

        Ok(Self {
            report_receiver,
            workers,
            shutdown,
        })
    }

    pub fn try_recv_report(&self) -> Option<WorkerReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Result<Option<WorkerReport>, WorkerError> {
        match self.report_receiver.recv_timeout(timeout) {
            Ok(report) => Ok(Some(report)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(WorkerError::ChannelClosed),
        }
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every thread to finish its current message and exit.
    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        info!("All workers have stopped");
    }
}

fn run_worker(
    group: &str,
    thread_id: usize,
    worker: &StageWorker,
    report_sender: &Sender<WorkerReport>,
    shutdown: &AtomicBool,
    poll_interval: Duration,
) {
    debug!("{} worker {} started", group, thread_id);

    while !shutdown.load(Ordering::Relaxed) {
        match worker.poll_once() {
            Ok((Some(message), outcome)) => {
                let StageMessage {
                    document_id,
                    generation_id,
                    stage,
                    ..
                } = message;
                let report = WorkerReport {
                    group: group.to_string(),
                    thread_id,
                    document_id,
                    generation_id,
                    stage,
                    outcome,
                };
                if report_sender.send(report).is_err() {
                    debug!("{} worker {} report channel closed", group, thread_id);
                }
            }
            Ok((None, _)) => thread::sleep(poll_interval),
            Err(e) => {
                error!("{} worker {} could not poll its queues: {}", group, thread_id, e);
                thread::sleep(poll_interval);
            }
        }
    }

    debug!("{} worker {} stopped", group, thread_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::pipeline::coordinator::{Advance, Coordinator, CoordinatorSettings};
    use crate::pipeline::events::PipelineEventBroadcaster;
    use crate::queue::sqlite::QueueSettings;
    use crate::queue::SqliteQueue;
    use crate::stages::StageHandler;
    use crate::worker::stage_worker::WorkerSettings;

    struct Echo(Stage);

    impl StageHandler for Echo {
        fn stage(&self) -> Stage {
            self.0
        }

        fn handle(&self, message: &StageMessage) -> crate::error::Result<String> {
            Ok(format!("{}:{}", message.stage, message.document_id))
        }
    }

    fn coordinator() -> Arc<Coordinator> {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(SqliteQueue::new(db.clone(), QueueSettings::default()));
        Arc::new(Coordinator::new(
            db,
            queue,
            PipelineEventBroadcaster::default(),
            Duration::from_secs(60),
            CoordinatorSettings::default(),
        ))
    }

    #[test]
    fn test_worker_pool_start_and_shutdown() {
        let worker = Arc::new(StageWorker::new(coordinator(), vec![], WorkerSettings::default()));
        let pool = WorkerPool::start(
            vec![WorkerGroup {
                name: "idle".to_string(),
                worker,
                threads: 2,
            }],
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(pool.thread_count(), 2);
        assert!(!pool.is_shutdown());

        pool.shutdown();
        assert!(pool.is_shutdown());
        pool.wait();
    }

    #[test]
    fn test_pool_runs_document_through_all_stages() {
        let coordinator = coordinator();
        coordinator.submit("doc-1", "uploads/doc-1.txt", "ops").unwrap();

        let handlers: Vec<Arc<dyn StageHandler>> = Stage::ORDER
            .iter()
            .map(|s| Arc::new(Echo(*s)) as Arc<dyn StageHandler>)
            .collect();
        let worker = Arc::new(StageWorker::new(
            coordinator.clone(),
            handlers,
            WorkerSettings::default(),
        ));
        let pool = WorkerPool::start(
            vec![WorkerGroup {
                name: "all".to_string(),
                worker,
                threads: 2,
            }],
            Duration::from_millis(5),
        )
        .unwrap();

        let mut finished = false;
        for _ in 0..200 {
            match pool.recv_report_timeout(Duration::from_millis(50)).unwrap() {
                Some(report) if report.outcome == PollOutcome::Completed(Advance::Finished) => {
                    finished = true;
                    break;
                }
                _ => {}
            }
        }
        pool.wait();

        assert!(finished);
        let status = coordinator.status("doc-1").unwrap();
        assert_eq!(status.stage.as_str(), "completed");
    }
}
