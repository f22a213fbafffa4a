//! Partitioned execution
//!
//! Records are routed by key to one of N partition workers. Each worker is a
//! dedicated thread that owns its [`PartitionProcessor`] and state database
//! and handles its queue strictly in order, so all records of a user are
//! processed sequentially while partitions run in parallel.

use chrono::Utc;
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::error::ProcessError;
use crate::pipeline::{Disposition, PartitionProcessor};
use crate::schema::LogRecord;
use crate::sink::EmissionSink;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable partition of `key` (32-bit FNV-1a)
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    let hash = key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash % partitions.max(1)
}

/// Per-partition counters returned at shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionReport {
    pub partition: u32,
    pub applied: u64,
    pub late: u64,
    pub dropped: u64,
    pub replayed: u64,
    /// Records received after the partition halted
    pub discarded: u64,
    /// Reason the partition stopped processing, if it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
}

impl PartitionReport {
    fn new(partition: u32) -> Self {
        Self {
            partition,
            ..Default::default()
        }
    }

    fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Applied => self.applied += 1,
            Disposition::Late => self.late += 1,
            Disposition::Dropped => self.dropped += 1,
            Disposition::Replayed => self.replayed += 1,
        }
    }
}

enum WorkerCommand {
    Process(LogRecord),
    Shutdown,
}

struct Worker {
    partition: u32,
    sender: SyncSender<WorkerCommand>,
    handle: Option<JoinHandle<PartitionReport>>,
}

impl Worker {
    fn spawn(
        config: &PipelineConfig,
        partition: u32,
        sink: Arc<dyn EmissionSink>,
    ) -> Result<Self, ProcessError> {
        let (command_tx, command_rx) = mpsc::sync_channel::<WorkerCommand>(config.queue_capacity);
        let (ready_tx, ready_rx) = mpsc::channel();
        let config = config.clone();

        let handle = thread::Builder::new()
            .name(format!("stride-partition-{partition}"))
            .spawn(move || {
                let processor = match PartitionProcessor::open(&config, partition) {
                    Ok(processor) => processor,
                    Err(err) => {
                        let reason = err.to_string();
                        let _ = ready_tx.send(Err(err));
                        let mut report = PartitionReport::new(partition);
                        report.halted = Some(reason);
                        return report;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    error!(partition, "runtime dropped before worker signaled readiness");
                    return PartitionReport::new(partition);
                }
                run_worker(processor, command_rx, sink.as_ref())
            })?;

        let mut worker = Self {
            partition,
            sender: command_tx,
            handle: Some(handle),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(worker),
            Ok(Err(err)) => {
                worker.join();
                Err(err)
            }
            Err(_) => {
                worker.join();
                Err(ProcessError::PartitionUnavailable(partition))
            }
        }
    }

    fn join(&mut self) -> Option<PartitionReport> {
        let handle = self.handle.take()?;
        let _ = self.sender.send(WorkerCommand::Shutdown);
        match handle.join() {
            Ok(report) => Some(report),
            Err(_) => {
                error!(partition = self.partition, "partition worker panicked");
                let mut report = PartitionReport::new(self.partition);
                report.halted = Some("worker panicked".to_string());
                Some(report)
            }
        }
    }
}

fn run_worker(
    mut processor: PartitionProcessor,
    commands: Receiver<WorkerCommand>,
    sink: &dyn EmissionSink,
) -> PartitionReport {
    let partition = processor.store().partition();
    let mut report = PartitionReport::new(partition);
    info!(partition, "partition worker started");

    while let Ok(command) = commands.recv() {
        let record = match command {
            WorkerCommand::Process(record) => record,
            WorkerCommand::Shutdown => break,
        };

        if report.halted.is_some() {
            report.discarded += 1;
            continue;
        }

        match processor.process(&record, Utc::now()) {
            Ok(outcome) => {
                report.count(outcome.disposition);
                if outcome.emissions.is_empty() {
                    continue;
                }
                if let Err(err) = sink.deliver(&outcome.emissions) {
                    error!(partition, offset = outcome.offset, error = %err, "emission delivery failed; halting partition");
                    report.halted = Some(format!("delivery failed at offset {}: {err}", outcome.offset));
                }
            }
            Err(err) => {
                error!(partition, key = %record.key, error = %err, "fatal error; halting partition");
                report.halted = Some(err.to_string());
            }
        }
    }

    if let Err(err) = processor.checkpoint() {
        warn!(partition, error = %err, "checkpoint on shutdown failed");
    }
    info!(
        partition,
        applied = report.applied,
        dropped = report.dropped,
        discarded = report.discarded,
        "partition worker stopped"
    );
    report
}

/// Fixed set of partition workers sharing one output sink
pub struct PartitionedRuntime {
    workers: Vec<Worker>,
}

impl PartitionedRuntime {
    /// Start one worker per configured partition.
    ///
    /// Returns once every worker has opened and migrated its state database.
    pub fn start(config: &PipelineConfig, sink: Arc<dyn EmissionSink>) -> Result<Self, ProcessError> {
        config.validate()?;

        let mut runtime = Self {
            workers: Vec::with_capacity(config.partitions as usize),
        };
        for partition in 0..config.partitions {
            // On error, dropping `runtime` stops the workers already started
            let worker = Worker::spawn(config, partition, Arc::clone(&sink))?;
            runtime.workers.push(worker);
        }

        info!(
            partitions = config.partitions,
            state_dir = %config.state_dir.display(),
            "runtime started"
        );
        Ok(runtime)
    }

    pub fn partitions(&self) -> u32 {
        self.workers.len() as u32
    }

    /// Queue a record on its partition; blocks while that queue is full.
    pub fn submit(&self, record: LogRecord) -> Result<(), ProcessError> {
        let partition = partition_for(&record.key, self.partitions());
        let worker = self
            .workers
            .get(partition as usize)
            .ok_or(ProcessError::PartitionUnavailable(partition))?;
        worker
            .sender
            .send(WorkerCommand::Process(record))
            .map_err(|_| ProcessError::PartitionUnavailable(partition))
    }

    /// Drain every queue, checkpoint and stop the workers.
    pub fn shutdown(mut self) -> Vec<PartitionReport> {
        let mut workers = std::mem::take(&mut self.workers);
        workers.iter_mut().filter_map(Worker::join).collect()
    }
}

impl Drop for PartitionedRuntime {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.join();
        }
    }
}
