// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The master control plane.
//!
//! The [`Master`] owns the worker registry, shard placement, task lifecycle,
//! the work-stealing rebalancer, the kernel dispatch loop and the
//! flush/apply barrier. It is a single cooperative task: every state
//! transition happens on the caller's task, driven by the barrier loop, and
//! the only concurrency is with remote workers over tagged messages.
//!
//! A typical embedding:
//!
//! ```ignore
//! let mut master = Master::new(config, transport, kernels, tables).await?;
//! let run = RunDescriptorBuilder::default()
//!     .kernel("PageRank")
//!     .method("propagate")
//!     .table(0u32)
//!     .shards(vec![0, 1, 2, 3])
//!     .build()?;
//! master.run(run).await?;
//! master.shutdown().await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use derive_builder::Builder;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::kernel::KernelRegistry;
use crate::protocols::{Message, TableId, Tag};
use crate::table::{TableContext, TableRegistry};
use crate::transports::{Transport, MASTER_RANK};

mod barrier;
mod placement;
mod scheduler;
mod state;

pub use state::{method_key, MethodStats, TaskId, TaskState, TaskStatus, WorkerState};

/// One run of a kernel method over a subset of a table's shards.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into))]
pub struct RunDescriptor {
    /// Kernel name; must resolve in the kernel registry.
    pub kernel: String,
    /// Method name; must be registered on the kernel.
    pub method: String,
    /// Table the kernel runs against.
    pub table: TableId,
    /// The shard indices to execute this run.
    pub shards: Vec<usize>,
}

/// Central coordinator for a fixed fleet of workers.
pub struct Master {
    pub(crate) config: EngineConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) kernels: KernelRegistry,
    pub(crate) tables: TableRegistry,
    pub(crate) workers: Vec<WorkerState>,
    pub(crate) method_stats: HashMap<String, MethodStats>,
    pub(crate) current_run: Option<RunDescriptor>,
    pub(crate) current_run_start: Instant,
    /// Incremented at each run start; stale completions are keyed off it.
    pub(crate) epoch: u64,
    pub(crate) finished: usize,
    pub(crate) dispatched: usize,
    pub(crate) shards_assigned: bool,
    started_at: Instant,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("epoch", &self.epoch)
            .field("finished", &self.finished)
            .field("dispatched", &self.dispatched)
            .field("shards_assigned", &self.shards_assigned)
            .field("current_run", &self.current_run)
            .finish_non_exhaustive()
    }
}

impl Master {
    /// Construct the master and wait for every worker to register.
    ///
    /// Consumes exactly `num_workers` REGISTER_WORKER messages before
    /// returning. Fails with a Bootstrap error if the transport reports a
    /// degenerate peer set.
    pub async fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        kernels: KernelRegistry,
        tables: TableRegistry,
    ) -> Result<Self> {
        if transport.num_peers() <= 1 {
            return Err(
                EngineError::bootstrap("at least one master and one worker required").into(),
            );
        }

        let workers = (0..config.num_workers).map(WorkerState::new).collect();
        let mut master = Self {
            config,
            transport,
            kernels,
            tables,
            workers,
            method_stats: HashMap::new(),
            current_run: None,
            current_run_start: Instant::now(),
            epoch: 0,
            finished: 0,
            dispatched: 0,
            shards_assigned: false,
            started_at: Instant::now(),
        };
        master.wait_for_registrations().await?;
        Ok(master)
    }

    async fn wait_for_registrations(&mut self) -> Result<()> {
        let mut remaining = self.config.num_workers;
        while remaining > 0 {
            match self.transport.try_recv(Tag::RegisterWorker) {
                Some((src, Message::RegisterWorker(identity))) => {
                    remaining -= 1;
                    debug!(
                        worker = src.wrapping_sub(1),
                        instance_id = %identity.instance_id,
                        pid = identity.pid,
                        remaining,
                        "registered worker"
                    );
                }
                Some((src, msg)) => {
                    return Err(EngineError::bootstrap(format!(
                        "unexpected {:?} from rank {src} during registration",
                        msg.tag()
                    ))
                    .into());
                }
                None => tokio::time::sleep(self.config.sleep_duration()).await,
            }
        }
        info!("all workers registered; starting up");
        Ok(())
    }

    /// Execute one run to completion: placement (first run only), dispatch,
    /// reap, opportunistic stealing, then the flush/apply barrier.
    pub async fn run(&mut self, run: RunDescriptor) -> Result<()> {
        if let Some(prev) = &self.current_run {
            if self.finished != prev.shards.len() {
                return Err(EngineError::invariant(
                    "cannot start a run before the previous one is finished",
                )
                .into());
            }
        }
        self.finished = 0;
        self.dispatched = 0;

        let kernel = self
            .kernels
            .get(&run.kernel)
            .ok_or_else(|| EngineError::config(format!("unknown kernel '{}'", run.kernel)))?;
        if !kernel.has_method(&run.method) {
            return Err(EngineError::config(format!(
                "kernel '{}' has no method '{}'",
                run.kernel, run.method
            ))
            .into());
        }
        if self.tables.get(run.table).is_none() {
            return Err(EngineError::config(format!("unknown table {}", run.table)).into());
        }

        debug!(
            kernel = %run.kernel,
            method = %run.method,
            table = run.table,
            shards = run.shards.len(),
            "starting run"
        );

        self.method_stats
            .entry(method_key(&run.kernel, &run.method))
            .or_default()
            .calls += 1;

        // Placement happens once, immediately before the first run.
        if !self.shards_assigned {
            self.assign_tables()?;
            self.send_table_assignments().await?;
        }

        self.epoch += 1;
        let context = TableContext {
            rank: MASTER_RANK,
            epoch: self.epoch,
        };
        for (_, table) in self.tables.iter_mut() {
            table.set_context(context);
        }

        self.current_run = Some(run.clone());
        self.current_run_start = Instant::now();

        self.assign_tasks(&run)?;
        self.dispatched = self.dispatch_work(&run).await?;
        self.barrier(&run).await
    }

    /// Mark a worker dead. Dead workers are skipped by placement and
    /// stealing; their rank is never reused. Without explicit marking the
    /// worker set is assumed fixed and never-failing.
    pub fn mark_worker_dead(&mut self, worker: usize) {
        if let Some(state) = self.workers.get_mut(worker) {
            warn!(worker, "marking worker dead");
            state.alive = false;
        }
    }

    /// Log lifetime statistics and tell every worker to exit.
    pub async fn shutdown(self) -> Result<()> {
        info!(total_runtime = ?self.started_at.elapsed(), "shutting down workers");
        for worker in &self.workers {
            debug!(
                worker = worker.id,
                runtime = ?worker.total_runtime,
                "worker execution time"
            );
        }
        for (method, stats) in &self.method_stats {
            info!(
                method = %method,
                calls = stats.calls,
                shard_calls = stats.shard_calls,
                shard_time = ?stats.shard_time,
                total_time = ?stats.total_time,
                "kernel stats"
            );
        }
        for rank in 1..self.transport.num_peers() {
            self.transport.send(rank, Message::WorkerShutdown).await?;
        }
        Ok(())
    }

    /// Shards finished in the current run.
    pub fn finished_shards(&self) -> usize {
        self.finished
    }

    /// Current run epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn worker(&self, idx: usize) -> Option<&WorkerState> {
        self.workers.get(idx)
    }

    pub fn table(&self, id: TableId) -> Option<&crate::table::TableDescriptor> {
        self.tables.get(id)
    }

    /// Cumulative statistics for a kernel/method pair, if it ever ran.
    pub fn stats(&self, kernel: &str, method: &str) -> Option<&MethodStats> {
        self.method_stats.get(&method_key(kernel, method))
    }

    pub(crate) fn dump_stats(&self, run: &RunDescriptor) {
        let status: String = self
            .workers
            .iter()
            .map(|w| format!("{}/{} ", w.num_finished(), w.num_assigned()))
            .collect();
        info!(
            method = %run.method,
            shards = run.shards.len(),
            dispatched = self.dispatched,
            finished = self.finished,
            workers = %status.trim_end(),
            "run progress"
        );
    }
}
