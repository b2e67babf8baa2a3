// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernel dispatch and the work-stealing rebalancer.
//!
//! Dispatch keeps at most one task in flight per worker and always picks
//! the heaviest pending task: stolen before fresh, larger before smaller.
//! Stealing migrates one pending task from the most-loaded worker to an
//! idle one when the expected drain time exceeds the migration cost.

use std::time::Instant;

use anyhow::Result;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::master::state::{TaskStatus, TaskState};
use crate::master::{Master, RunDescriptor};
use crate::protocols::{KernelRequest, Message};

impl Master {
    /// Emit one kernel request to every worker that has pending work and
    /// nothing in flight. Returns the number of tasks dispatched; repeated
    /// calls with no state change dispatch nothing.
    pub(crate) async fn dispatch_work(&mut self, run: &RunDescriptor) -> Result<usize> {
        let transport = self.transport.clone();
        let epoch = self.epoch;
        let mut num_dispatched = 0;

        for idx in 0..self.workers.len() {
            let worker = &mut self.workers[idx];
            if worker.num_pending() == 0 || worker.num_active() > 0 {
                continue;
            }

            let Some(best) = worker.pending().max_by_key(|t| t.weight()).map(|t| t.id) else {
                continue;
            };
            let task = worker
                .task_mut(best)
                .ok_or_else(|| EngineError::invariant("pending task vanished during dispatch"))?;
            task.status = TaskStatus::Active;
            worker.last_task_start = Some(Instant::now());

            let request = KernelRequest {
                kernel: run.kernel.clone(),
                method: run.method.clone(),
                table: run.table,
                shard: best.shard,
                epoch,
            };
            transport.send(idx + 1, Message::RunKernel(request)).await?;
            debug!(worker = idx, table = run.table, shard = best.shard, "dispatched kernel");
            num_dispatched += 1;
        }
        Ok(num_dispatched)
    }

    /// Try to migrate one pending task to `idle_worker`. Returns whether a
    /// steal committed; refusals are soft and only logged.
    pub(crate) fn steal_work(
        &mut self,
        run: &RunDescriptor,
        idle_worker: usize,
        avg_completion_time: f64,
    ) -> Result<bool> {
        if !self.config.work_stealing {
            return Ok(false);
        }
        if !self.workers[idle_worker].alive {
            return Ok(false);
        }

        // Source: the worker with the most pending tasks.
        let Some(src) = (0..self.workers.len()).max_by_key(|&i| self.workers[i].num_pending())
        else {
            return Ok(false);
        };
        if src == idle_worker || self.workers[src].num_pending() == 0 {
            return Ok(false);
        }

        let Some(task) = self.workers[src].pending().max_by_key(|t| t.weight()) else {
            return Ok(false);
        };
        if task.stolen {
            debug!(worker = src, table = task.id.table, shard = task.id.shard, "task already migrated once");
            return Ok(false);
        }
        let id = task.id;
        let size = task.size;

        let table = self
            .tables
            .get(run.table)
            .ok_or_else(|| EngineError::config(format!("unknown table {}", run.table)))?;
        let num_shards = table.num_shards();

        // TODO: feed per-shard entry counts from ShardInfo reports into this
        // normalizer; with unit weights the mean is always 1 and the cost
        // model only sees task counts.
        let mut average_size = 0.0;
        for _ in 0..num_shards {
            average_size += 1.0;
        }
        average_size /= num_shards.max(1) as f64;

        // Weigh the cost of moving the shard against the time saved.
        let move_cost = (2.0 * size as f64 * avg_completion_time / average_size).max(1.0);
        let eta: f64 = self.workers[src]
            .pending()
            .map(|p| (p.size as f64 * avg_completion_time / average_size).max(1.0))
            .sum();

        if eta <= move_cost {
            debug!(eta, move_cost, worker = idle_worker, "steal refused by cost model");
            return Ok(false);
        }

        info!(
            worker = idle_worker,
            from = src,
            table = id.table,
            shard = id.shard,
            size,
            "stealing task"
        );

        let mut task: TaskState = self.workers[src].remove_task(id)?;
        task.stolen = true;
        self.workers[src].assign_shard(id.shard, false, &self.tables);
        self.workers[idle_worker].assign_shard(id.shard, true, &self.tables);
        self.workers[idle_worker].assign_task(task);
        Ok(true)
    }
}
