// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shard placement.
//!
//! Initial placement binds every `(table, shard)` pair to the alive worker
//! with the fewest served shards; later runs and steals reuse the served
//! sets as routing authority. Workers learn about placement through an
//! acknowledged broadcast of the full routing table.

use anyhow::Result;
use tracing::debug;

use crate::error::EngineError;
use crate::master::state::{TaskId, TaskState};
use crate::master::{Master, RunDescriptor};
use crate::protocols::{Message, ShardAssignment, ShardAssignments, TableId};

/// Advisory task weight; real per-shard sizes are not wired up yet.
const DEFAULT_TASK_SIZE: u64 = 1;

impl Master {
    /// Index of the worker serving `(table, shard)`, if any.
    pub(crate) fn worker_for_shard(&self, table: TableId, shard: usize) -> Option<usize> {
        let id = TaskId::new(table, shard);
        self.workers.iter().position(|w| w.serves(id))
    }

    /// Allocate a task for `(table, shard)` on the worker serving it,
    /// binding the shard to a fresh worker first if nobody serves it yet.
    pub(crate) fn assign_worker(&mut self, table: TableId, shard: usize) -> Result<()> {
        let id = TaskId::new(table, shard);
        if let Some(idx) = self.worker_for_shard(table, shard) {
            self.workers[idx].assign_task(TaskState::new(id, DEFAULT_TASK_SIZE));
            return Ok(());
        }

        // Fewest served shards wins; ties go to the lowest rank.
        let best = self
            .workers
            .iter()
            .filter(|w| w.alive)
            .min_by_key(|w| w.shards.len())
            .map(|w| w.id)
            .ok_or_else(|| {
                EngineError::invariant(
                    "ran out of alive workers; increase the number of partitions per worker",
                )
            })?;

        debug!(table, shard, worker = best, "assigning shard");
        self.workers[best].assign_shard(shard, true, &self.tables);
        self.workers[best].assign_task(TaskState::new(id, DEFAULT_TASK_SIZE));
        Ok(())
    }

    /// Bind every shard of every registered table to a worker. Called at
    /// most once per master lifetime, before the first run is dispatched.
    pub(crate) fn assign_tables(&mut self) -> Result<()> {
        self.shards_assigned = true;

        let shard_counts: Vec<(TableId, usize)> = self
            .tables
            .iter()
            .map(|(id, descriptor)| (*id, descriptor.num_shards()))
            .collect();
        for (table, num_shards) in shard_counts {
            if num_shards == 0 {
                debug!(table, "table has no shards");
            }
            for shard in 0..num_shards {
                self.assign_worker(table, shard)?;
            }
        }
        Ok(())
    }

    /// Rebuild every worker's task set for the requested shards of a run.
    pub(crate) fn assign_tasks(&mut self, run: &RunDescriptor) -> Result<()> {
        for worker in &mut self.workers {
            worker.clear_tasks();
        }
        for &shard in &run.shards {
            debug!(table = run.table, shard, "assigning worker for run shard");
            self.assign_worker(run.table, shard)?;
        }
        Ok(())
    }

    /// Broadcast the full `(worker, table, shard)` routing table and wait
    /// for every worker to acknowledge it.
    pub(crate) async fn send_table_assignments(&self) -> Result<()> {
        let mut request = ShardAssignments::default();
        for (idx, worker) in self.workers.iter().enumerate() {
            for id in &worker.shards {
                request.assignments.push(ShardAssignment {
                    new_worker: idx,
                    table: id.table,
                    shard: id.shard,
                });
            }
        }
        self.transport
            .sync_broadcast(Message::ShardAssignment(request))
            .await
    }
}
