// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Completion reaping and the run barrier.
//!
//! The barrier drives a run to completion: reap one finished task, give
//! idle workers a chance to steal, refill the pipeline, repeat. Once every
//! requested shard is finished, flush rounds drain cross-shard updates
//! until a whole round reports zero, and only then is apply broadcast.
//! Kernels may emit updates against non-local shards; if forwarding those
//! updates produces further sends, another flush round is required before
//! the distributed state is consistent.

use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::master::state::{method_key, TaskId};
use crate::master::{Master, RunDescriptor};
use crate::protocols::{Message, Tag};

/// Interval between progress reports while the barrier spins.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum completions before the cost model has enough samples to steal.
const STEAL_MIN_SHARD_CALLS: u64 = 10;

/// Minimum average shard completion time for stealing to pay off.
const STEAL_MIN_AVG_COMPLETION_SECS: f64 = 0.2;

/// How long a worker must sit idle before it may steal.
const STEAL_MIN_IDLE: Duration = Duration::from_millis(500);

impl Master {
    /// Poll for one KERNEL_DONE message. Returns the reaped worker's index,
    /// or `None` after backing off `sleep_time` when nothing is available.
    /// Completions from a stale epoch are dropped.
    pub(crate) async fn reap_one_task(&mut self, run: &RunDescriptor) -> Result<Option<usize>> {
        match self.transport.try_recv(Tag::KernelDone) {
            None => {
                tokio::time::sleep(self.config.sleep_duration()).await;
                Ok(None)
            }
            Some((src, Message::KernelDone(done))) => {
                if done.epoch != self.epoch {
                    warn!(
                        src,
                        epoch = done.epoch,
                        current = self.epoch,
                        "dropping completion from a stale run"
                    );
                    return Ok(None);
                }

                let worker_idx = src.checked_sub(1).ok_or_else(|| {
                    EngineError::invariant("kernel completion from the master rank")
                })?;
                if worker_idx >= self.workers.len() {
                    return Err(
                        EngineError::invariant(format!("completion from unknown rank {src}"))
                            .into(),
                    );
                }

                for info in &done.shards {
                    let table = self.tables.get_mut(info.table).ok_or_else(|| {
                        EngineError::invariant(format!(
                            "shard info for unknown table {}",
                            info.table
                        ))
                    })?;
                    table.update_partitions(info)?;
                }

                let now = Instant::now();
                let worker = &mut self.workers[worker_idx];
                worker.set_finished(TaskId::new(done.table, done.shard))?;
                let elapsed = worker
                    .last_task_start
                    .map(|start| now.saturating_duration_since(start))
                    .unwrap_or_default();
                worker.total_runtime += elapsed;
                worker.ping(now);

                let stats = self
                    .method_stats
                    .entry(method_key(&run.kernel, &run.method))
                    .or_default();
                stats.shard_time += elapsed;
                stats.shard_calls += 1;

                debug!(
                    worker = worker_idx,
                    table = done.table,
                    shard = done.shard,
                    ?elapsed,
                    "reaped completion"
                );
                Ok(Some(worker_idx))
            }
            Some((src, msg)) => Err(EngineError::transport(format!(
                "unexpected {:?} payload under the completion tag from rank {src}",
                msg.tag()
            ))
            .into()),
        }
    }

    /// Drive the current run until every requested shard is finished, then
    /// run flush rounds to quiescence and broadcast apply.
    pub(crate) async fn barrier(&mut self, run: &RunDescriptor) -> Result<()> {
        let mut last_report = Instant::now();

        while self.finished < run.shards.len() {
            if last_report.elapsed() >= STATS_INTERVAL {
                self.dump_stats(run);
                last_report = Instant::now();
            }

            if self.reap_one_task(run).await?.is_none() {
                continue;
            }
            self.finished += 1;

            self.steal_for_idle_workers(run).await?;

            if self.dispatched < run.shards.len() {
                self.dispatched += self.dispatch_work(run).await?;
            }
        }

        debug!(finished = self.finished, "all kernels finished; entering flush/apply phase");
        self.flush_to_quiescence().await?;
        self.transport.broadcast(Message::WorkerApply).await?;
        debug!("sent apply broadcast");

        let elapsed = self.current_run_start.elapsed();
        self.method_stats
            .entry(method_key(&run.kernel, &run.method))
            .or_default()
            .total_time += elapsed;
        info!(method = %run.method, ?elapsed, "kernel finished");
        Ok(())
    }

    /// Offer a steal to every eligible idle worker; re-broadcast the
    /// routing table once if anything moved.
    async fn steal_for_idle_workers(&mut self, run: &RunDescriptor) -> Result<()> {
        if !self.config.work_stealing {
            return Ok(());
        }
        let stats = self
            .method_stats
            .get(&method_key(&run.kernel, &run.method))
            .copied()
            .unwrap_or_default();
        let avg_completion_time = stats.avg_completion_time();

        // Don't steal while the payoff estimate is still noise.
        if stats.shard_calls <= STEAL_MIN_SHARD_CALLS
            || avg_completion_time <= STEAL_MIN_AVG_COMPLETION_SECS
        {
            return Ok(());
        }

        let now = Instant::now();
        let mut need_update = false;
        for idx in 0..self.workers.len() {
            if self.workers[idx].idle_time(now) > STEAL_MIN_IDLE
                && self.steal_work(run, idx, avg_completion_time)?
            {
                need_update = true;
            }
        }
        if need_update {
            self.send_table_assignments().await?;
        }
        Ok(())
    }

    /// Repeat flush rounds until a whole round reports zero updates done.
    async fn flush_to_quiescence(&mut self) -> Result<()> {
        loop {
            self.transport.broadcast(Message::WorkerFlush).await?;
            debug!("sent flush broadcast");

            let mut quiescent = true;
            let mut flushed = 0;
            while flushed < self.workers.len() {
                match self.transport.try_recv(Tag::FlushResponse) {
                    Some((src, Message::FlushResponse(response))) => {
                        flushed += 1;
                        if response.updates_done > 0 {
                            quiescent = false;
                        }
                        debug!(
                            src,
                            flushed,
                            updates_done = response.updates_done,
                            "flush response"
                        );
                    }
                    Some((src, msg)) => {
                        return Err(EngineError::transport(format!(
                            "unexpected {:?} payload under the flush tag from rank {src}",
                            msg.tag()
                        ))
                        .into());
                    }
                    None => tokio::time::sleep(self.config.sleep_duration()).await,
                }
            }
            if quiescent {
                return Ok(());
            }
        }
    }
}
