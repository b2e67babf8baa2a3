// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scheduling state owned by the master.
//!
//! One [`WorkerState`] exists per configured worker and owns that worker's
//! current task set. Tasks move `Pending -> Active -> Finished` within a
//! run; a new run discards all task state. The *served set* (`shards`) is
//! routing authority and outlives individual runs.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::EngineError;
use crate::protocols::TableId;
use crate::table::TableRegistry;

/// A `(table, shard)` pair, totally ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    pub table: TableId,
    pub shard: usize,
}

impl TaskId {
    pub fn new(table: TableId, shard: usize) -> Self {
        Self { table, shard }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Active,
    Finished,
}

/// One kernel invocation instance.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Advisory weight used by the scheduling and stealing cost model.
    pub size: u64,
    /// True once migrated by the stealer. A stolen task is never stolen
    /// again.
    pub stolen: bool,
}

impl TaskState {
    pub fn new(id: TaskId, size: u64) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            size,
            stolen: false,
        }
    }

    /// Dispatch priority: stolen tasks outrank fresh ones, then larger
    /// tasks outrank smaller ones.
    pub fn weight(&self) -> (bool, u64) {
        (self.stolen, self.size)
    }
}

/// The master's view of one worker.
#[derive(Debug)]
pub struct WorkerState {
    pub id: usize,
    tasks: BTreeMap<TaskId, TaskState>,
    /// Table shards this worker is responsible for serving. May span more
    /// tables than the current task set.
    pub shards: BTreeSet<TaskId>,
    pub last_ping_time: Instant,
    pub last_task_start: Option<Instant>,
    pub total_runtime: Duration,
    pub alive: bool,
    /// Reserved for checkpoint coordination; not observed by the core.
    pub checkpointing: bool,
}

impl WorkerState {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            tasks: BTreeMap::new(),
            shards: BTreeSet::new(),
            last_ping_time: Instant::now(),
            last_task_start: None,
            total_runtime: Duration::ZERO,
            alive: true,
            checkpointing: false,
        }
    }

    pub fn num_assigned(&self) -> usize {
        self.tasks.len()
    }

    pub fn num_pending(&self) -> usize {
        self.count(TaskStatus::Pending)
    }

    pub fn num_active(&self) -> usize {
        self.count(TaskStatus::Active)
    }

    pub fn num_finished(&self) -> usize {
        self.count(TaskStatus::Finished)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// Pending tasks in id order.
    pub fn pending(&self) -> impl Iterator<Item = &TaskState> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
    }

    pub fn is_assigned(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn serves(&self, id: TaskId) -> bool {
        self.shards.contains(&id)
    }

    /// Add or drop `shard` from the served set across every table for which
    /// the shard index exists.
    pub fn assign_shard(&mut self, shard: usize, should_serve: bool, tables: &TableRegistry) {
        for (table, descriptor) in tables.iter() {
            if shard < descriptor.num_shards() {
                let id = TaskId::new(*table, shard);
                if should_serve {
                    self.shards.insert(id);
                } else {
                    self.shards.remove(&id);
                }
            }
        }
    }

    pub fn assign_task(&mut self, task: TaskState) {
        self.tasks.insert(task.id, task);
    }

    /// Remove a task, handing ownership of its state back to the caller.
    pub fn remove_task(&mut self, id: TaskId) -> Result<TaskState> {
        self.tasks.remove(&id).ok_or_else(|| {
            EngineError::invariant(format!(
                "worker {} holds no task for table {} shard {}",
                self.id, id.table, id.shard
            ))
            .into()
        })
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut TaskState> {
        self.tasks.get_mut(&id)
    }

    /// Drop every task. Served shards are untouched.
    pub fn clear_tasks(&mut self) {
        self.tasks.clear();
    }

    /// Transition a task from Active to Finished. Any other starting state
    /// is an invariant violation.
    pub fn set_finished(&mut self, id: TaskId) -> Result<()> {
        let task = self.tasks.get_mut(&id).ok_or_else(|| {
            EngineError::invariant(format!(
                "completion for unassigned task: worker {} table {} shard {}",
                self.id, id.table, id.shard
            ))
        })?;
        if task.status != TaskStatus::Active {
            return Err(EngineError::invariant(format!(
                "completion for task in state {:?}: worker {} table {} shard {}",
                task.status, self.id, id.table, id.shard
            ))
            .into());
        }
        task.status = TaskStatus::Finished;
        Ok(())
    }

    pub fn ping(&mut self, now: Instant) {
        self.last_ping_time = now;
    }

    /// How long the worker has been without runnable work. Zero until every
    /// assigned task is finished; stealing waits a little before kicking in.
    pub fn idle_time(&self, now: Instant) -> Duration {
        if self.num_finished() != self.tasks.len() {
            return Duration::ZERO;
        }
        now.saturating_duration_since(self.last_ping_time)
    }
}

/// Cumulative per-method statistics, keyed `"kernel:method"`. Survives
/// across runs for the stealer's cost model and end-of-life reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodStats {
    pub calls: u64,
    pub shard_calls: u64,
    pub shard_time: Duration,
    pub total_time: Duration,
}

impl MethodStats {
    /// Mean seconds per completed shard, or zero before the first
    /// completion.
    pub fn avg_completion_time(&self) -> f64 {
        if self.shard_calls == 0 {
            return 0.0;
        }
        self.shard_time.as_secs_f64() / self.shard_calls as f64
    }
}

/// Statistics key for a run's kernel/method pair.
pub fn method_key(kernel: &str, method: &str) -> String {
    format!("{kernel}:{method}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_with_tasks(tasks: Vec<TaskState>) -> WorkerState {
        let mut worker = WorkerState::new(0);
        for task in tasks {
            worker.assign_task(task);
        }
        worker
    }

    #[test]
    fn test_task_id_orders_by_table_then_shard() {
        assert!(TaskId::new(0, 9) < TaskId::new(1, 0));
        assert!(TaskId::new(1, 0) < TaskId::new(1, 1));
    }

    #[test]
    fn test_weight_ranks_stolen_above_large() {
        let mut small_stolen = TaskState::new(TaskId::new(0, 0), 1);
        small_stolen.stolen = true;
        let large_fresh = TaskState::new(TaskId::new(0, 1), 100);
        assert!(small_stolen.weight() > large_fresh.weight());

        let larger_fresh = TaskState::new(TaskId::new(0, 2), 200);
        assert!(larger_fresh.weight() > large_fresh.weight());
    }

    #[test]
    fn test_counts_follow_status() {
        let mut worker = worker_with_tasks(vec![
            TaskState::new(TaskId::new(0, 0), 1),
            TaskState::new(TaskId::new(0, 1), 1),
        ]);
        assert_eq!(worker.num_pending(), 2);

        worker.task_mut(TaskId::new(0, 0)).unwrap().status = TaskStatus::Active;
        assert_eq!(worker.num_pending(), 1);
        assert_eq!(worker.num_active(), 1);

        worker.set_finished(TaskId::new(0, 0)).unwrap();
        assert_eq!(worker.num_active(), 0);
        assert_eq!(worker.num_finished(), 1);
    }

    #[test]
    fn test_double_finish_is_invariant_error() {
        let mut worker = worker_with_tasks(vec![TaskState::new(TaskId::new(0, 0), 1)]);
        worker.task_mut(TaskId::new(0, 0)).unwrap().status = TaskStatus::Active;
        worker.set_finished(TaskId::new(0, 0)).unwrap();

        let err = worker.set_finished(TaskId::new(0, 0)).unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(crate::error::ErrorKind::Invariant)
        );
    }

    #[test]
    fn test_finish_without_dispatch_is_invariant_error() {
        let mut worker = worker_with_tasks(vec![TaskState::new(TaskId::new(0, 0), 1)]);
        let err = worker.set_finished(TaskId::new(0, 0)).unwrap_err();
        assert_eq!(
            crate::error::kind_of(&err),
            Some(crate::error::ErrorKind::Invariant)
        );
    }

    #[test]
    fn test_idle_time_requires_all_finished() {
        let mut worker = worker_with_tasks(vec![TaskState::new(TaskId::new(0, 0), 1)]);
        let later = Instant::now() + Duration::from_secs(2);
        assert_eq!(worker.idle_time(later), Duration::ZERO);

        worker.task_mut(TaskId::new(0, 0)).unwrap().status = TaskStatus::Active;
        worker.set_finished(TaskId::new(0, 0)).unwrap();
        worker.ping(Instant::now());
        assert!(worker.idle_time(later) >= Duration::from_secs(1));
    }

    #[test]
    fn test_clear_tasks_keeps_served_set() {
        let mut tables = TableRegistry::default();
        tables
            .register(crate::table::TableDescriptor::new(0, 4))
            .unwrap();

        let mut worker = worker_with_tasks(vec![TaskState::new(TaskId::new(0, 1), 1)]);
        worker.assign_shard(1, true, &tables);
        worker.clear_tasks();

        assert_eq!(worker.num_assigned(), 0);
        assert!(worker.serves(TaskId::new(0, 1)));
    }

    #[test]
    fn test_avg_completion_time() {
        let mut stats = MethodStats::default();
        assert_eq!(stats.avg_completion_time(), 0.0);

        stats.shard_calls = 4;
        stats.shard_time = Duration::from_secs(2);
        assert!((stats.avg_completion_time() - 0.5).abs() < 1e-9);
    }
}
