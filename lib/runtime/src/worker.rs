// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker-side execution loop.
//!
//! A worker registers with the master, then serves messages until told to
//! shut down: it keeps the shard routing table current from assignment
//! broadcasts, instantiates and runs kernels against its local tables,
//! queues the cross-shard updates kernels emit, forwards them to the
//! owning workers during flush rounds, and applies buffered updates when
//! the master broadcasts apply.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::kernel::{KernelContext, KernelRegistry};
use crate::protocols::{
    FlushResponse, KernelDone, KernelRequest, Message, ShardAssignments, ShardInfo, TableId,
    TableUpdate, WorkerIdentity,
};
use crate::table::ShardedTable;
use crate::transports::{Rank, Transport, MASTER_RANK};

/// One worker process: local tables, kernel execution, update routing.
pub struct Worker {
    transport: Arc<dyn Transport>,
    kernels: KernelRegistry,
    tables: HashMap<TableId, Box<dyn ShardedTable>>,
    /// `(table, shard)` -> serving worker index, rebuilt from each
    /// assignment broadcast.
    routing: HashMap<(TableId, usize), usize>,
    /// Updates emitted by kernels, not yet propagated.
    outbox: VecDeque<TableUpdate>,
    /// Updates received or self-routed, waiting for apply.
    apply_queue: Vec<TableUpdate>,
    identity: WorkerIdentity,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(transport: Arc<dyn Transport>, kernels: KernelRegistry) -> Self {
        Self {
            transport,
            kernels,
            tables: HashMap::new(),
            routing: HashMap::new(),
            outbox: VecDeque::new(),
            apply_queue: Vec::new(),
            identity: WorkerIdentity::generate(),
            cancel: CancellationToken::new(),
        }
    }

    /// Attach local storage for one table.
    pub fn register_table(&mut self, table: Box<dyn ShardedTable>) -> Result<()> {
        let id = table.id();
        if self.tables.insert(id, table).is_some() {
            return Err(EngineError::config(format!("table {id} registered twice")).into());
        }
        Ok(())
    }

    /// Token that stops the serve loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// This worker's index (rank minus the master).
    fn index(&self) -> usize {
        self.transport.rank().saturating_sub(1)
    }

    /// Register with the master and serve until shutdown or cancellation.
    pub async fn run(mut self) -> Result<()> {
        let transport = self.transport.clone();
        let cancel = self.cancel.clone();

        info!(
            worker = self.index(),
            instance_id = %self.identity.instance_id,
            "worker starting"
        );
        transport
            .send(
                MASTER_RANK,
                Message::RegisterWorker(self.identity.clone()),
            )
            .await?;

        loop {
            let (src, msg) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker = self.index(), "worker cancelled");
                    break;
                }
                received = transport.recv_any() => received?,
            };

            match msg {
                Message::ShardAssignment(assignments) => self.apply_assignments(assignments),
                Message::RunKernel(request) => self.run_kernel(request).await?,
                Message::WorkerFlush => self.flush().await?,
                Message::WorkerApply => self.apply()?,
                Message::TableUpdate(update) => self.apply_queue.push(update),
                Message::WorkerShutdown => {
                    info!(worker = self.index(), "worker shutting down");
                    break;
                }
                other => {
                    warn!(
                        worker = self.index(),
                        src,
                        tag = ?other.tag(),
                        "ignoring unexpected message"
                    );
                }
            }
        }
        Ok(())
    }

    fn apply_assignments(&mut self, assignments: ShardAssignments) {
        self.routing.clear();
        for assignment in assignments.assignments {
            self.routing
                .insert((assignment.table, assignment.shard), assignment.new_worker);
        }
        debug!(
            worker = self.index(),
            routes = self.routing.len(),
            "routing table updated"
        );
    }

    async fn run_kernel(&mut self, request: KernelRequest) -> Result<()> {
        let info = self.kernels.get(&request.kernel).ok_or_else(|| {
            EngineError::config(format!("unknown kernel '{}'", request.kernel))
        })?;

        let mut kernel = info.create();
        {
            let mut ctx = KernelContext::new(
                request.table,
                request.shard,
                &mut self.tables,
                &mut self.outbox,
            );
            kernel.init(&mut ctx)?;
            info.run(kernel.as_mut(), &request.method, &mut ctx)?;
        }
        debug!(
            worker = self.index(),
            kernel = %request.kernel,
            method = %request.method,
            shard = request.shard,
            "kernel run complete"
        );

        let shards = self
            .local_shard_info(request.table, request.shard)
            .into_iter()
            .collect();
        let done = KernelDone {
            table: request.table,
            shard: request.shard,
            epoch: request.epoch,
            shards,
        };
        self.transport
            .send(MASTER_RANK, Message::KernelDone(done))
            .await
    }

    fn local_shard_info(&self, table: TableId, shard: usize) -> Option<ShardInfo> {
        self.tables.get(&table).map(|t| ShardInfo {
            table,
            shard,
            owner: self.index(),
            entries: t.entries(shard),
        })
    }

    /// Drain the outbox, forwarding each update to the worker serving its
    /// shard, and report the count to the master.
    async fn flush(&mut self) -> Result<()> {
        let mut updates_done = 0;
        while let Some(update) = self.outbox.pop_front() {
            updates_done += 1;
            let owner = self
                .routing
                .get(&(update.table, update.shard))
                .copied()
                .ok_or_else(|| {
                    EngineError::invariant(format!(
                        "no route for table {} shard {}",
                        update.table, update.shard
                    ))
                })?;
            let dest: Rank = owner + 1;
            if dest == self.transport.rank() {
                self.apply_queue.push(update);
            } else {
                self.transport
                    .send(dest, Message::TableUpdate(update))
                    .await?;
            }
        }
        debug!(worker = self.index(), updates_done, "flushed updates");
        self.transport
            .send(
                MASTER_RANK,
                Message::FlushResponse(FlushResponse { updates_done }),
            )
            .await
    }

    /// Apply every buffered update to local storage.
    fn apply(&mut self) -> Result<()> {
        let applied = self.apply_queue.len();
        for update in self.apply_queue.drain(..) {
            match self.tables.get_mut(&update.table) {
                Some(table) => table.apply(update.shard, &update.payload)?,
                None => {
                    warn!(
                        table = update.table,
                        shard = update.shard,
                        "dropping update for unregistered table"
                    );
                }
            }
        }
        debug!(worker = self.index(), applied, "applied buffered updates");
        Ok(())
    }
}
