// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane message shapes.
//!
//! Every message exchanged between the master (rank 0) and its workers
//! (ranks 1..N) is a [`Message`] variant carried under a [`Tag`]. The wire
//! encoding is a transport concern; this module fixes only the payload
//! shapes and the tag each payload travels under.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Integer table identifier.
pub type TableId = u32;

/// Message tags. Receivers filter their inbox by tag, so unrelated traffic
/// never has to be consumed out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    RegisterWorker,
    ShardAssignment,
    RunKernel,
    KernelDone,
    WorkerFlush,
    FlushResponse,
    WorkerApply,
    TableUpdate,
    WorkerShutdown,
    Ack,
}

/// A typed control-plane message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// worker -> master: identity record, sent once at startup.
    RegisterWorker(WorkerIdentity),
    /// master -> all workers (acknowledged broadcast): full routing table.
    ShardAssignment(ShardAssignments),
    /// master -> worker: run one kernel method on one shard.
    RunKernel(KernelRequest),
    /// worker -> master: a kernel invocation completed.
    KernelDone(KernelDone),
    /// master -> all workers: drain queued cross-shard updates.
    WorkerFlush,
    /// worker -> master: how many updates the last flush drained.
    FlushResponse(FlushResponse),
    /// master -> all workers: apply buffered updates, fire-and-forget.
    WorkerApply,
    /// worker -> worker: one opaque table delta routed to the shard owner.
    TableUpdate(TableUpdate),
    /// master -> worker: exit the worker loop.
    WorkerShutdown,
    /// transport-internal delivery acknowledgment.
    Ack,
}

impl Message {
    /// The tag this message travels under.
    pub fn tag(&self) -> Tag {
        match self {
            Message::RegisterWorker(_) => Tag::RegisterWorker,
            Message::ShardAssignment(_) => Tag::ShardAssignment,
            Message::RunKernel(_) => Tag::RunKernel,
            Message::KernelDone(_) => Tag::KernelDone,
            Message::WorkerFlush => Tag::WorkerFlush,
            Message::FlushResponse(_) => Tag::FlushResponse,
            Message::WorkerApply => Tag::WorkerApply,
            Message::TableUpdate(_) => Tag::TableUpdate,
            Message::WorkerShutdown => Tag::WorkerShutdown,
            Message::Ack => Tag::Ack,
        }
    }
}

/// Identity record a worker presents when registering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Random instance id, unique per worker process lifetime.
    pub instance_id: Uuid,
    /// OS process id, for log correlation.
    pub pid: u32,
}

impl WorkerIdentity {
    pub fn generate() -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            pid: std::process::id(),
        }
    }
}

/// One `(worker, table, shard)` routing triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    /// Worker index (0-based; rank is `new_worker + 1`).
    pub new_worker: usize,
    pub table: TableId,
    pub shard: usize,
}

/// The full routing table, re-broadcast whenever placement changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardAssignments {
    pub assignments: Vec<ShardAssignment>,
}

/// A kernel invocation request for a single shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelRequest {
    pub kernel: String,
    pub method: String,
    pub table: TableId,
    pub shard: usize,
    /// Run epoch the request belongs to. Completions echo it back so the
    /// master can discard stragglers from a prior run.
    pub epoch: u64,
}

/// Partition metadata reported by a worker after touching a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub table: TableId,
    pub shard: usize,
    /// Worker index currently holding the shard's data.
    pub owner: usize,
    /// Number of entries resident in the shard.
    pub entries: u64,
}

/// Completion report for one kernel invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelDone {
    pub table: TableId,
    pub shard: usize,
    pub epoch: u64,
    /// Metadata for every shard the invocation touched.
    pub shards: Vec<ShardInfo>,
}

/// Count of cross-shard updates a worker propagated in one flush round.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FlushResponse {
    pub updates_done: u64,
}

/// One opaque table delta, routed to the worker serving `(table, shard)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableUpdate {
    pub table: TableId,
    pub shard: usize,
    pub payload: Bytes,
}
