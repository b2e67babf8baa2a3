// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end message traces.
//!
//! These tests script the worker side by hand over the in-process mesh so
//! the exact externally observable message sequence can be asserted.

use std::sync::Arc;

use mosaic_runtime::config::EngineConfig;
use mosaic_runtime::error::{kind_of, ErrorKind};
use mosaic_runtime::kernel::{Kernel, KernelInfo, KernelRegistry};
use mosaic_runtime::master::Master;
use mosaic_runtime::protocols::{
    FlushResponse, KernelDone, Message, Tag, WorkerIdentity,
};
use mosaic_runtime::table::{TableDescriptor, TableRegistry};
use mosaic_runtime::transports::local::{LocalEndpoint, LocalMesh};
use mosaic_runtime::transports::{Transport, MASTER_RANK};
use mosaic_runtime::RunDescriptorBuilder;

use anyhow::Result;

#[derive(Default)]
struct Noop;

impl Kernel for Noop {
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn noop(_kernel: &mut Noop, _ctx: &mut mosaic_runtime::kernel::KernelContext) -> Result<()> {
    Ok(())
}

fn kernels() -> KernelRegistry {
    let mut registry = KernelRegistry::default();
    registry
        .register(KernelInfo::of::<Noop>("Noop").with_method("run", noop))
        .unwrap();
    registry
}

fn tables(num_shards: usize) -> TableRegistry {
    let mut registry = TableRegistry::default();
    registry
        .register(TableDescriptor::new(0, num_shards))
        .unwrap();
    registry
}

fn config(num_workers: usize) -> EngineConfig {
    EngineConfig {
        num_workers,
        ..EngineConfig::default()
    }
}

/// A hand-driven worker: registers, echoes completions, reports scripted
/// flush counts, and returns the tags it saw once apply (or shutdown)
/// arrives.
async fn scripted_worker(endpoint: LocalEndpoint, flush_counts: Vec<u64>) -> Vec<Tag> {
    endpoint
        .send(
            MASTER_RANK,
            Message::RegisterWorker(WorkerIdentity::generate()),
        )
        .await
        .unwrap();

    let mut flush_counts = flush_counts.into_iter();
    let mut trace = Vec::new();
    loop {
        let (_, msg) = endpoint.recv_any().await.unwrap();
        trace.push(msg.tag());
        match msg {
            Message::RunKernel(request) => {
                endpoint
                    .send(
                        MASTER_RANK,
                        Message::KernelDone(KernelDone {
                            table: request.table,
                            shard: request.shard,
                            epoch: request.epoch,
                            shards: vec![],
                        }),
                    )
                    .await
                    .unwrap();
            }
            Message::WorkerFlush => {
                let updates_done = flush_counts.next().unwrap_or(0);
                endpoint
                    .send(
                        MASTER_RANK,
                        Message::FlushResponse(FlushResponse { updates_done }),
                    )
                    .await
                    .unwrap();
            }
            Message::WorkerApply | Message::WorkerShutdown => return trace,
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_trivial_run_message_trace() {
    let mut peers = LocalMesh::new(1);
    let worker = tokio::spawn(scripted_worker(peers.remove(1), vec![0]));
    let master_endpoint: Arc<dyn Transport> = Arc::new(peers.remove(0));

    let mut master = Master::new(config(1), master_endpoint, kernels(), tables(1))
        .await
        .unwrap();

    let run = RunDescriptorBuilder::default()
        .kernel("Noop")
        .method("run")
        .table(0u32)
        .shards(vec![0])
        .build()
        .unwrap();
    master.run(run).await.unwrap();
    assert_eq!(master.finished_shards(), 1);

    let trace = worker.await.unwrap();
    assert_eq!(
        trace,
        vec![
            Tag::ShardAssignment,
            Tag::RunKernel,
            Tag::WorkerFlush,
            Tag::WorkerApply,
        ]
    );
}

#[tokio::test]
async fn test_flush_requires_two_rounds() {
    let mut peers = LocalMesh::new(2);
    let master_endpoint: Arc<dyn Transport> = Arc::new(peers.remove(0));
    let mut handles = Vec::new();
    for (endpoint, first_count) in peers.into_iter().zip([5u64, 3u64]) {
        handles.push(tokio::spawn(scripted_worker(endpoint, vec![first_count, 0])));
    }

    let mut master = Master::new(config(2), master_endpoint, kernels(), tables(2))
        .await
        .unwrap();

    let run = RunDescriptorBuilder::default()
        .kernel("Noop")
        .method("run")
        .table(0u32)
        .shards(vec![0, 1])
        .build()
        .unwrap();
    master.run(run).await.unwrap();

    for handle in handles {
        let trace = handle.await.unwrap();
        // One non-quiescent flush round, one quiescent round, one apply.
        let flushes = trace.iter().filter(|t| **t == Tag::WorkerFlush).count();
        let applies = trace.iter().filter(|t| **t == Tag::WorkerApply).count();
        assert_eq!(flushes, 2);
        assert_eq!(applies, 1);
    }
}

#[tokio::test]
async fn test_unknown_kernel_aborts_before_dispatch() {
    let mut peers = LocalMesh::new(1);
    let worker = tokio::spawn(scripted_worker(peers.remove(1), vec![]));
    let master_endpoint: Arc<dyn Transport> = Arc::new(peers.remove(0));

    let mut master = Master::new(config(1), master_endpoint, kernels(), tables(1))
        .await
        .unwrap();

    let run = RunDescriptorBuilder::default()
        .kernel("Missing")
        .method("run")
        .table(0u32)
        .shards(vec![0])
        .build()
        .unwrap();
    let err = master.run(run).await.unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::Config));

    master.shutdown().await.unwrap();
    let trace = worker.await.unwrap();
    assert_eq!(trace, vec![Tag::WorkerShutdown]);
}

#[tokio::test]
async fn test_unknown_method_aborts_before_dispatch() {
    let mut peers = LocalMesh::new(1);
    let worker = tokio::spawn(scripted_worker(peers.remove(1), vec![]));
    let master_endpoint: Arc<dyn Transport> = Arc::new(peers.remove(0));

    let mut master = Master::new(config(1), master_endpoint, kernels(), tables(1))
        .await
        .unwrap();

    let run = RunDescriptorBuilder::default()
        .kernel("Noop")
        .method("missing")
        .table(0u32)
        .shards(vec![0])
        .build()
        .unwrap();
    let err = master.run(run).await.unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::Config));

    master.shutdown().await.unwrap();
    assert_eq!(worker.await.unwrap(), vec![Tag::WorkerShutdown]);
}

#[tokio::test]
async fn test_master_requires_more_than_one_peer() {
    let mut peers = LocalMesh::new(0);
    let master_endpoint: Arc<dyn Transport> = Arc::new(peers.remove(0));
    let err = Master::new(config(1), master_endpoint, kernels(), tables(1))
        .await
        .unwrap_err();
    assert_eq!(kind_of(&err), Some(ErrorKind::Bootstrap));
}
