// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Mosaic
//!
//! A distributed bulk-synchronous compute engine. User-defined kernels run
//! against sharded tables; a master (rank 0) places shards on a fixed fleet
//! of workers, dispatches one kernel invocation per shard, rebalances work
//! toward idle workers, and drives a flush/apply barrier that makes
//! cross-shard updates globally visible before a run returns.

pub use anyhow::{Context as ErrorContext, Error, Result};

pub mod config;
pub use config::EngineConfig;

pub mod error;
pub mod kernel;
pub mod logging;
pub mod master;
pub mod protocols;
pub mod table;
pub mod transports;
pub mod worker;

pub use error::{EngineError, ErrorKind};
pub use kernel::{Kernel, KernelContext, KernelInfo, KernelRegistry};
pub use master::{Master, RunDescriptor, RunDescriptorBuilder};
pub use protocols::{Message, ShardInfo, TableId, Tag};
pub use table::{ShardLayout, ShardedTable, TableDescriptor, TableRegistry, TypedTable};
pub use tokio_util::sync::CancellationToken;
pub use transports::{Transport, MASTER_RANK};
pub use worker::Worker;
