// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport facade for the ranked peer set.
//!
//! The engine talks to its peers exclusively through the [`Transport`]
//! trait: typed point-to-point sends, worker broadcasts, an acknowledged
//! broadcast for placement changes, and a tag-filtered non-blocking
//! receive. Rank 0 is always the master; ranks `1..num_peers` are workers.
//!
//! The in-process mesh in [`local`] is the only implementation shipped with
//! the crate; it backs the test suite and single-process deployments. The
//! trait is the seam where a socket-backed implementation would plug in.

use anyhow::Result;
use async_trait::async_trait;

use crate::protocols::{Message, Tag};

pub mod local;

/// Peer rank. The master is always [`MASTER_RANK`].
pub type Rank = usize;

/// Rank of the master within the peer set.
pub const MASTER_RANK: Rank = 0;

/// Typed messaging over a fixed, ranked peer set.
#[async_trait]
pub trait Transport: Send + Sync {
    /// This peer's rank.
    fn rank(&self) -> Rank;

    /// Total number of peers, master included.
    fn num_peers(&self) -> usize;

    /// Send one message to `dest`.
    async fn send(&self, dest: Rank, msg: Message) -> Result<()>;

    /// Send one message to every worker rank.
    async fn broadcast(&self, msg: Message) -> Result<()>;

    /// Send one message to every worker rank and wait until each worker has
    /// acknowledged taking delivery of it.
    async fn sync_broadcast(&self, msg: Message) -> Result<()>;

    /// Non-blocking, tag-filtered receive. Returns the earliest queued
    /// message with the given tag, or `None` when nothing matches.
    fn try_recv(&self, tag: Tag) -> Option<(Rank, Message)>;

    /// Wait for the next message of any tag.
    async fn recv_any(&self) -> Result<(Rank, Message)>;
}
