// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tables and the table registry.
//!
//! The master never sees table *contents*; it tracks one [`TableDescriptor`]
//! per registered table: shard count, a [`ShardLayout`] tag, and per-shard
//! partition metadata fed by [`ShardInfo`] reports from workers. Worker-side
//! storage hides behind the [`ShardedTable`] trait, which the engine drives
//! purely through opaque byte payloads; [`TypedTable`] layers serde-encoded
//! `(key, value)` pairs on top and is what kernels reach through the typed
//! accessor on [`crate::kernel::KernelContext`].

use std::any::{type_name, Any};
use std::collections::BTreeMap;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use bytes::Bytes;

use crate::protocols::{ShardInfo, TableId};
use crate::transports::Rank;

/// Layout tag for a table's shards. Typed kernel access dispatches on this
/// tag instead of downcasting blindly: a handle is only handed out when the
/// requested key/value types match the layout the table was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardLayout {
    /// Contents are opaque byte payloads; no typed access.
    Opaque,
    /// serde-encoded `(key, value)` pairs of the tagged types.
    KeyValue {
        key: &'static str,
        value: &'static str,
    },
}

impl ShardLayout {
    /// The layout tag for shards holding `(K, V)` pairs.
    pub fn keyed<K, V>() -> Self {
        ShardLayout::KeyValue {
            key: type_name::<K>(),
            value: type_name::<V>(),
        }
    }
}

/// Per-shard partition metadata maintained on the master.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Worker index currently holding the shard's data, once known.
    pub owner: Option<usize>,
    /// Number of entries last reported for the shard.
    pub entries: u64,
}

/// Master/worker context handed to tables before a run. Gives table code
/// access to where it is executing without a back-edge to the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableContext {
    pub rank: Rank,
    pub epoch: u64,
}

/// The master's view of one registered table.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    id: TableId,
    num_shards: usize,
    layout: ShardLayout,
    partitions: Vec<PartitionInfo>,
    context: Option<TableContext>,
}

impl TableDescriptor {
    /// Describe a table with opaque shard contents.
    pub fn new(id: TableId, num_shards: usize) -> Self {
        Self::with_layout(id, num_shards, ShardLayout::Opaque)
    }

    /// Describe a table whose shards hold `(K, V)` pairs, served worker-side
    /// by a [`TypedTable<K, V>`].
    pub fn keyed<K, V>(id: TableId, num_shards: usize) -> Self {
        Self::with_layout(id, num_shards, ShardLayout::keyed::<K, V>())
    }

    fn with_layout(id: TableId, num_shards: usize, layout: ShardLayout) -> Self {
        Self {
            id,
            num_shards,
            layout,
            partitions: vec![PartitionInfo::default(); num_shards],
            context: None,
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn layout(&self) -> ShardLayout {
        self.layout
    }

    /// Record partition metadata reported by a worker.
    pub fn update_partitions(&mut self, info: &ShardInfo) -> Result<()> {
        let slot = self.partitions.get_mut(info.shard).ok_or_else(|| {
            crate::error::EngineError::invariant(format!(
                "shard {} out of range for table {} ({} shards)",
                info.shard, self.id, self.num_shards
            ))
        })?;
        slot.owner = Some(info.owner);
        slot.entries = info.entries;
        Ok(())
    }

    pub fn partition(&self, shard: usize) -> Option<&PartitionInfo> {
        self.partitions.get(shard)
    }

    /// Attach the executing master's context. Refreshed at every run start.
    pub fn set_context(&mut self, context: TableContext) {
        self.context = Some(context);
    }

    pub fn context(&self) -> Option<TableContext> {
        self.context
    }
}

/// Id-keyed table registry. Iteration order is ascending by id, which keeps
/// placement deterministic.
#[derive(Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<TableId, TableDescriptor>,
}

impl TableRegistry {
    pub fn register(&mut self, descriptor: TableDescriptor) -> Result<()> {
        let id = descriptor.id();
        if self.tables.insert(id, descriptor).is_some() {
            return Err(
                crate::error::EngineError::config(format!("table {id} registered twice")).into(),
            );
        }
        Ok(())
    }

    pub fn get(&self, id: TableId) -> Option<&TableDescriptor> {
        self.tables.get(&id)
    }

    pub fn get_mut(&mut self, id: TableId) -> Option<&mut TableDescriptor> {
        self.tables.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TableId, &TableDescriptor)> {
        self.tables.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&TableId, &mut TableDescriptor)> {
        self.tables.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Worker-side sharded storage. Contents are opaque to the engine: updates
/// arrive as byte payloads and the only metadata surfaced back is an entry
/// count per shard. Implementations with a typed layout report it through
/// `layout()` so the kernel-facing accessor can hand out typed handles.
pub trait ShardedTable: Send {
    fn id(&self) -> TableId;

    fn num_shards(&self) -> usize;

    /// Apply one opaque update to a locally-held shard.
    fn apply(&mut self, shard: usize, payload: &[u8]) -> Result<()>;

    /// Number of entries resident in a locally-held shard.
    fn entries(&self, shard: usize) -> u64;

    /// Layout tag dispatched on by typed kernel access.
    fn layout(&self) -> ShardLayout {
        ShardLayout::Opaque
    }

    /// Downcast hook used once the layout tag has matched.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Worker-side storage for a table of `(K, V)` pairs, one ordered map per
/// shard. Updates on the wire are serde-encoded pairs produced by
/// [`TypedTable::update_payload`]; applying an update inserts the pair,
/// with the last write to a key winning.
pub struct TypedTable<K, V> {
    id: TableId,
    shards: Vec<BTreeMap<K, V>>,
}

impl<K, V> TypedTable<K, V>
where
    K: Ord + Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(id: TableId, num_shards: usize) -> Self {
        let mut shards = Vec::with_capacity(num_shards);
        shards.resize_with(num_shards, BTreeMap::new);
        Self { id, shards }
    }

    pub fn get(&self, shard: usize, key: &K) -> Option<&V> {
        self.shards.get(shard)?.get(key)
    }

    pub fn insert(&mut self, shard: usize, key: K, value: V) -> Result<()> {
        let slot = self.shard_mut(shard)?;
        slot.insert(key, value);
        Ok(())
    }

    /// Encode one `(key, value)` pair for
    /// [`crate::kernel::KernelContext::emit_update`].
    pub fn update_payload(key: &K, value: &V) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&(key, value))?))
    }

    fn shard_mut(&mut self, shard: usize) -> Result<&mut BTreeMap<K, V>> {
        let num_shards = self.shards.len();
        let id = self.id;
        self.shards.get_mut(shard).ok_or_else(|| {
            crate::error::EngineError::invariant(format!(
                "shard {shard} out of range for table {id} ({num_shards} shards)"
            ))
            .into()
        })
    }
}

impl<K, V> ShardedTable for TypedTable<K, V>
where
    K: Ord + Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
{
    fn id(&self) -> TableId {
        self.id
    }

    fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn apply(&mut self, shard: usize, payload: &[u8]) -> Result<()> {
        let (key, value): (K, V) = serde_json::from_slice(payload)?;
        self.shard_mut(shard)?.insert(key, value);
        Ok(())
    }

    fn entries(&self, shard: usize) -> u64 {
        self.shards.get(shard).map_or(0, |s| s.len() as u64)
    }

    fn layout(&self) -> ShardLayout {
        ShardLayout::keyed::<K, V>()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
