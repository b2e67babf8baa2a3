// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernels and the kernel registry.
//!
//! A kernel is user code bound to a name. Each worker instantiates the
//! kernel through its registered factory and invokes one named method per
//! dispatched shard. Registration is an explicit phase that runs before the
//! master or any worker is constructed; the registry is then threaded
//! through as a plain value.
//!
//! ```ignore
//! #[derive(Default)]
//! struct PageRank;
//!
//! impl Kernel for PageRank {
//!     fn as_any_mut(&mut self) -> &mut dyn Any { self }
//! }
//!
//! fn propagate(kernel: &mut PageRank, ctx: &mut KernelContext) -> Result<()> { ... }
//!
//! let mut kernels = KernelRegistry::default();
//! kernels.register(
//!     KernelInfo::of::<PageRank>("PageRank").with_method("propagate", propagate),
//! )?;
//! ```

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::EngineError;
use crate::protocols::{TableId, TableUpdate};
use crate::table::{ShardLayout, ShardedTable, TypedTable};

/// User-supplied per-shard compute. Implementations must be `Default` to be
/// registered through [`KernelInfo::of`].
pub trait Kernel: Send {
    /// Downcast hook used by typed method invokers.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Called once after construction, before any method runs.
    fn init(&mut self, _ctx: &mut KernelContext) -> Result<()> {
        Ok(())
    }
}

/// Execution context handed to a kernel method: the shard being processed,
/// the worker's local tables, and an emitter for cross-shard updates.
pub struct KernelContext<'a> {
    table: TableId,
    shard: usize,
    tables: &'a mut HashMap<TableId, Box<dyn ShardedTable>>,
    outbox: &'a mut VecDeque<TableUpdate>,
}

impl<'a> KernelContext<'a> {
    pub fn new(
        table: TableId,
        shard: usize,
        tables: &'a mut HashMap<TableId, Box<dyn ShardedTable>>,
        outbox: &'a mut VecDeque<TableUpdate>,
    ) -> Self {
        Self {
            table,
            shard,
            tables,
            outbox,
        }
    }

    /// The table being processed.
    pub fn current_table(&self) -> TableId {
        self.table
    }

    /// The shard being processed.
    pub fn current_shard(&self) -> usize {
        self.shard
    }

    /// Mutable access to a locally-served table, if this worker holds it.
    pub fn table_mut(&mut self, id: TableId) -> Option<&mut (dyn ShardedTable + 'static)> {
        self.tables.get_mut(&id).map(|t| t.as_mut())
    }

    /// Typed access to a locally-served `(K, V)` table.
    ///
    /// Dispatches on the table's [`ShardLayout`] tag: the handle is only
    /// returned when the requested key/value types match the layout the
    /// table was built with. A layout mismatch yields `None`, same as an
    /// unserved table.
    pub fn table<K, V>(&mut self, id: TableId) -> Option<&mut TypedTable<K, V>>
    where
        K: Ord + Serialize + DeserializeOwned + Send + 'static,
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        let table = self.tables.get_mut(&id)?;
        if table.layout() != ShardLayout::keyed::<K, V>() {
            return None;
        }
        table.as_any_mut().downcast_mut::<TypedTable<K, V>>()
    }

    /// Queue one opaque update against `(table, shard)`. Updates become
    /// visible cluster-wide only after the run's flush/apply barrier.
    pub fn emit_update(&mut self, table: TableId, shard: usize, payload: Bytes) {
        self.outbox.push_back(TableUpdate {
            table,
            shard,
            payload,
        });
    }
}

type KernelFactory = Arc<dyn Fn() -> Box<dyn Kernel> + Send + Sync>;
type KernelMethod = Arc<dyn Fn(&mut dyn Kernel, &mut KernelContext) -> Result<()> + Send + Sync>;

/// A registered kernel: its factory plus its named methods.
#[derive(Clone)]
pub struct KernelInfo {
    name: String,
    factory: KernelFactory,
    methods: HashMap<String, KernelMethod>,
}

impl KernelInfo {
    /// Describe kernel type `K` under `name`.
    pub fn of<K: Kernel + Default + 'static>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory: Arc::new(|| Box::new(K::default())),
            methods: HashMap::new(),
        }
    }

    /// Bind `method` to a typed function on kernel type `K`.
    pub fn with_method<K: Kernel + 'static>(
        mut self,
        method: impl Into<String>,
        f: fn(&mut K, &mut KernelContext) -> Result<()>,
    ) -> Self {
        let method = method.into();
        let wrapper: KernelMethod = Arc::new(move |kernel, ctx| {
            let kernel = kernel
                .as_any_mut()
                .downcast_mut::<K>()
                .ok_or_else(|| EngineError::invariant("kernel instance has the wrong type"))?;
            f(kernel, ctx)
        });
        self.methods.insert(method, wrapper);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `method` is registered on this kernel.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Instantiate the kernel.
    pub fn create(&self) -> Box<dyn Kernel> {
        (self.factory)()
    }

    /// Invoke a registered method on a kernel instance.
    pub fn run(
        &self,
        kernel: &mut dyn Kernel,
        method: &str,
        ctx: &mut KernelContext,
    ) -> Result<()> {
        let invoke = self.methods.get(method).ok_or_else(|| {
            EngineError::config(format!("kernel '{}' has no method '{method}'", self.name))
        })?;
        invoke(kernel, ctx)
    }
}

/// Name-keyed kernel registry. Duplicate registration of a kernel name is a
/// configuration error.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, KernelInfo>,
}

impl KernelRegistry {
    pub fn register(&mut self, info: KernelInfo) -> Result<()> {
        let name = info.name().to_string();
        if self.kernels.insert(name.clone(), info).is_some() {
            return Err(EngineError::config(format!(
                "kernel '{name}' registered twice"
            ))
            .into());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&KernelInfo> {
        self.kernels.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{kind_of, ErrorKind};

    #[derive(Default)]
    struct Countdown {
        remaining: u32,
    }

    impl Kernel for Countdown {
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }

        fn init(&mut self, _ctx: &mut KernelContext) -> Result<()> {
            self.remaining = 3;
            Ok(())
        }
    }

    fn tick(kernel: &mut Countdown, _ctx: &mut KernelContext) -> Result<()> {
        kernel.remaining -= 1;
        Ok(())
    }

    fn emit(kernel: &mut Countdown, ctx: &mut KernelContext) -> Result<()> {
        let shard = ctx.current_shard();
        ctx.emit_update(ctx.current_table(), shard + 1, Bytes::from_static(b"x"));
        let _ = kernel;
        Ok(())
    }

    fn registry() -> KernelRegistry {
        let mut kernels = KernelRegistry::default();
        kernels
            .register(
                KernelInfo::of::<Countdown>("Countdown")
                    .with_method("tick", tick)
                    .with_method("emit", emit),
            )
            .unwrap();
        kernels
    }

    fn with_ctx<R>(f: impl FnOnce(&mut KernelContext) -> R) -> R {
        let mut tables = HashMap::new();
        let mut outbox = VecDeque::new();
        let mut ctx = KernelContext::new(0, 0, &mut tables, &mut outbox);
        f(&mut ctx)
    }

    #[test]
    fn test_create_init_and_run() {
        let kernels = registry();
        let info = kernels.get("Countdown").unwrap();
        assert!(info.has_method("tick"));
        assert!(!info.has_method("missing"));

        let mut kernel = info.create();
        with_ctx(|ctx| {
            kernel.init(ctx).unwrap();
            info.run(kernel.as_mut(), "tick", ctx).unwrap();
        });
        let countdown = kernel.as_any_mut().downcast_mut::<Countdown>().unwrap();
        assert_eq!(countdown.remaining, 2);
    }

    #[test]
    fn test_emitted_updates_land_in_outbox() {
        let kernels = registry();
        let info = kernels.get("Countdown").unwrap();
        let mut kernel = info.create();

        let mut tables = HashMap::new();
        let mut outbox = VecDeque::new();
        {
            let mut ctx = KernelContext::new(2, 4, &mut tables, &mut outbox);
            info.run(kernel.as_mut(), "emit", &mut ctx).unwrap();
        }
        assert_eq!(outbox.len(), 1);
        let update = &outbox[0];
        assert_eq!(update.table, 2);
        assert_eq!(update.shard, 5);
    }

    #[test]
    fn test_typed_accessor_dispatches_on_layout() {
        let mut tables: HashMap<TableId, Box<dyn ShardedTable>> = HashMap::new();
        tables.insert(0, Box::new(TypedTable::<String, u64>::new(0, 2)));
        let mut outbox = VecDeque::new();
        let mut ctx = KernelContext::new(0, 0, &mut tables, &mut outbox);

        let table = ctx.table::<String, u64>(0).unwrap();
        table.insert(0, "hits".to_string(), 1).unwrap();

        // Wrong key/value types or an unserved table id yield nothing.
        assert!(ctx.table::<u64, u64>(0).is_none());
        assert!(ctx.table::<String, String>(0).is_none());
        assert!(ctx.table::<String, u64>(9).is_none());

        // The raw accessor still sees the same table.
        assert_eq!(ctx.table_mut(0).unwrap().entries(0), 1);
    }

    #[test]
    fn test_unknown_method_is_config_error() {
        let kernels = registry();
        let info = kernels.get("Countdown").unwrap();
        let mut kernel = info.create();
        let err = with_ctx(|ctx| info.run(kernel.as_mut(), "missing", ctx)).unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Config));
    }

    #[test]
    fn test_duplicate_registration_is_config_error() {
        let mut kernels = registry();
        let err = kernels
            .register(KernelInfo::of::<Countdown>("Countdown"))
            .unwrap_err();
        assert_eq!(kind_of(&err), Some(ErrorKind::Config));
    }
}
