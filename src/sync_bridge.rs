//! Blocking facade for synchronous call-sites.

use crate::error::ArborError;
use crate::log::AsyncMode;
use crate::machine::command::Reply;
use crate::path::pattern::IntoPattern;
use crate::path::Path;
use crate::sproc::StandaloneFun;
use crate::term::{Term, TermPattern};
use crate::tree::props::NodeProps;
use crate::tx::TxMode;
use crate::{ArborInstance, DeleteOptions, GetOptions, PutOptions};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

pub fn block_on_arbor<F, T>(rt: &Handle, f: F) -> T
where
    F: Future<Output = T>,
{
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| rt.block_on(f)),
        Err(_) => rt.block_on(f),
    }
}

/// Synchronous wrapper over an [`ArborInstance`].
pub struct ArborSync {
    inner: Arc<ArborInstance>,
    rt: Handle,
}

impl ArborSync {
    pub fn new(inner: Arc<ArborInstance>, rt: Handle) -> Self {
        Self { inner, rt }
    }

    pub fn put(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        block_on_arbor(&self.rt, self.inner.put(pattern, data))
    }

    pub fn put_with(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
        options: PutOptions,
    ) -> Result<(Path, NodeProps), ArborError> {
        block_on_arbor(&self.rt, self.inner.put_with(pattern, data, options))
    }

    pub fn create(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        block_on_arbor(&self.rt, self.inner.create(pattern, data))
    }

    pub fn update(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        block_on_arbor(&self.rt, self.inner.update(pattern, data))
    }

    pub fn compare_and_swap(
        &self,
        pattern: impl IntoPattern,
        expected: TermPattern,
        data: impl Into<Term>,
    ) -> Result<(Path, NodeProps), ArborError> {
        block_on_arbor(&self.rt, self.inner.compare_and_swap(pattern, expected, data))
    }

    pub fn delete(
        &self,
        pattern: impl IntoPattern,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        block_on_arbor(&self.rt, self.inner.delete(pattern))
    }

    pub fn delete_with(
        &self,
        pattern: impl IntoPattern,
        options: DeleteOptions,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        block_on_arbor(&self.rt, self.inner.delete_with(pattern, options))
    }

    pub fn get(&self, pattern: impl IntoPattern) -> Result<(Path, NodeProps), ArborError> {
        block_on_arbor(&self.rt, self.inner.get(pattern))
    }

    pub fn get_with(
        &self,
        pattern: impl IntoPattern,
        options: GetOptions,
    ) -> Result<(Path, NodeProps), ArborError> {
        block_on_arbor(&self.rt, self.inner.get_with(pattern, options))
    }

    pub fn get_many(
        &self,
        pattern: impl IntoPattern,
    ) -> Result<BTreeMap<Path, NodeProps>, ArborError> {
        block_on_arbor(&self.rt, self.inner.get_many(pattern))
    }

    pub fn exists(&self, pattern: impl IntoPattern) -> Result<bool, ArborError> {
        block_on_arbor(&self.rt, self.inner.exists(pattern))
    }

    pub fn count(&self, pattern: impl IntoPattern) -> Result<u64, ArborError> {
        block_on_arbor(&self.rt, self.inner.count(pattern))
    }

    pub fn get_or(
        &self,
        pattern: impl IntoPattern,
        default: impl Into<Term>,
    ) -> Result<Term, ArborError> {
        block_on_arbor(&self.rt, self.inner.get_or(pattern, default))
    }

    pub fn put_async(
        &self,
        pattern: impl IntoPattern,
        data: impl Into<Term>,
        mode: AsyncMode,
    ) -> Result<(), ArborError> {
        block_on_arbor(&self.rt, self.inner.put_async(pattern, data, mode))
    }

    pub fn wait_for_async_reply(
        &self,
        correlation: u64,
        timeout: Duration,
    ) -> Result<Reply, ArborError> {
        block_on_arbor(
            &self.rt,
            self.inner.wait_for_async_reply(correlation, timeout),
        )
    }

    pub fn run_sproc(&self, pattern: impl IntoPattern, args: Term) -> Result<Term, ArborError> {
        block_on_arbor(&self.rt, self.inner.run_sproc(pattern, args))
    }

    pub fn transaction(&self, fun: &StandaloneFun, mode: TxMode) -> Result<Term, ArborError> {
        block_on_arbor(&self.rt, self.inner.transaction(fun, mode))
    }
}
