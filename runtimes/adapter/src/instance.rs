use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dop_shared::TaggedValue;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A language-specific object exposed through the adapter.
#[async_trait]
pub trait ComponentInstance: Send + Sync {
    /// Names of the callables this instance exposes.
    fn exported_methods(&self) -> Vec<String>;

    async fn call(&self, method: &str, params: Vec<TaggedValue>) -> Result<TaggedValue>;

    /// Bytes currently held by the instance, if it can tell.
    fn memory_usage(&self) -> u64 {
        0
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

type ImmediateFn = Arc<dyn Fn(Vec<TaggedValue>) -> Result<TaggedValue> + Send + Sync>;
type SuspendingFn = Arc<dyn Fn(Vec<TaggedValue>) -> BoxFuture<'static, Result<TaggedValue>> + Send + Sync>;
type CleanupFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Clone)]
enum Callable {
    Immediate(ImmediateFn),
    Suspending(SuspendingFn),
}

/// Explicit table of named callables.
#[derive(Clone, Default)]
pub struct FunctionTable {
    methods: HashMap<String, Callable>,
    cleanup: Option<CleanupFn>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous callable. It runs on the blocking pool so a
    /// timeout can release the caller even though the call itself keeps going.
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<TaggedValue>) -> Result<TaggedValue> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Callable::Immediate(Arc::new(f)));
        self
    }

    pub fn async_method<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<TaggedValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaggedValue>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapped: SuspendingFn = Arc::new(move |params| {
            let f = f.clone();
            Box::pin(async move { f(params).await })
        });
        self.methods.insert(name.into(), Callable::Suspending(wrapped));
        self
    }

    pub fn on_cleanup<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.cleanup = Some(Arc::new(f));
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

#[async_trait]
impl ComponentInstance for FunctionTable {
    fn exported_methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    async fn call(&self, method: &str, params: Vec<TaggedValue>) -> Result<TaggedValue> {
        let callable = self
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| anyhow!("no callable named '{}'", method))?;

        match callable {
            Callable::Immediate(f) => tokio::task::spawn_blocking(move || f(params))
                .await
                .map_err(|e| anyhow!("callable '{}' panicked: {}", method, e))?,
            Callable::Suspending(f) => f(params).await,
        }
    }

    async fn cleanup(&self) -> Result<()> {
        match &self.cleanup {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }
}
