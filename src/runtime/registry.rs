//! Name-keyed registries for activity and orchestration handlers.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::_typed_codec::{Codec, Json};
use crate::OrchestrationContext;

/// An activity implementation. Activities run outside the replay boundary:
/// they may do I/O, block, or never return.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

struct FnActivity<F>(F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

/// A deterministic orchestrator program.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

struct FnOrchestration<F>(F);

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.keys().cloned().collect();
        out.sort();
        out
    }
}

#[derive(Default)]
pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    /// Register a string-in/string-out activity.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    /// Register an activity with JSON-typed input and output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |raw: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&raw)?;
                let out = f(input).await?;
                Json::encode(&out)
            }
        })
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }
}

#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    inner: Arc<HashMap<String, Arc<dyn OrchestrationHandler>>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.inner.keys().cloned().collect();
        out.sort();
        out
    }
}

#[derive(Default)]
pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, Arc<dyn OrchestrationHandler>>,
}

impl OrchestrationRegistryBuilder {
    /// Register an orchestrator program by name.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnOrchestration(f)));
        self
    }

    /// Register an orchestrator with JSON-typed input and output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: OrchestrationContext, raw: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&raw)?;
                let out = f(ctx, input).await?;
                Json::encode(&out)
            }
        })
    }

    /// Fold another registry's handlers into this builder. Later
    /// registrations win on name collisions.
    pub fn merge(mut self, other: &OrchestrationRegistry) -> Self {
        for (name, handler) in other.inner.iter() {
            self.map.insert(name.clone(), handler.clone());
        }
        self
    }

    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }
}
