//! Step handler capability
//!
//! User step logic is registered as [`StepHandler`] implementations keyed by
//! slug. Handlers receive the merged task input and return their structured
//! output; any failure they report is contained by the worker and never
//! crosses the loop boundary.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

/// A named unit of user step logic.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The step slug this handler serves.
    fn slug(&self) -> &str;

    /// Execute one task. `input` is the merged run input and parent outputs;
    /// the returned value becomes the task output.
    async fn run(&self, input: Value) -> anyhow::Result<Value>;
}

type BoxedStepFn =
    Box<dyn Fn(Value) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> + Send + Sync>;

/// Adapts an async closure into a [`StepHandler`].
pub struct FnHandler {
    slug: String,
    f: BoxedStepFn,
}

impl FnHandler {
    pub fn new<F, Fut>(slug: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            slug: slug.into(),
            f: Box::new(move |input| Box::pin(f(input))),
        }
    }
}

#[async_trait]
impl StepHandler for FnHandler {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn run(&self, input: Value) -> anyhow::Result<Value> {
        (self.f)(input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fn_handler_passes_input_through() {
        let handler = FnHandler::new("echo", |input| async move { Ok(input) });
        assert_eq!(handler.slug(), "echo");
        let out = handler.run(json!({"k": 1})).await.unwrap();
        assert_eq!(out, json!({"k": 1}));
    }

    #[tokio::test]
    async fn fn_handler_surfaces_domain_errors() {
        let handler = FnHandler::new("boom", |_input| async move {
            Err(anyhow::anyhow!("boom"))
        });
        let err = handler.run(json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
