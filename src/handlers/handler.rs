//! # Handler abstraction and the closure-backed handler.
//!
//! A [`Handler`] turns one delivery (context + body) into a [`DispatchOutcome`].
//! It never touches the channel: acknowledgement and replies belong to the
//! dispatch engine. [`HandlerRef`] is the shared handle the workers hold.
//!
//! ## Example
//! ```rust
//! use rabbitvisor::{DispatchOutcome, ExecutionContext, HandlerFn, HandlerRef};
//!
//! let upper: HandlerRef = HandlerFn::arc("upper", |_ctx: ExecutionContext, body: Vec<u8>| async move {
//!     DispatchOutcome::success(body.to_ascii_uppercase())
//! });
//! assert_eq!(upper.name(), "upper");
//! ```

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::{DispatchOutcome, ExecutionContext};

/// Processes one delivery.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Stable name for logs and events.
    fn name(&self) -> &str;

    /// Runs the handler. Failures are reported through the outcome, never by panicking.
    async fn invoke(&self, ctx: &ExecutionContext, body: &[u8]) -> DispatchOutcome;
}

/// Shared handler handle.
pub type HandlerRef = Arc<dyn Handler>;

/// Closure-backed handler. The closure gets owned copies and returns a fresh future per delivery.
#[derive(Debug)]
pub struct HandlerFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> HandlerFn<F> {
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self { name: name.into(), f }
    }

    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(ExecutionContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchOutcome> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: &ExecutionContext, body: &[u8]) -> DispatchOutcome {
        (self.f)(ctx.clone(), body.to_vec()).await
    }
}
