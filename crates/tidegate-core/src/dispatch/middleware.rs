//! Middleware pipeline around the terminal dispatch stage.
//!
//! A middleware receives the dispatch context and a [`Next`] continuation.
//! It must either call `next.run(ctx)` exactly once (possibly after
//! transforming the context) or short-circuit by returning without calling
//! it. Middlewares added with `use_pre` run before the terminal handler in
//! insertion order; middlewares added with `use_post` wrap the outbound
//! send in inverse insertion order (outermost last).

use std::sync::Arc;

use async_trait::async_trait;

use super::context::DispatchContext;
use crate::error::DispatchError;

/// One pipeline stage.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the context, calling `next` to continue the chain.
    async fn handle(
        &self,
        ctx: &mut DispatchContext,
        next: Next<'_>,
    ) -> Result<(), DispatchError>;
}

/// The innermost stage of a chain (the dispatch terminal or the send
/// terminal).
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Run the terminal stage.
    async fn call(&self, ctx: &mut DispatchContext) -> Result<(), DispatchError>;
}

/// Continuation handed to each middleware.
///
/// Calling [`run`](Self::run) advances to the next stage; dropping it
/// without calling short-circuits the chain.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    terminal: &'a (dyn Terminal + 'a),
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [Arc<dyn Middleware>], terminal: &'a (dyn Terminal + 'a)) -> Self {
        Self { stages, terminal }
    }

    /// Run the remaining stages and the terminal.
    pub async fn run(self, ctx: &mut DispatchContext) -> Result<(), DispatchError> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                stage.handle(ctx, Next { stages: rest, terminal: self.terminal }).await
            },
            None => self.terminal.call(ctx).await,
        }
    }
}
