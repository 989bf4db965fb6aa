//! Capability interfaces implemented by user code.
//!
//! Handlers are interface-shaped trait objects rather than structurally
//! matched closures, so the registry can enumerate and type-check them at
//! registration time.

use async_trait::async_trait;
use catga_common::{CatgaResult, Event, Request};

use crate::context::Context;

/// Resolves exactly one handler per `(Req, Req::Reply)` pair.
#[async_trait]
pub trait RequestHandler<Req: Request>: Send + Sync {
    async fn handle(&self, request: Req, ctx: &Context) -> CatgaResult<Req::Reply>;
}

/// Invoked with every request currently queued for a flush; must return a
/// result slice matching the input length one-for-one.
#[async_trait]
pub trait BatchHandler<Req: Request>: Send + Sync {
    async fn handle_batch(&self, requests: Vec<Req>, ctx: &Context) -> Vec<CatgaResult<Req::Reply>>;
}

/// Zero or more handlers may be registered for a given event type.
#[async_trait]
pub trait EventHandler<Evt: Event>: Send + Sync {
    async fn handle(&self, event: Evt, ctx: &Context);
}

/// A single link in the pipeline chain. `next` carries the remainder of the
/// chain (and ultimately the terminal handler); a behavior may call it zero
/// or more times, inspect/transform its result, or short-circuit without
/// calling it at all.
#[async_trait]
pub trait PipelineBehavior<Req: Request>: Send + Sync {
    async fn handle(
        &self,
        request: Req,
        ctx: &Context,
        next: crate::pipeline::Next<'_, Req>,
    ) -> CatgaResult<Req::Reply>;
}
