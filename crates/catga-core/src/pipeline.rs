//! Bounded behavior chain around a terminal handler.

use std::sync::Arc;

use catga_common::{CatgaResult, ErrorInfo, Request};

use crate::context::Context;
use crate::handler::{PipelineBehavior, RequestHandler};

/// Behavior chains deeper than this are rejected outright rather than
/// invoked, guarding against runaway registration mistakes and unbounded
/// stack growth on the recursive implementation below.
pub const MAX_PIPELINE_DEPTH: usize = 100;

/// The remainder of a pipeline chain, handed to a behavior so it can
/// continue the invocation past itself. Each `Next` borrows the same
/// behavior slice and terminal handler as the executor that created it;
/// calling `run` advances one step, either into the next behavior or, once
/// the slice is exhausted, into the terminal handler.
pub struct Next<'a, Req: Request> {
    behaviors: &'a [Arc<dyn PipelineBehavior<Req>>],
    handler: &'a (dyn RequestHandler<Req> + Send + Sync),
}

impl<'a, Req: Request> Next<'a, Req> {
    pub async fn run(self, request: Req, ctx: &Context) -> CatgaResult<Req::Reply> {
        match self.behaviors.split_first() {
            Some((behavior, rest)) => {
                let next = Next {
                    behaviors: rest,
                    handler: self.handler,
                };
                behavior.handle(request, ctx, next).await
            }
            None => self.handler.handle(request, ctx).await,
        }
    }
}

/// Runs a fixed list of behaviors around a terminal handler. Stateless —
/// constructed fresh per dispatch from whatever behavior list the registry
/// resolved for that handler key.
pub struct PipelineExecutor;

impl PipelineExecutor {
    /// `behaviors.len() == 0` takes the fast path straight to the handler,
    /// with no `Next` indirection at all.
    pub async fn run<Req: Request>(
        behaviors: &[Arc<dyn PipelineBehavior<Req>>],
        handler: &(dyn RequestHandler<Req> + Send + Sync),
        request: Req,
        ctx: &Context,
    ) -> CatgaResult<Req::Reply> {
        if behaviors.len() > MAX_PIPELINE_DEPTH {
            return CatgaResult::err(ErrorInfo::pipeline_depth_exceeded(format!(
                "pipeline has {} behaviors, exceeding the maximum of {MAX_PIPELINE_DEPTH}",
                behaviors.len()
            )));
        }

        if behaviors.is_empty() {
            return handler.handle(request, ctx).await;
        }

        let next = Next { behaviors, handler };
        next.run(request, ctx).await
    }
}
