//! Public dispatch entry points.

use std::any::{Any, TypeId};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use catga_common::{CatgaResult, ErrorCode, ErrorInfo, Event, MessageId, Request};
use dashmap::DashMap;
use futures::future::join_all;
use futures::{FutureExt, Stream, StreamExt};
use tracing::Instrument;

use crate::context::Context;
use crate::handler::RequestHandler;
use crate::pipeline::PipelineExecutor;
use crate::registry::HandlerRegistry;
use crate::subscribers::Subscribers;

/// Delegate used by request types that declare auto-batching. `catga-batch`
/// implements this on top of its `AutoBatcher`; keeping the trait here (and
/// not in `catga-batch`) lets the mediator dispatch to a batch router
/// without depending on the batcher crate.
#[async_trait]
pub trait BatchRoute<Req: Request>: Send + Sync {
    async fn submit(&self, request: Req, ctx: &Context) -> CatgaResult<Req::Reply>;
}

#[derive(Debug, Clone, Copy)]
pub struct MediatorConfig {
    pub enable_logging: bool,
    pub enable_tracing: bool,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            enable_logging: true,
            enable_tracing: true,
        }
    }
}

#[derive(Default)]
struct HandlerCounters {
    invocations: AtomicU64,
    failures: AtomicU64,
}

/// A narrow health surface for the observability fields spec'd for the
/// mediator: per-handler invocation/failure counters, not a full breaker —
/// breaker policy belongs to a resilience behavior in the pipeline.
#[derive(Debug, Clone)]
pub struct HandlerHealth {
    pub request_type: &'static str,
    pub invocations: u64,
    pub failures: u64,
}

pub struct Mediator {
    registry: Arc<HandlerRegistry>,
    config: MediatorConfig,
    subscribers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    batch_routes: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    counters: DashMap<TypeId, (&'static str, Arc<HandlerCounters>)>,
}

impl Mediator {
    pub fn new(registry: Arc<HandlerRegistry>, config: MediatorConfig) -> Self {
        Self {
            registry,
            config,
            subscribers: DashMap::new(),
            batch_routes: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn register_batch_route<Req: Request>(&self, route: Arc<dyn BatchRoute<Req>>) {
        self.batch_routes.insert(TypeId::of::<Req>(), Arc::new(route));
    }

    pub fn subscribers<Evt: Event>(&self) -> Arc<Subscribers<Evt>> {
        self.subscribers
            .entry(TypeId::of::<Evt>())
            .or_insert_with(|| Arc::new(Arc::new(Subscribers::<Evt>::new())))
            .clone()
            .downcast::<Arc<Subscribers<Evt>>>()
            .expect("subscriber type map key collision")
            .as_ref()
            .clone()
    }

    fn counters_for<Req: Request>(&self) -> Arc<HandlerCounters> {
        self.counters
            .entry(TypeId::of::<Req>())
            .or_insert_with(|| (std::any::type_name::<Req>(), Arc::new(HandlerCounters::default())))
            .1
            .clone()
    }

    /// Snapshot of per-request-type invocation/failure counts recorded on
    /// the observability path. Empty until tracing/logging has been enabled
    /// and at least one dispatch has completed.
    pub fn health_snapshot(&self) -> Vec<HandlerHealth> {
        self.counters
            .iter()
            .map(|entry| {
                let (type_name, counters) = entry.value();
                HandlerHealth {
                    request_type: type_name,
                    invocations: counters.invocations.load(Ordering::Relaxed),
                    failures: counters.failures.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Resolve a single handler, run its pipeline, and return the Result.
    /// Rust's ownership model makes a "null check request" step unreachable: an
    /// owned `Req` value is never null.
    pub async fn send<Req: Request>(&self, request: Req, ctx: &Context) -> CatgaResult<Req::Reply> {
        if let Some(route) = self.batch_route::<Req>() {
            return route.submit(request, ctx).await;
        }

        if self.config.enable_tracing || self.config.enable_logging {
            self.send_observed(request, ctx).await
        } else {
            self.send_fast(request, ctx).await
        }
    }

    fn batch_route<Req: Request>(&self) -> Option<Arc<dyn BatchRoute<Req>>> {
        self.batch_routes.get(&TypeId::of::<Req>()).map(|entry| {
            entry
                .clone()
                .downcast::<Arc<dyn BatchRoute<Req>>>()
                .expect("batch route type map key collision")
                .as_ref()
                .clone()
        })
    }

    async fn send_fast<Req: Request>(&self, request: Req, ctx: &Context) -> CatgaResult<Req::Reply> {
        self.dispatch::<Req>(request, ctx).await
    }

    async fn send_observed<Req: Request>(&self, request: Req, ctx: &Context) -> CatgaResult<Req::Reply> {
        let type_name = std::any::type_name::<Req>();
        let span = tracing::info_span!("catga.send", request_type = type_name, message_id = %ctx.message_id);
        let counters = self.counters_for::<Req>();
        let started = std::time::Instant::now();

        let result = self.dispatch::<Req>(request, ctx).instrument(span).await;

        let elapsed = started.elapsed();
        counters.invocations.fetch_add(1, Ordering::Relaxed);
        if result.is_failure() {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }

        if self.config.enable_logging {
            match &result {
                CatgaResult::Success(_) => {
                    tracing::info!(request_type = type_name, elapsed_us = elapsed.as_micros() as u64, "dispatch succeeded");
                }
                CatgaResult::Failure(e) => {
                    tracing::warn!(request_type = type_name, elapsed_us = elapsed.as_micros() as u64, code = %e.code, "dispatch failed");
                }
            }
        }

        metrics::counter!("catga_commands_executed_total", "request_type" => type_name).increment(1);
        metrics::histogram!("catga_command_duration_seconds", "request_type" => type_name)
            .record(elapsed.as_secs_f64());

        result
    }

    /// Shared resolution + pipeline execution used by both dispatch paths.
    async fn dispatch<Req: Request>(&self, request: Req, ctx: &Context) -> CatgaResult<Req::Reply> {
        let handler = match self.registry.resolve_request_handler::<Req>(ctx).into_std() {
            Ok(h) => h,
            Err(e) => return CatgaResult::err(e),
        };
        let behaviors = self.registry.resolve_behaviors::<Req>();

        let outcome = AssertUnwindSafe(PipelineExecutor::run(
            &behaviors,
            handler.as_ref() as &(dyn RequestHandler<Req> + Send + Sync),
            request,
            ctx,
        ))
        .catch_unwind()
        .await;

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(&panic);
                tracing::error!(request_type = std::any::type_name::<Req>(), %message, "handler panicked");
                CatgaResult::err(ErrorInfo::new(
                    ErrorCode::Internal,
                    format!("handler panicked: {message}"),
                ))
            }
        }
    }

    /// Fan out to every registered handler for `Evt`. Zero handlers returns
    /// immediately; one handler is invoked directly to avoid the allocation
    /// a snapshot clone would otherwise cost; N > 1 run concurrently with
    /// bounded fan-out. `Subscribers::publish` catches a panic from each
    /// handler individually, so one handler panicking neither cancels its
    /// peers nor propagates out of `publish` — there is no `CatgaResult`
    /// here to carry the failure through, so it is logged and metered
    /// instead.
    pub async fn publish<Evt: Event>(&self, event: Evt, ctx: &Context) {
        if ctx.is_cancelled() {
            return;
        }
        self.subscribers::<Evt>().publish(event, ctx).await;
        metrics::counter!("catga_events_published_total", "event_type" => std::any::type_name::<Evt>()).increment(1);
    }

    pub async fn send_batch<Req: Request>(
        &self,
        requests: Vec<Req>,
        ctx: &Context,
    ) -> Vec<CatgaResult<Req::Reply>> {
        join_all(requests.into_iter().map(|req| self.send::<Req>(req, ctx))).await
    }

    pub async fn publish_batch<Evt: Event>(&self, events: Vec<Evt>, ctx: &Context) {
        join_all(events.into_iter().map(|evt| self.publish::<Evt>(evt, ctx))).await;
    }

    /// Lazily maps a stream of requests into a stream of Results, reusing
    /// `send` per element. The mediator performs no buffering beyond
    /// whatever the AutoBatcher already bounds for auto-batched types.
    pub fn send_stream<'a, Req: Request>(
        &'a self,
        requests: impl Stream<Item = Req> + 'a,
        ctx: &'a Context,
    ) -> impl Stream<Item = CatgaResult<Req::Reply>> + 'a {
        requests.then(move |req| self.send::<Req>(req, ctx))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::EventHandler;
    use async_trait::async_trait;
    use catga_common::{Message, MessageMeta};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    struct Incr {
        meta: MessageMeta,
        delta: i64,
    }

    impl Message for Incr {
        fn meta(&self) -> &MessageMeta {
            &self.meta
        }
    }

    impl Request for Incr {
        type Reply = i64;
    }

    struct IncrHandler {
        total: Arc<AtomicI64>,
    }

    use std::sync::atomic::AtomicI64;

    #[async_trait]
    impl RequestHandler<Incr> for IncrHandler {
        async fn handle(&self, req: Incr, _ctx: &Context) -> CatgaResult<i64> {
            let new_total = self.total.fetch_add(req.delta, Ordering::SeqCst) + req.delta;
            CatgaResult::ok(new_total)
        }
    }

    fn incr(delta: i64) -> Incr {
        Incr {
            meta: MessageMeta::new(MessageId::new(1)),
            delta,
        }
    }

    #[tokio::test]
    async fn send_returns_handler_not_found_without_registration() {
        let mediator = Mediator::new(Arc::new(HandlerRegistry::new()), MediatorConfig::default());
        let ctx = Context::root(MessageId::new(1));
        let result = mediator.send::<Incr>(incr(1), &ctx).await;
        assert!(result.is_failure());
        assert_eq!(result.error().unwrap().code, ErrorCode::HandlerNotFound);
    }

    #[tokio::test]
    async fn concurrent_sends_sum_exactly() {
        let registry = Arc::new(HandlerRegistry::new());
        let total = Arc::new(AtomicI64::new(0));
        registry.register_handler::<Incr>(Arc::new(IncrHandler { total: total.clone() }));
        let mediator = Arc::new(Mediator::new(registry, MediatorConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mediator = mediator.clone();
            handles.push(tokio::spawn(async move {
                let ctx = Context::root(MessageId::new(1));
                for _ in 0..1_250 {
                    let result = mediator.send::<Incr>(incr(5), &ctx).await;
                    assert!(result.is_success());
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 8 * 1_250 * 5);
    }

    #[derive(Clone)]
    struct Pinged {
        meta: MessageMeta,
    }

    impl Message for Pinged {
        fn meta(&self) -> &MessageMeta {
            &self.meta
        }
    }

    impl Event for Pinged {}

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler<Pinged> for Counter {
        async fn handle(&self, _event: Pinged, _ctx: &Context) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn publish_invokes_every_subscriber() {
        let mediator = Mediator::new(Arc::new(HandlerRegistry::new()), MediatorConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        mediator.subscribers::<Pinged>().subscribe(Arc::new(Counter(count.clone())));
        mediator.subscribers::<Pinged>().subscribe(Arc::new(Counter(count.clone())));

        let ctx = Context::root(MessageId::new(1));
        mediator
            .publish(
                Pinged {
                    meta: MessageMeta::new(MessageId::new(1)),
                },
                &ctx,
            )
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handler_panic_is_converted_to_internal_failure() {
        struct Panicker;

        #[async_trait]
        impl RequestHandler<Incr> for Panicker {
            async fn handle(&self, _req: Incr, _ctx: &Context) -> CatgaResult<i64> {
                panic!("boom");
            }
        }

        let registry = Arc::new(HandlerRegistry::new());
        registry.register_handler::<Incr>(Arc::new(Panicker));
        let mediator = Mediator::new(registry, MediatorConfig::default());
        let ctx = Context::root(MessageId::new(1));
        let result = mediator.send::<Incr>(incr(1), &ctx).await;
        assert!(result.is_failure());
        assert_eq!(result.error().unwrap().code, ErrorCode::Internal);
    }
}
