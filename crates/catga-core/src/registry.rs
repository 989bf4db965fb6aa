//! Type-indexed lookup of request/event handlers and pipeline behaviors.
//!
//! Handler *instances* are never memoized here beyond what a registered
//! lifetime calls for — only the *shape* of a handler key (behavior count,
//! whether a singleton fast path exists) is cached, so scoped/transient DI
//! lifetimes configured by the host are preserved.

use std::any::{Any, TypeId};
use std::sync::Arc;

use catga_common::{CatgaResult, ErrorInfo, Request};
use dashmap::DashMap;

use crate::context::Context;
use crate::handler::{BatchHandler, PipelineBehavior, RequestHandler};

/// How a handler factory's output is shared across resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance for the process lifetime.
    Singleton,
    /// One instance per `Context`/`Scope`, memoized in `ctx.scope()`.
    Scoped,
    /// A fresh instance on every resolution.
    Transient,
}

type Handler<Req> = Arc<dyn RequestHandler<Req>>;
type Factory<Req> = Arc<dyn Fn() -> Handler<Req> + Send + Sync>;

struct RequestRegistration<Req: Request> {
    lifetime: Lifetime,
    singleton: Option<Handler<Req>>,
    factory: Option<Factory<Req>>,
}

/// Memoized shape of a handler key, safe to cache because it never exposes
/// an actual handler instance.
#[derive(Debug, Clone, Copy)]
pub struct HandlerShape {
    pub behavior_count: usize,
    pub has_singleton_fast_path: bool,
}

#[derive(Default)]
pub struct HandlerRegistry {
    requests: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    batch_handlers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    behaviors: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    shape_cache: DashMap<TypeId, HandlerShape>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler<Req: Request>(&self, handler: Arc<dyn RequestHandler<Req>>) {
        self.insert_registration::<Req>(RequestRegistration {
            lifetime: Lifetime::Singleton,
            singleton: Some(handler),
            factory: None,
        });
    }

    pub fn register_handler_factory<Req: Request>(
        &self,
        lifetime: Lifetime,
        factory: impl Fn() -> Arc<dyn RequestHandler<Req>> + Send + Sync + 'static,
    ) {
        assert_ne!(
            lifetime,
            Lifetime::Singleton,
            "singleton handlers must be registered via register_handler with a concrete instance"
        );
        self.insert_registration::<Req>(RequestRegistration {
            lifetime,
            singleton: None,
            factory: Some(Arc::new(factory)),
        });
    }

    fn insert_registration<Req: Request>(&self, registration: RequestRegistration<Req>) {
        self.requests
            .insert(TypeId::of::<Req>(), Arc::new(registration));
        self.shape_cache.remove(&TypeId::of::<Req>());
    }

    pub fn register_batch_handler<Req: Request>(&self, handler: Arc<dyn BatchHandler<Req>>) {
        self.batch_handlers.insert(TypeId::of::<Req>(), Arc::new(handler));
    }

    pub fn resolve_batch_handler<Req: Request>(&self) -> Option<Arc<dyn BatchHandler<Req>>> {
        self.batch_handlers
            .get(&TypeId::of::<Req>())
            .map(|entry| {
                entry
                    .clone()
                    .downcast::<Arc<dyn BatchHandler<Req>>>()
                    .expect("batch handler type map key collision")
                    .as_ref()
                    .clone()
            })
    }

    pub fn register_behavior<Req: Request>(&self, behavior: Arc<dyn PipelineBehavior<Req>>) {
        let key = TypeId::of::<Req>();
        let entry = self
            .behaviors
            .entry(key)
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(Vec::<Arc<dyn PipelineBehavior<Req>>>::new())));
        let list = entry
            .clone()
            .downcast::<parking_lot::Mutex<Vec<Arc<dyn PipelineBehavior<Req>>>>>()
            .expect("behavior type map key collision");
        list.lock().push(behavior);
        self.shape_cache.remove(&key);
    }

    pub fn resolve_behaviors<Req: Request>(&self) -> Vec<Arc<dyn PipelineBehavior<Req>>> {
        match self.behaviors.get(&TypeId::of::<Req>()) {
            Some(entry) => {
                let list = entry
                    .clone()
                    .downcast::<parking_lot::Mutex<Vec<Arc<dyn PipelineBehavior<Req>>>>>()
                    .expect("behavior type map key collision");
                let cloned = list.lock().clone();
                cloned
            }
            None => Vec::new(),
        }
    }

    /// The shape for `Req`, computing and caching it on first access. A
    /// registry with no registration for `Req` yields an empty shape rather
    /// than an error — shape is advisory, resolution is where
    /// `HandlerNotFound` is surfaced.
    pub fn shape_for<Req: Request>(&self) -> HandlerShape {
        let key = TypeId::of::<Req>();
        if let Some(shape) = self.shape_cache.get(&key) {
            return *shape;
        }
        let behavior_count = self.resolve_behaviors::<Req>().len();
        let has_singleton_fast_path = self
            .requests
            .get(&key)
            .map(|entry| {
                entry
                    .clone()
                    .downcast::<RequestRegistration<Req>>()
                    .expect("request type map key collision")
                    .lifetime
                    == Lifetime::Singleton
            })
            .unwrap_or(false);
        let shape = HandlerShape {
            behavior_count,
            has_singleton_fast_path,
        };
        self.shape_cache.insert(key, shape);
        shape
    }

    /// Resolve the handler for `Req`, honoring its registered lifetime.
    /// Scoped instances are memoized on `ctx.scope()`; transient instances
    /// are constructed fresh every call.
    pub fn resolve_request_handler<Req: Request>(
        &self,
        ctx: &Context,
    ) -> CatgaResult<Arc<dyn RequestHandler<Req>>> {
        let registration = match self.requests.get(&TypeId::of::<Req>()) {
            Some(entry) => entry
                .clone()
                .downcast::<RequestRegistration<Req>>()
                .expect("request type map key collision"),
            None => {
                return CatgaResult::err(ErrorInfo::handler_not_found(format!(
                    "no handler registered for {}",
                    std::any::type_name::<Req>()
                )))
            }
        };

        let handler = match registration.lifetime {
            Lifetime::Singleton => registration
                .singleton
                .clone()
                .expect("singleton registration always carries an instance"),
            Lifetime::Transient => {
                let factory = registration
                    .factory
                    .clone()
                    .expect("non-singleton registration always carries a factory");
                factory()
            }
            Lifetime::Scoped => {
                let factory = registration
                    .factory
                    .clone()
                    .expect("non-singleton registration always carries a factory");
                let cached = ctx
                    .scope()
                    .get_or_create::<Handler<Req>>(move || Arc::new(factory()));
                (*cached).clone()
            }
        };

        CatgaResult::ok(handler)
    }
}
