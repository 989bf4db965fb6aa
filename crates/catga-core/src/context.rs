//! Per-dispatch cancellation and dependency-injection scope.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use catga_common::{CausationId, CorrelationId, MessageId};

/// A cooperative cancellation signal shared by a dispatch and everything it
/// calls into. Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Context threaded through every public Mediator operation: carries the
/// cancellation signal and message identity, and doubles as the
/// dependency-injection scope handlers may use to resolve scoped
/// capabilities. Dropping the context releases every scoped instance it
/// produced, on every exit path (normal return, early `?`, or panic
/// unwind), because `Scope`'s contents are owned, not borrowed.
pub struct Context {
    pub message_id: MessageId,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
    cancellation: CancellationToken,
    scope: Scope,
}

impl Context {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            correlation_id: None,
            causation_id: None,
            cancellation: CancellationToken::new(),
            scope: Scope::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_correlation(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// A context with a fresh, uncancelled token and empty scope. Useful for
    /// the default, zero-ceremony call sites in tests and simple hosts.
    pub fn root(message_id: MessageId) -> Self {
        Self::new(message_id)
    }
}

/// Per-dispatch cache of scoped capability instances, keyed by type. A
/// handler registered with `Lifetime::Scoped` gets at most one instance per
/// `Scope`; `Lifetime::Singleton` instances bypass this cache entirely and
/// `Lifetime::Transient` instances are never cached here.
#[derive(Default)]
pub struct Scope {
    instances: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<T: Send + Sync + 'static>(
        &self,
        factory: impl FnOnce() -> Arc<T>,
    ) -> Arc<T> {
        if let Some(existing) = self.instances.get(&TypeId::of::<T>()) {
            return existing
                .clone()
                .downcast::<T>()
                .expect("scope type map key collision");
        }
        let created = factory();
        self.instances
            .insert(TypeId::of::<T>(), created.clone() as Arc<dyn Any + Send + Sync>);
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_token_reflects_across_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn scope_memoizes_per_type() {
        let scope = Scope::new();
        let calls = Arc::new(AtomicBool::new(false));
        let a = scope.get_or_create::<String>(|| Arc::new("first".to_string()));
        let b = scope.get_or_create::<String>(|| {
            calls.store(true, Ordering::SeqCst);
            Arc::new("second".to_string())
        });
        assert_eq!(*a, *b);
        assert!(!calls.load(Ordering::SeqCst), "factory must not rerun for a cached type");
    }
}
