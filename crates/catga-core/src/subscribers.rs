//! Typed, immutable-snapshot subscriber sets for in-process event fan-out.
//!
//! Adds build a new `Vec` and swap the pointer with `rcu` (CAS-retry under
//! the hood, provided by `arc-swap`); reads load the current snapshot with a
//! single atomic load and iterate it without holding anything. This is the
//! only acceptable shape here — a `Vec` behind a lock taken on write and
//! skipped on read would let readers observe a torn list mid-resize.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use catga_common::Event;
use futures::stream::{self, StreamExt};
use futures::FutureExt;

use crate::context::Context;
use crate::handler::EventHandler;

/// How many subscriber invocations may be in flight at once during a single
/// `publish`. `0` means unbounded (all subscribers invoked concurrently).
const DEFAULT_FAN_OUT_CONCURRENCY: usize = 64;

pub struct Subscribers<Evt: Event> {
    handlers: ArcSwap<Vec<Arc<dyn EventHandler<Evt>>>>,
    fan_out_concurrency: usize,
}

impl<Evt: Event> Default for Subscribers<Evt> {
    fn default() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(Vec::new()),
            fan_out_concurrency: DEFAULT_FAN_OUT_CONCURRENCY,
        }
    }
}

impl<Evt: Event> Subscribers<Evt> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn EventHandler<Evt>>) {
        self.handlers.rcu(|current| {
            let mut next = (**current).clone();
            next.push(handler.clone());
            next
        });
    }

    pub fn len(&self) -> usize {
        self.handlers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every subscriber with the given event. Each invocation is
    /// wrapped in `catch_unwind`, so one handler panicking is caught and
    /// recorded without cancelling or even delaying its peers.
    pub async fn publish(&self, event: Evt, ctx: &Context) {
        let snapshot = self.handlers.load_full();
        match snapshot.len() {
            0 => {}
            1 => invoke_one(&snapshot[0], event, ctx).await,
            _ => {
                let concurrency = if self.fan_out_concurrency == 0 {
                    snapshot.len()
                } else {
                    self.fan_out_concurrency
                };
                stream::iter(snapshot.iter().cloned())
                    .for_each_concurrent(concurrency, |handler| {
                        let event = event.clone();
                        async move { invoke_one(&handler, event, ctx).await }
                    })
                    .await;
            }
        }
    }
}

/// Runs one subscriber's `handle`, catching a panic so it never propagates
/// past `publish` and takes down the handlers still to run.
async fn invoke_one<Evt: Event>(handler: &Arc<dyn EventHandler<Evt>>, event: Evt, ctx: &Context) {
    let outcome = AssertUnwindSafe(handler.handle(event, ctx)).catch_unwind().await;
    if let Err(panic) = outcome {
        let message = panic_message(&panic);
        let event_type = std::any::type_name::<Evt>();
        tracing::error!(event_type, %message, "event handler panicked");
        metrics::counter!("catga_event_handler_panics_total", "event_type" => event_type).increment(1);
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
    use async_trait::async_trait;
    use catga_common::{Message, MessageId, MessageMeta};
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn event() -> Pinged {
        Pinged {
            meta: MessageMeta::new(MessageId::new(1)),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_noop() {
        let subs = Subscribers::<Pinged>::new();
        subs.publish(event(), &Context::root(MessageId::new(1))).await;
    }

    #[tokio::test]
    async fn every_subscriber_observes_the_event() {
        let subs = Subscribers::<Pinged>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            subs.subscribe(Arc::new(Counter(counter.clone())));
        }
        subs.publish(event(), &Context::root(MessageId::new(1))).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    struct Panicker;

    #[async_trait]
    impl EventHandler<Pinged> for Panicker {
        async fn handle(&self, _event: Pinged, _ctx: &Context) {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn one_subscriber_panicking_does_not_stop_its_peers() {
        let subs = Subscribers::<Pinged>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        subs.subscribe(Arc::new(Counter(counter.clone())));
        subs.subscribe(Arc::new(Panicker));
        subs.subscribe(Arc::new(Counter(counter.clone())));

        subs.publish(event(), &Context::root(MessageId::new(1))).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn a_lone_panicking_subscriber_does_not_propagate() {
        let subs = Subscribers::<Pinged>::new();
        subs.subscribe(Arc::new(Panicker));
        subs.publish(event(), &Context::root(MessageId::new(1))).await;
    }

    #[test]
    fn subscribe_is_append_only_and_visible_immediately() {
        let subs = Subscribers::<Pinged>::new();
        assert_eq!(subs.len(), 0);
        subs.subscribe(Arc::new(Counter(Arc::new(AtomicUsize::new(0)))));
        assert_eq!(subs.len(), 1);
    }
}
