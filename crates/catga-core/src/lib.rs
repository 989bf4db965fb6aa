//! In-process CQRS dispatch: handler registry, pipeline executor, mediator,
//! and the immutable-snapshot subscriber lists backing event fan-out.

pub mod context;
pub mod handler;
pub mod mediator;
pub mod pipeline;
pub mod registry;
pub mod subscribers;

pub use context::{CancellationToken, Context, Scope};
pub use handler::{BatchHandler, EventHandler, PipelineBehavior, RequestHandler};
pub use mediator::{BatchRoute, HandlerHealth, Mediator, MediatorConfig};
pub use pipeline::{Next, PipelineExecutor, MAX_PIPELINE_DEPTH};
pub use registry::{HandlerRegistry, HandlerShape, Lifetime};
pub use subscribers::Subscribers;
