//! Core data model shared by every Catga crate.
//!
//! Mirrors the role `fc-common` plays for the FlowCatalyst workspace: the
//! wire-free value types (`Message`, `Result`, `ErrorInfo`) that every other
//! crate depends on but that own no runtime behavior of their own.

pub mod logging;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Identity
// ============================================================================

/// Opaque 64-bit message identity. Produced by `catga-id::IdGenerator`; this
/// crate only needs the newtype, not the generator itself, to avoid a
/// dependency cycle between `catga-common` and `catga-id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// An identifier propagated across related messages for tracing, shared
/// across an entire causal chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl From<MessageId> for CorrelationId {
    fn from(id: MessageId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The id of the message that directly caused this one, for building causal
/// chains distinct from the broader correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CausationId(pub u64);

impl From<MessageId> for CausationId {
    fn from(id: MessageId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for CausationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata carried by every request/event dispatched through the mediator.
///
/// The mediator treats `message_id` as opaque but requires uniqueness within
/// the process lifetime; that uniqueness is the caller's responsibility
/// (normally satisfied by stamping ids from a single shared `IdGenerator`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMeta {
    pub message_id: MessageId,
    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,
}

impl MessageMeta {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            correlation_id: None,
            causation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation(mut self, causation_id: CausationId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Effective correlation id: the explicit one if set, else this
    /// message's own id (a message correlates with itself until told
    /// otherwise), matching `fc-platform::ExecutionContext::create`'s rule
    /// that correlation starts as the execution id for fresh requests.
    pub fn effective_correlation_id(&self) -> CorrelationId {
        self.correlation_id
            .unwrap_or(CorrelationId(self.message_id.0))
    }
}

/// A value dispatched through the mediator as a request/event. Every
/// concrete request or event type implements this to expose its identity.
pub trait Message {
    fn meta(&self) -> &MessageMeta;
}

/// A message whose dispatch must resolve exactly one handler and produce a
/// `Result<Self::Reply>`.
pub trait Request: Message + Send + Sync + 'static {
    type Reply: Send + Sync + 'static;
}

/// A message dispatched to zero or more handlers with no return value.
pub trait Event: Message + Send + Sync + Clone + 'static {}

/// Per-shard key for auto-batched requests. Keyless request types route to
/// a single default shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey(pub Arc<str>);

impl BatchKey {
    pub const DEFAULT: &'static str = "__default__";

    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn default_key() -> Self {
        Self(Arc::from(Self::DEFAULT))
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-type auto-batching configuration (spec §6 registration API defaults).
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub max_queue_length: usize,
    pub flush_degree: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            batch_timeout: Duration::from_millis(10),
            max_queue_length: 10_000,
            flush_degree: 0,
        }
    }
}

/// Implemented by request types that opt into auto-batching. The mediator
/// checks for this via the `AutoBatched` marker trait rather than a runtime
/// flag, so the batching decision is a compile-time property of the request
/// type (spec §4.4 step 2: "If the request type declares auto-batching").
pub trait AutoBatched: Request {
    fn batch_options() -> BatchOptions {
        BatchOptions::default()
    }

    /// Shard key for this particular request instance. Keyless types can
    /// rely on the default implementation.
    fn batch_key(&self) -> BatchKey {
        BatchKey::default_key()
    }
}

// ============================================================================
// Result / ErrorInfo
// ============================================================================

/// Enumerated error classification (spec §4.10 / §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidArgument,
    HandlerNotFound,
    ValidationFailed,
    PipelineDepthExceeded,
    Cancelled,
    Timeout,
    ConcurrencyConflict,
    QueueOverflow,
    ClockBackwards,
    Transient,
    Internal,
}

impl ErrorCode {
    /// Whether this error kind is, by default, safe to retry. Individual
    /// `ErrorInfo` values may still override `is_transient` explicitly.
    pub fn default_is_transient(self) -> bool {
        matches!(
            self,
            ErrorCode::Cancelled
                | ErrorCode::Timeout
                | ErrorCode::QueueOverflow
                | ErrorCode::Transient
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A classified failure. `Cause` is `Arc`-wrapped so that wrapping a failure
/// (e.g. PipelineExecutor catching a downstream Failure) never deep-clones
/// the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    pub is_transient: bool,
    #[serde(skip)]
    pub cause: Option<Arc<ErrorInfo>>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            is_transient: code.default_is_transient(),
            code,
            message,
            cause: None,
        }
    }

    pub fn transient(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            is_transient: true,
            ..Self::new(code, message)
        }
    }

    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn handler_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::HandlerNotFound, message)
    }

    pub fn pipeline_depth_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PipelineDepthExceeded, message)
    }

    pub fn cancelled() -> Self {
        Self::transient(ErrorCode::Cancelled, "operation was cancelled")
    }

    pub fn queue_overflow() -> Self {
        Self::transient(ErrorCode::QueueOverflow, "auto-batch queue overflowed")
    }

    pub fn clock_backwards() -> Self {
        Self::new(ErrorCode::ClockBackwards, "system clock moved backwards")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Value-or-failure carrier (spec §3/§4.10). Deliberately not a type alias
/// for `std::result::Result` so the public API surface exposes explicit
/// `IsSuccess`/`Value`/`Error` accessors; `into_std`/`From` bridge the two
/// for idiomatic `?`-based internal plumbing.
#[derive(Debug, Clone)]
pub enum CatgaResult<T> {
    Success(T),
    Failure(ErrorInfo),
}

pub use CatgaResult as Result;

impl<T> CatgaResult<T> {
    pub fn ok(value: T) -> Self {
        CatgaResult::Success(value)
    }

    pub fn err(error: ErrorInfo) -> Self {
        CatgaResult::Failure(error)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CatgaResult::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CatgaResult::Failure(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            CatgaResult::Success(v) => Some(v),
            CatgaResult::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            CatgaResult::Success(_) => None,
            CatgaResult::Failure(e) => Some(e),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CatgaResult<U> {
        match self {
            CatgaResult::Success(v) => CatgaResult::Success(f(v)),
            CatgaResult::Failure(e) => CatgaResult::Failure(e),
        }
    }

    pub fn map_err(self, f: impl FnOnce(ErrorInfo) -> ErrorInfo) -> CatgaResult<T> {
        match self {
            CatgaResult::Success(v) => CatgaResult::Success(v),
            CatgaResult::Failure(e) => CatgaResult::Failure(f(e)),
        }
    }

    pub fn into_std(self) -> std::result::Result<T, ErrorInfo> {
        match self {
            CatgaResult::Success(v) => Ok(v),
            CatgaResult::Failure(e) => Err(e),
        }
    }
}

impl<T> From<std::result::Result<T, ErrorInfo>> for CatgaResult<T> {
    fn from(r: std::result::Result<T, ErrorInfo>) -> Self {
        match r {
            Ok(v) => CatgaResult::Success(v),
            Err(e) => CatgaResult::Failure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_roundtrips_through_std_result() {
        let r: CatgaResult<i32> = CatgaResult::ok(5);
        assert!(r.is_success());
        assert_eq!(r.into_std().unwrap(), 5);

        let r: CatgaResult<i32> = CatgaResult::err(ErrorInfo::invalid_argument("bad"));
        assert!(r.is_failure());
        assert_eq!(r.into_std().unwrap_err().code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn error_default_transience_matches_taxonomy() {
        assert!(ErrorInfo::cancelled().is_transient);
        assert!(ErrorInfo::queue_overflow().is_transient);
        assert!(!ErrorInfo::invalid_argument("x").is_transient);
        assert!(!ErrorInfo::handler_not_found("x").is_transient);
    }

    #[test]
    fn effective_correlation_id_defaults_to_message_id() {
        let meta = MessageMeta::new(MessageId(42));
        assert_eq!(meta.effective_correlation_id(), CorrelationId(42));

        let meta = meta.with_correlation(CorrelationId(7));
        assert_eq!(meta.effective_correlation_id(), CorrelationId(7));
    }

    #[test]
    fn cause_chain_preserves_root_code() {
        let root = ErrorInfo::new(ErrorCode::Timeout, "upstream timed out");
        let wrapped = ErrorInfo::internal("pipeline failed").with_cause(root);
        assert_eq!(wrapped.cause.as_ref().unwrap().code, ErrorCode::Timeout);
    }
}
