//! An outbox record and its terminal/retryable status machine.

use catga_common::{CorrelationId, MessageId};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub message_id: MessageId,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub correlation_id: Option<CorrelationId>,
    pub metadata: Option<String>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    pub fn new(message_id: MessageId, message_type: impl Into<String>, payload: Vec<u8>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            message_type: message_type.into(),
            payload,
            correlation_id: None,
            metadata: None,
            status: OutboxStatus::Pending,
            retry_count: 0,
            max_retries,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}
