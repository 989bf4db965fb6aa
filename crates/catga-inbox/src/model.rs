use chrono::{DateTime, Utc};

use catga_common::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Processing,
    Processed,
}

impl InboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InboxStatus::Processing => "processing",
            InboxStatus::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(InboxStatus::Processing),
            "processed" => Some(InboxStatus::Processed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub message_id: MessageId,
    pub message_type: String,
    pub status: InboxStatus,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub processing_result: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl InboxRecord {
    pub fn processed(message_id: MessageId, message_type: impl Into<String>, result: Vec<u8>) -> Self {
        Self {
            message_id,
            message_type: message_type.into(),
            status: InboxStatus::Processed,
            lock_expires_at: None,
            processing_result: Some(result),
            created_at: Utc::now(),
        }
    }
}
