//! Inbound requests as handed over by the proxy layer.

use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// Which way the payload is travelling relative to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Caller -> model (prompt)
    #[default]
    Inbound,
    /// Model -> caller (completion)
    Outbound,
}

/// Per-call hints for the detection engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionContext {
    /// Payload direction
    #[serde(default)]
    pub direction: Direction,
}

impl DetectionContext {
    /// Context for model output
    pub fn outbound() -> Self {
        Self {
            direction: Direction::Outbound,
        }
    }
}

/// A single payload to inspect.
#[derive(Debug, Clone)]
pub struct Request {
    correlation_id: Uuid,
    content: Bytes,
    content_type: String,
    context: DetectionContext,
    received_at: Instant,
    arrived: DateTime<Utc>,
}

impl Request {
    /// Create a request from raw bytes
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            content: content.into(),
            content_type: "text/plain".to_string(),
            context: DetectionContext::default(),
            received_at: Instant::now(),
            arrived: Utc::now(),
        }
    }

    /// Create a text request
    pub fn text(content: &str) -> Self {
        Self::new(Bytes::copy_from_slice(content.as_bytes()))
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set detection context
    pub fn with_context(mut self, context: DetectionContext) -> Self {
        self.context = context;
        self
    }

    /// Use a caller-supplied correlation ID
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    /// Correlation ID
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Raw content
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Content length in bytes
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// True when the content is empty
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Content type as supplied by the proxy
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Detection context
    pub fn context(&self) -> &DetectionContext {
        &self.context
    }

    /// Monotonic arrival instant
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// Wall-clock arrival time
    pub fn arrived(&self) -> DateTime<Utc> {
        self.arrived
    }

    /// SHA-256 fingerprint of the full content
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.content)
    }
}
