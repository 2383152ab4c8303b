//! Durable publish/subscribe over named subjects.
//!
//! Subjects are dot-separated tokens (`reelflow.uploaded`). Stream patterns
//! use `*` to match exactly one token and a trailing `>` to match one or
//! more remaining tokens.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

pub mod rabbitmq;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("failed to provision {0}")]
    Provision(String),

    #[error("no stream covers subject {0}")]
    NoStream(String),

    #[error("publish to {subject} was not confirmed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("failed to settle message: {0}")]
    Settle(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type BusResult<T> = Result<T, BusError>;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns once the broker has confirmed the message as persisted.
    async fn publish(&self, subject: &str, payload: &[u8]) -> BusResult<()>;
}

pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn EventPublisher,
    subject: &str,
    event: &T,
) -> BusResult<()> {
    let payload = serde_json::to_vec(event)?;
    bus.publish(subject, &payload).await
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> BusResult<()>;

    /// Negative acknowledgment: the broker redelivers the message.
    async fn nak(&self) -> BusResult<()>;
}

/// A delivered message. Dropping it without settling leaves it with the
/// broker, which redelivers once the consumer goes away or times out.
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl BusMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        delivery_attempt: u32,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            delivery_attempt,
            acker,
        }
    }

    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    pub async fn nak(self) -> BusResult<()> {
        self.acker.nak().await
    }
}

/// Consumer callback for a subscription group. The handler owns settlement:
/// it must call [`BusMessage::ack`] only after its side effects are durable.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: BusMessage);
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: BusMessage) {
        (**self).handle(message).await
    }
}

/// Whether `subject` falls under the stream `pattern`.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Translates a stream pattern into an AMQP topic binding key.
pub fn to_binding_key(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|token| if token == ">" { "#" } else { token })
        .collect::<Vec<_>>()
        .join(".")
}
