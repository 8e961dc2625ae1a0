//! Operator channel abstraction.
//!
//! The approval gate only needs three capabilities from a transport: post a
//! message (optionally with reply buttons), edit a message it posted, and
//! fetch replies newer than a cursor. [`telegram::TelegramNotifier`] is the
//! production transport; [`memory::MemoryNotifier`] backs the tests.

pub mod memory;
pub mod retry;
pub mod telegram;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Handle assigned by the transport to a sent message. Replies are
/// correlated to a challenge through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Offset of the next unseen update. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PollCursor(pub i64);

impl fmt::Display for PollCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One operator reply, in arrival order within its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The message this reply answers.
    pub target: MessageId,
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollBatch {
    pub cursor: PollCursor,
    pub replies: Vec<Reply>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {description}")]
    Api { code: i32, description: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid chat id: {0}")]
    InvalidChatId(String),
}

impl NotifyError {
    /// Transport failures are retried; a chat id that cannot be parsed will
    /// never start working.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidChatId(_))
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post `text`, offering `options` as selectable replies when non-empty.
    async fn send(&self, text: &str, options: &[String]) -> Result<MessageId, NotifyError>;

    /// Replace the text of a message previously returned by [`Notifier::send`].
    async fn edit(&self, message: MessageId, text: &str) -> Result<(), NotifyError>;

    /// Replies that arrived at or after `cursor`, plus the cursor to use next.
    async fn poll_since(&self, cursor: PollCursor) -> Result<PollBatch, NotifyError>;
}
