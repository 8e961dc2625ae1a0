use serde::{Deserialize, Serialize};

use crate::notification::{MessageId, PollCursor, Reply};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

/// The two selectable answers offered with a challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyOptions {
    pub approve: String,
    pub deny: String,
}

impl Default for ReplyOptions {
    fn default() -> Self {
        Self {
            approve: "Yes".to_string(),
            deny: "No".to_string(),
        }
    }
}

impl ReplyOptions {
    /// Ordered labels: approve first, deny second.
    pub fn labels(&self) -> Vec<String> {
        vec![self.approve.clone(), self.deny.clone()]
    }

    /// `None` for payloads that match neither label.
    pub fn decode(&self, payload: &str) -> Option<ApprovalStatus> {
        let payload = payload.trim();
        if payload.eq_ignore_ascii_case(&self.approve) {
            Some(ApprovalStatus::Approved)
        } else if payload.eq_ignore_ascii_case(&self.deny) {
            Some(ApprovalStatus::Denied)
        } else {
            None
        }
    }
}

/// One in-flight challenge. Lives for a single `resolve` call and is
/// dropped once a verdict is reached, so its message id is never reused.
#[derive(Debug)]
pub struct ApprovalRequest {
    pub challenge_text: String,
    pub reply_options: ReplyOptions,
    sent_message_id: MessageId,
    poll_cursor: PollCursor,
}

impl ApprovalRequest {
    pub fn new(
        challenge_text: String,
        reply_options: ReplyOptions,
        sent_message_id: MessageId,
        poll_cursor: PollCursor,
    ) -> Self {
        Self {
            challenge_text,
            reply_options,
            sent_message_id,
            poll_cursor,
        }
    }

    pub fn sent_message_id(&self) -> MessageId {
        self.sent_message_id
    }

    pub fn poll_cursor(&self) -> PollCursor {
        self.poll_cursor
    }

    /// Move the cursor forward. A transport reporting an older cursor does
    /// not move it back.
    pub fn advance(&mut self, cursor: PollCursor) {
        self.poll_cursor = self.poll_cursor.max(cursor);
    }

    /// Scan one batch newest-first and return the first recognized answer
    /// addressed to this challenge. Replies to other messages and payloads
    /// matching no label are skipped.
    pub fn evaluate(&self, replies: &[Reply]) -> ApprovalStatus {
        replies
            .iter()
            .rev()
            .filter(|reply| reply.target == self.sent_message_id)
            .find_map(|reply| {
                let status = self.reply_options.decode(&reply.payload);
                if status.is_none() {
                    tracing::debug!(
                        message_id = %self.sent_message_id,
                        payload = %reply.payload,
                        "ignoring unrecognized reply"
                    );
                }
                status
            })
            .unwrap_or(ApprovalStatus::Pending)
    }
}
