//! In-memory [`Notifier`] with operator simulation and failure injection.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{MessageId, Notifier, NotifyError, PollBatch, PollCursor, Reply};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: MessageId,
    pub text: String,
    pub options: Vec<String>,
}

impl SentMessage {
    /// Messages offering reply options are approval challenges; the rest
    /// are notices.
    pub fn is_challenge(&self) -> bool {
        !self.options.is_empty()
    }
}

#[derive(Default)]
struct State {
    next_message_id: i64,
    next_update_id: i64,
    sent: Vec<SentMessage>,
    edits: Vec<(MessageId, String)>,
    updates: Vec<(i64, Reply)>,
    polled_cursors: Vec<PollCursor>,
    fail_sends: u32,
    fail_edits: u32,
    fail_polls: u32,
    calls: usize,
}

#[derive(Default)]
pub struct MemoryNotifier {
    state: Mutex<State>,
    sent_signal: Notify,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an operator reply and return its update id.
    pub fn push_reply(&self, target: MessageId, payload: impl Into<String>) -> i64 {
        let mut state = self.state();
        let update_id = state.next_update_id;
        state.next_update_id += 1;
        state.updates.push((
            update_id,
            Reply {
                target,
                payload: payload.into(),
            },
        ));
        update_id
    }

    /// Id the next `send` will return.
    pub fn peek_next_message_id(&self) -> MessageId {
        MessageId(self.state().next_message_id)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state().sent.clone()
    }

    pub fn challenges(&self) -> Vec<SentMessage> {
        self.state().sent.iter().filter(|m| m.is_challenge()).cloned().collect()
    }

    pub fn notices(&self) -> Vec<SentMessage> {
        self.state().sent.iter().filter(|m| !m.is_challenge()).cloned().collect()
    }

    pub fn edits(&self) -> Vec<(MessageId, String)> {
        self.state().edits.clone()
    }

    /// Last text written to `id` by an edit.
    pub fn edited_text(&self, id: MessageId) -> Option<String> {
        self.state()
            .edits
            .iter()
            .rev()
            .find(|(target, _)| *target == id)
            .map(|(_, text)| text.clone())
    }

    pub fn polled_cursors(&self) -> Vec<PollCursor> {
        self.state().polled_cursors.clone()
    }

    /// Total number of send/edit/poll calls, failed ones included.
    pub fn call_count(&self) -> usize {
        self.state().calls
    }

    pub fn fail_next_sends(&self, n: u32) {
        self.state().fail_sends = n;
    }

    pub fn fail_next_edits(&self, n: u32) {
        self.state().fail_edits = n;
    }

    pub fn fail_next_polls(&self, n: u32) {
        self.state().fail_polls = n;
    }

    /// Wait until at least `count` challenges have been sent and return the
    /// `count`-th one.
    pub async fn wait_for_challenge(&self, count: usize) -> SentMessage {
        loop {
            let notified = self.sent_signal.notified();
            if let Some(found) = self.challenges().into_iter().nth(count.saturating_sub(1)) {
                return found;
            }
            notified.await;
        }
    }
}

fn injected(kind: &str) -> NotifyError {
    NotifyError::Api {
        code: 503,
        description: format!("injected {kind} failure"),
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, text: &str, options: &[String]) -> Result<MessageId, NotifyError> {
        let id = {
            let mut state = self.state();
            state.calls += 1;
            if take_failure(&mut state.fail_sends) {
                return Err(injected("send"));
            }
            let id = MessageId(state.next_message_id);
            state.next_message_id += 1;
            state.sent.push(SentMessage {
                id,
                text: text.to_string(),
                options: options.to_vec(),
            });
            id
        };
        self.sent_signal.notify_waiters();
        Ok(id)
    }

    async fn edit(&self, message: MessageId, text: &str) -> Result<(), NotifyError> {
        let mut state = self.state();
        state.calls += 1;
        if take_failure(&mut state.fail_edits) {
            return Err(injected("edit"));
        }
        if !state.sent.iter().any(|m| m.id == message) {
            return Err(NotifyError::Api {
                code: 400,
                description: format!("message {message} not found"),
            });
        }
        state.edits.push((message, text.to_string()));
        Ok(())
    }

    async fn poll_since(&self, cursor: PollCursor) -> Result<PollBatch, NotifyError> {
        let mut state = self.state();
        state.calls += 1;
        state.polled_cursors.push(cursor);
        if take_failure(&mut state.fail_polls) {
            return Err(injected("poll"));
        }

        let fresh: Vec<&(i64, Reply)> = state
            .updates
            .iter()
            .filter(|(update_id, _)| *update_id >= cursor.0)
            .collect();
        let next = fresh
            .last()
            .map(|(update_id, _)| PollCursor(update_id + 1))
            .unwrap_or(cursor);
        let replies = fresh.into_iter().map(|(_, reply)| reply.clone()).collect();

        Ok(PollBatch {
            cursor: next,
            replies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_returns_only_updates_at_or_after_cursor() {
        let notifier = MemoryNotifier::new();
        notifier.push_reply(MessageId(0), "No");
        notifier.push_reply(MessageId(0), "Yes");

        let all = notifier.poll_since(PollCursor(0)).await.unwrap();
        assert_eq!(all.replies.len(), 2);
        assert_eq!(all.cursor, PollCursor(2));

        let tail = notifier.poll_since(PollCursor(1)).await.unwrap();
        assert_eq!(tail.replies.len(), 1);
        assert_eq!(tail.replies[0].payload, "Yes");

        let empty = notifier.poll_since(PollCursor(2)).await.unwrap();
        assert!(empty.replies.is_empty());
        assert_eq!(empty.cursor, PollCursor(2));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let notifier = MemoryNotifier::new();
        notifier.fail_next_sends(1);
        tokio_test::assert_err!(notifier.send("hi", &[]).await);
        let id = tokio_test::assert_ok!(notifier.send("hi", &[]).await);
        assert_eq!(id, MessageId(0));
        assert_eq!(notifier.call_count(), 2);
    }

    #[tokio::test]
    async fn test_edit_unknown_message_fails() {
        let notifier = MemoryNotifier::new();
        assert!(notifier.edit(MessageId(9), "x").await.is_err());
    }
}
