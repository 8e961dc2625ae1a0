//! Approval gate: challenge the operator and wait for a verdict.
//!
//! ```text
//! Idle ──token──▶ Admitted ──send──▶ ChallengeSent ──▶ Polling ──reply──▶ Resolved
//!   │                                                                      ▲
//!   └──────────────────────────── bypass ──────────────────────────────────┘
//! ```
//!
//! Any failure before a verdict (transport retries abandoned, deadline,
//! cancellation, panic) resolves to [`Decision::Error`], which rejects.
//! After resolution the challenge message is edited to show the outcome;
//! that edit is best-effort and cannot change the decision.

pub mod bypass;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::Local;
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::Cancellation;
use crate::errors::GateError;
use crate::models::approval::{ApprovalRequest, ApprovalStatus, ReplyOptions};
use crate::models::context::{challenge_text, ConnectionContext, HostInfo};
use crate::models::decision::Decision;
use crate::notification::retry::{request_with_retry, RetryPolicy};
use crate::notification::{MessageId, Notifier, PollCursor};
use crate::rate_limit::RateLimiter;

use self::bypass::BypassPolicy;

pub const RATE_LIMITED_NOTICE: &str = "You are trying too fast. Please wait.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Admitted,
    ChallengeSent,
    Polling,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct GateSettings {
    pub reply_options: ReplyOptions,
    pub poll_interval: Duration,
    pub rate_limit_interval: Duration,
    /// Policy for send/poll during the round. Unbounded by default; the
    /// [`Cancellation`] passed to [`ApprovalGate::resolve`] is what ends it.
    pub retry: RetryPolicy,
    /// Attempts for the post-resolution edit or error notice.
    pub finalize_attempts: u32,
    /// Overall time allowed for the post-resolution edit or notice.
    pub finalize_grace: Duration,
    pub bypass: BypassPolicy,
    pub host: HostInfo,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            reply_options: ReplyOptions::default(),
            poll_interval: Duration::from_secs(1),
            rate_limit_interval: Duration::from_secs(1),
            retry: RetryPolicy::unbounded(Duration::from_secs(1)),
            finalize_attempts: 3,
            finalize_grace: Duration::from_secs(10),
            bypass: BypassPolicy::default(),
            host: HostInfo::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub decision: Decision,
    /// Challenge message, if one was sent.
    pub message_id: Option<MessageId>,
    pub polls: u32,
    /// Last state reached before resolving.
    pub reached: GateState,
}

/// Progress shared across the unwind boundary so a panicking round still
/// leaves enough behind to notify the operator.
struct Progress {
    message_id: OnceLock<MessageId>,
    polls: AtomicU32,
    state: Mutex<GateState>,
}

impl Progress {
    fn new() -> Self {
        Self {
            message_id: OnceLock::new(),
            polls: AtomicU32::new(0),
            state: Mutex::new(GateState::Idle),
        }
    }

    fn enter(&self, next: GateState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        debug!(from = ?*state, to = ?next, "gate transition");
        *state = next;
    }

    fn state(&self) -> GateState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct ApprovalGate {
    notifier: Arc<dyn Notifier>,
    limiter: RateLimiter,
    settings: GateSettings,
}

impl ApprovalGate {
    pub fn new(notifier: Arc<dyn Notifier>, limiter: RateLimiter, settings: GateSettings) -> Self {
        Self {
            notifier,
            limiter,
            settings,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub async fn authenticate(&self, ctx: &ConnectionContext, cancel: &Cancellation) -> Decision {
        self.resolve(ctx, cancel).await.decision
    }

    #[instrument(
        skip_all,
        fields(
            attempt_id = %Uuid::new_v4(),
            user = ctx.user.as_deref().unwrap_or("-"),
            rhost = ctx.remote_host.as_deref().unwrap_or("-"),
        )
    )]
    pub async fn resolve(&self, ctx: &ConnectionContext, cancel: &Cancellation) -> Resolution {
        if let Some(reason) = self.settings.bypass.evaluate(ctx) {
            info!(?reason, "approval bypassed");
            return Resolution {
                decision: Decision::Forced,
                message_id: None,
                polls: 0,
                reached: GateState::Idle,
            };
        }

        let progress = Progress::new();
        let outcome = AssertUnwindSafe(self.run(ctx, cancel, &progress))
            .catch_unwind()
            .await;

        let reached = progress.state();
        let decision = match outcome {
            Ok(Ok(ApprovalStatus::Approved)) => Decision::Approved,
            Ok(Ok(ApprovalStatus::Denied)) => Decision::Denied,
            Ok(Ok(ApprovalStatus::Pending)) => {
                Decision::Error("round ended without a verdict".to_string())
            }
            Ok(Err(e)) => {
                error!(error = %e, state = ?reached, "approval round failed");
                Decision::Error(e.reason())
            }
            Err(panic) => {
                let e = GateError::Panicked(panic_message(panic.as_ref()));
                error!(error = %e, state = ?reached, "approval round panicked");
                Decision::Error(e.reason())
            }
        };
        progress.enter(GateState::Resolved);

        let message_id = progress.message_id.get().copied();
        info!(decision = %decision, message_id = ?message_id, "approval resolved");

        if AssertUnwindSafe(self.finalize(ctx, &decision, message_id))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!("finalizing notification panicked");
        }

        Resolution {
            decision,
            message_id,
            polls: progress.polls.load(Ordering::Relaxed),
            reached,
        }
    }

    async fn run(
        &self,
        ctx: &ConnectionContext,
        cancel: &Cancellation,
        progress: &Progress,
    ) -> Result<ApprovalStatus, GateError> {
        self.limiter
            .wait_for_token(1.0, self.settings.rate_limit_interval, cancel, |attempt| {
                self.notify_rate_limited(ctx, attempt, cancel)
            })
            .await?;
        progress.enter(GateState::Admitted);

        // Replies to the challenge can only arrive after it is sent, so any
        // cursor taken before sending already excludes older updates.
        let start = request_with_retry("getUpdates", &self.settings.retry, cancel, || {
            self.notifier.poll_since(PollCursor::default())
        })
        .await?
        .cursor;

        let text = challenge_text(ctx, &self.settings.host, Local::now());
        let labels = self.settings.reply_options.labels();
        let message_id = request_with_retry("sendMessage", &self.settings.retry, cancel, || {
            self.notifier.send(&text, &labels)
        })
        .await?;
        let _ = progress.message_id.set(message_id);
        progress.enter(GateState::ChallengeSent);
        info!(%message_id, cursor = %start, "challenge sent");

        let mut request =
            ApprovalRequest::new(text, self.settings.reply_options.clone(), message_id, start);
        progress.enter(GateState::Polling);

        loop {
            let cursor = request.poll_cursor();
            let batch = request_with_retry("getUpdates", &self.settings.retry, cancel, || {
                self.notifier.poll_since(cursor)
            })
            .await?;
            progress.polls.fetch_add(1, Ordering::Relaxed);

            request.advance(batch.cursor);
            match request.evaluate(&batch.replies) {
                ApprovalStatus::Pending => {
                    cancel.sleep(self.settings.poll_interval).await?;
                }
                verdict => return Ok(verdict),
            }
        }
    }

    async fn notify_rate_limited(&self, ctx: &ConnectionContext, attempt: u32, cancel: &Cancellation) {
        let text = format!("{RATE_LIMITED_NOTICE} from {ctx}");
        match cancel.guard(self.notifier.send(&text, &[])).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(attempt, error = %e, "failed to send rate-limit notice"),
            Err(_) => {}
        }
    }

    async fn finalize(&self, ctx: &ConnectionContext, decision: &Decision, message_id: Option<MessageId>) {
        let policy = RetryPolicy::bounded(self.settings.retry.interval, self.settings.finalize_attempts);
        // The round's own cancellation may already have fired; the final
        // notification gets a fresh grace period instead.
        let cancel = Cancellation::never().with_timeout(self.settings.finalize_grace);
        let text = decision.outcome_text();

        let result = match (message_id, decision) {
            (Some(id), _) => request_with_retry("editMessageText", &policy, &cancel, || {
                self.notifier.edit(id, &text)
            })
            .await
            .map(|_| ()),
            (None, Decision::Error(_)) => {
                let notice = format!("{text} from {ctx}");
                request_with_retry("sendMessage", &policy, &cancel, || {
                    self.notifier.send(&notice, &[])
                })
                .await
                .map(|_| ())
            }
            (None, _) => Ok(()),
        };

        if let Err(e) = result {
            warn!(error = %e, "could not report outcome to operator");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
