//! Cooperative cancellation for the gate's blocking loops.
//!
//! Every wait in the approval flow (rate-limit backoff, poll interval, retry
//! backoff, in-flight transport calls) is raced against a [`Cancellation`].
//! It trips when the paired [`CancelHandle`] fires or when the optional
//! deadline passes, whichever happens first.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("authentication attempt cancelled")]
    Cancelled,

    #[error("authentication deadline exceeded")]
    DeadlineExceeded,
}

/// Sender side. Dropping it without calling [`CancelHandle::cancel`] leaves
/// the receivers uncancelled.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx, deadline: None })
    }

    /// A signal that only trips on its deadline, if one is set later.
    pub fn never() -> Self {
        Self::new().1
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// A timeout too large to represent as an instant sets no deadline.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn check(&self) -> Result<(), Interrupted> {
        if *self.rx.borrow() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleep for `duration`, waking early if the signal trips.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.check()?;
        let wake_at = match (Instant::now().checked_add(duration), self.deadline) {
            (Some(wake_at), Some(deadline)) => Some(wake_at.min(deadline)),
            (wake_at, deadline) => wake_at.or(deadline),
        };

        let mut rx = self.rx.clone();
        tokio::select! {
            _ = wait_deadline(wake_at) => {}
            _ = wait_cancelled(&mut rx) => {}
        }
        self.check()
    }

    /// Drive `fut` to completion unless the signal trips first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        self.check()?;
        let mut rx = self.rx.clone();
        let deadline = self.deadline;
        tokio::select! {
            out = fut => Ok(out),
            _ = wait_cancelled(&mut rx) => Err(Interrupted::Cancelled),
            _ = wait_deadline(deadline) => Err(Interrupted::DeadlineExceeded),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without firing: this branch never completes.
            std::future::pending::<()>().await;
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
