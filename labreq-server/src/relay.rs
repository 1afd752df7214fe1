//! The notification relay: turns committed change events into messages to the
//! assigned staff member's chat.
//!
//! The relay is a single long-lived task. It never terminates on its own:
//! feed interruptions are retried with bounded backoff, malformed payloads
//! and unresolvable recipients are logged and skipped, and delivery failures
//! are retried up to a fixed ceiling before the event is dropped. Delivery is
//! not transactionally tied to event consumption, so a crash-restart can
//! duplicate a message; that is the accepted at-least-once contract.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::lifecycle::event::{parse_event, ChangeEvent, ChangeKind};
use crate::lifecycle::state::Priority;
use crate::model::{ChatId, User};
use crate::AppState;

/// The messaging transport seam.
///
/// `TelegramClient` is the production implementation; tests substitute a
/// recording fake to observe delivery attempts without a network.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<()>;
}

#[async_trait]
impl Messenger for telegram_bot::TelegramClient {
    async fn send(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.send_message(chat_id.0, text).await
    }
}

/// Bounded exponential backoff with reset.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The delay for the next attempt: base * 2^n, saturating at the cap.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run the relay until shutdown is signalled.
///
/// `Disconnected -> Listening -> Delivering -> Listening`, with `Reconnecting`
/// (bounded backoff) on feed interruption.
pub async fn notification_loop(
    state: Arc<AppState>,
    messenger: Arc<dyn Messenger>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnect = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

    loop {
        let mut events = state.feed.subscribe();
        info!("Notification relay listening for change events");
        reconnect.reset();

        loop {
            let payload = tokio::select! {
                received = events.recv() => received,
                _ = shutdown.changed() => {
                    info!("Notification relay shutting down");
                    return;
                }
            };

            match payload {
                Ok(payload) => {
                    deliver_payload(&state, messenger.as_ref(), &payload, &mut shutdown).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Overrun: the feed outpaced us. Ordering across this gap
                    // is not guaranteed; keep consuming from where we are.
                    warn!("Notification relay lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }

        // The feed sender is gone; wait and resubscribe. Shutdown still wins
        // over the backoff sleep.
        let delay = reconnect.next_delay();
        warn!(
            "Change feed disconnected; reconnecting in {:?}",
            delay
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                info!("Notification relay shutting down");
                return;
            }
        }
    }
}

/// Process one raw payload: parse, resolve the recipient, deliver.
///
/// Every failure mode here is per-event and non-fatal to the loop.
async fn deliver_payload(
    state: &AppState,
    messenger: &dyn Messenger,
    payload: &str,
    shutdown: &mut watch::Receiver<bool>,
) {
    let event = match parse_event(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("Skipping malformed change event: {}", e);
            return;
        }
    };

    let Some(recipient) = resolve_recipient(state, &event).await else {
        return;
    };
    let Some(chat_id) = recipient.chat_id else {
        // Expected unlinked-recipient state, not an error.
        info!(
            "Dropping event {}: {} has not linked a chat account",
            event.log_summary(),
            recipient.code
        );
        return;
    };

    let text = render_message(&event);
    deliver_with_retry(state, messenger, chat_id, &text, &event, shutdown).await;
}

/// Look up the assignee. Events without a resolvable, notifiable recipient
/// are dropped after one log line.
async fn resolve_recipient(state: &AppState, event: &ChangeEvent) -> Option<User> {
    let Some(assignee) = &event.assignee_ref else {
        info!(
            "Dropping event {}: no assignee reference",
            event.log_summary()
        );
        return None;
    };

    let user = match state.manager.repository().find_user_by_code(assignee).await {
        Ok(user) => user,
        Err(e) => {
            error!(
                "Recipient lookup failed for event {}: {}",
                event.log_summary(),
                e
            );
            return None;
        }
    };

    let Some(user) = user else {
        info!(
            "Dropping event {}: assignee {} not found",
            event.log_summary(),
            assignee
        );
        return None;
    };

    if !user.can_receive_assignments() {
        info!(
            "Dropping event {}: assignee {} is inactive or deleted",
            event.log_summary(),
            assignee
        );
        return None;
    }

    Some(user)
}

/// Attempt delivery with bounded backoff up to the configured ceiling.
/// Exceeding the ceiling drops the event; later events are unaffected.
async fn deliver_with_retry(
    state: &AppState,
    messenger: &dyn Messenger,
    chat_id: ChatId,
    text: &str,
    event: &ChangeEvent,
    shutdown: &mut watch::Receiver<bool>,
) {
    let max_attempts = state.delivery_max_attempts.max(1);
    let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(10));

    for attempt in 1..=max_attempts {
        match messenger.send(chat_id, text).await {
            Ok(()) => {
                info!(
                    "Delivered event {} to chat {} (attempt {})",
                    event.log_summary(),
                    chat_id,
                    attempt
                );
                return;
            }
            Err(e) => {
                warn!(
                    "Delivery attempt {}/{} failed for event {}: {}",
                    attempt,
                    max_attempts,
                    event.log_summary(),
                    e
                );
            }
        }

        if attempt < max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(backoff.next_delay()) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    error!(
        "Dropping event {} after {} failed delivery attempts",
        event.log_summary(),
        max_attempts
    );
}

/// Render the recipient-facing message for an event.
pub fn render_message(event: &ChangeEvent) -> String {
    let priority = event.priority.unwrap_or(Priority::Routine);

    match event.event_kind {
        ChangeKind::Created => format!(
            "New Request Assigned\nTask ID: {}\nPriority: {}",
            event.request_id,
            priority.as_str()
        ),
        ChangeKind::Reassigned => format!(
            "Request Reassigned to You\nTask ID: {}\nPriority: {}",
            event.request_id,
            priority.as_str()
        ),
        ChangeKind::StatusChanged => {
            let status = event
                .status
                .map(|s| s.as_str())
                .unwrap_or("updated");
            format!(
                "Request Status Updated\nTask ID: {}\nStatus: {}",
                event.request_id, status
            )
        }
    }
}
