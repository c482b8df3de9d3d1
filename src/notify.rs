use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::{BookingId, Ms, UserId};

/// Message for the user after a booking state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    BookingConfirmed {
        user_id: UserId,
        email: String,
        name: String,
        booking_id: BookingId,
        description: String,
        /// Slot start.
        when: Ms,
    },
    BookingCancelled {
        user_id: UserId,
        email: String,
        name: String,
        booking_id: BookingId,
        description: String,
        when: Ms,
    },
}

impl Notification {
    pub fn user_id(&self) -> UserId {
        match self {
            Notification::BookingConfirmed { user_id, .. }
            | Notification::BookingCancelled { user_id, .. } => *user_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BookingConfirmed { .. } => "booking_confirmed",
            Notification::BookingCancelled { .. } => "booking_cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Best-effort outbound channel. Callers never wait on it for their own
/// outcome and only log its failures.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Writes each notification to the log as JSON.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: Notification) -> Result<(), NotifyError> {
        let body = serde_json::to_string(&notification)?;
        tracing::info!(
            user_id = notification.user_id(),
            kind = notification.kind(),
            "notification: {body}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmed(user_id: UserId) -> Notification {
        Notification::BookingConfirmed {
            user_id,
            email: "a@example.com".into(),
            name: "A".into(),
            booking_id: 1,
            description: "Gym Slot".into(),
            when: 1_000,
        }
    }

    #[tokio::test]
    async fn log_sink_accepts_every_kind() {
        LogSink.deliver(confirmed(1)).await.unwrap();
        let cancelled = Notification::BookingCancelled {
            user_id: 1,
            email: "a@example.com".into(),
            name: "A".into(),
            booking_id: 1,
            description: "Gym Slot".into(),
            when: 1_000,
        };
        assert_eq!(cancelled.kind(), "booking_cancelled");
        LogSink.deliver(cancelled).await.unwrap();
    }

    #[test]
    fn json_is_tagged_by_kind() {
        let json = serde_json::to_value(confirmed(2)).unwrap();
        assert_eq!(json["kind"], "booking_confirmed");
        assert_eq!(json["when"], 1_000);
    }
}
