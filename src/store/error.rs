use thiserror::Error;

use crate::model::{BookingId, Cents, SlotId, SubscriptionId, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("slot not found: {0}")]
    SlotNotFound(SlotId),

    #[error("booking not found: {0}")]
    BookingNotFound(BookingId),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// The conditional `booked -> cancelled` update matched nothing.
    #[error("booking {0} not found or already cancelled")]
    NotFoundOrAlreadyCancelled(BookingId),

    /// Unique (user, slot) reservation already held.
    #[error("user {user_id} already holds a reservation for slot {slot_id}")]
    Conflict { user_id: UserId, slot_id: SlotId },

    #[error("slot {slot_id} is full (capacity {capacity})")]
    CapacityExceeded { slot_id: SlotId, capacity: u32 },

    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: Cents, required: Cents },

    #[error("email already registered: {0}")]
    EmailTaken(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// WAL failure or lock-wait timeout. Nothing was applied.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
