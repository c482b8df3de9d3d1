use thiserror::Error;

use crate::model::{BookingId, Cents, SlotId, UserId};
use crate::store::StoreError;

/// Every way `book_slot` / `cancel_booking` can fail. Each variant is one
/// stable outcome for the caller.
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("slot {0} not found")]
    SlotNotFound(SlotId),

    #[error("slot {0} has already started")]
    SlotInPast(SlotId),

    #[error("slot {0} is full")]
    SlotFull(SlotId),

    #[error("user {user_id} already booked slot {slot_id}")]
    AlreadyBooked { user_id: UserId, slot_id: SlotId },

    #[error("insufficient balance: have {balance}, need {required}")]
    InsufficientBalance { balance: Cents, required: Cents },

    #[error("booking {0} not found")]
    BookingNotFound(BookingId),

    #[error("booking {booking_id} does not belong to user {user_id}")]
    Forbidden { booking_id: BookingId, user_id: UserId },

    #[error("booking {0} is already cancelled")]
    AlreadyCancelled(BookingId),

    /// Transient. Nothing was committed; the caller may retry.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A capacity or balance guard did not hold. Always a defect.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl BookingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::StorageUnavailable(_))
    }

    /// Stable snake_case label for metrics and logs.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::SlotNotFound(_) => "slot_not_found",
            BookingError::SlotInPast(_) => "slot_in_past",
            BookingError::SlotFull(_) => "slot_full",
            BookingError::AlreadyBooked { .. } => "already_booked",
            BookingError::InsufficientBalance { .. } => "insufficient_balance",
            BookingError::BookingNotFound(_) => "booking_not_found",
            BookingError::Forbidden { .. } => "forbidden",
            BookingError::AlreadyCancelled(_) => "already_cancelled",
            BookingError::StorageUnavailable(_) => "storage_unavailable",
            BookingError::InvariantViolation(_) => "invariant_violation",
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SlotNotFound(id) => BookingError::SlotNotFound(id),
            StoreError::BookingNotFound(id) => BookingError::BookingNotFound(id),
            StoreError::NotFoundOrAlreadyCancelled(id) => BookingError::AlreadyCancelled(id),
            StoreError::Conflict { user_id, slot_id } => {
                BookingError::AlreadyBooked { user_id, slot_id }
            }
            StoreError::CapacityExceeded { slot_id, .. } => BookingError::SlotFull(slot_id),
            StoreError::InsufficientBalance { balance, required } => {
                BookingError::InsufficientBalance { balance, required }
            }
            StoreError::Unavailable(msg) => BookingError::StorageUnavailable(msg),
            StoreError::SubscriptionNotFound(id) => {
                BookingError::InvariantViolation(format!("subscription {id} vanished"))
            }
            StoreError::EmailTaken(_) | StoreError::InvalidArgument(_) => {
                BookingError::InvariantViolation(e.to_string())
            }
            StoreError::InvariantViolation(msg) => BookingError::InvariantViolation(msg),
        }
    }
}
