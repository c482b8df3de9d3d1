mod error;

pub use error::BookingError;

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::model::*;
use crate::notify::{Notification, NotificationSink};
use crate::observability::{
    BOOKING_DURATION_SECONDS, BOOKINGS_TOTAL, CANCELLATIONS_TOTAL, NOTIFICATIONS_FAILED_TOTAL,
};
use crate::store::{Store, now_ms};

/// Per-slot price in minor units when nothing else is configured.
pub const DEFAULT_SLOT_PRICE: Cents = 1000;

const SLOT_DESCRIPTION: &str = "Gym Slot";

/// The booking transaction core: validates a (user, slot) request, picks how
/// it is paid for, and commits reservation and payment together.
pub struct BookingService {
    store: Arc<Store>,
    sink: Arc<dyn NotificationSink>,
    slot_price: Cents,
}

impl BookingService {
    pub fn new(store: Arc<Store>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            sink,
            slot_price: DEFAULT_SLOT_PRICE,
        }
    }

    pub fn with_slot_price(mut self, slot_price: Cents) -> Self {
        self.slot_price = slot_price;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn slot_price(&self) -> Cents {
        self.slot_price
    }

    pub async fn book_slot(
        &self,
        user_id: UserId,
        slot_id: SlotId,
    ) -> Result<BookingOutcome, BookingError> {
        let started = Instant::now();
        let result = self.reserve_and_pay(user_id, slot_id, now_ms()).await;
        metrics::histogram!(BOOKING_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match &result {
            Ok((outcome, slot)) => {
                let method = outcome.payment.method().as_str();
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => "success", "payment_method" => method)
                    .increment(1);
                info!(
                    user_id,
                    slot_id,
                    booking_id = outcome.booking.id,
                    payment_method = method,
                    "slot booked"
                );
                self.notify_user(user_id, slot, |email, name| Notification::BookingConfirmed {
                    user_id,
                    email,
                    name,
                    booking_id: outcome.booking.id,
                    description: SLOT_DESCRIPTION.to_string(),
                    when: slot.span.start,
                });
            }
            Err(e) => {
                metrics::counter!(BOOKINGS_TOTAL, "outcome" => e.code(), "payment_method" => "none")
                    .increment(1);
                log_rejection("book_slot", user_id, e);
            }
        }
        result.map(|(outcome, _)| outcome)
    }

    /// Holds the slot's exclusive lock from the first check through the
    /// commit, so the capacity check and the insert cannot be split by
    /// another booking.
    async fn reserve_and_pay(
        &self,
        user_id: UserId,
        slot_id: SlotId,
        now: Ms,
    ) -> Result<(BookingOutcome, Slot), BookingError> {
        let store = &self.store;
        let _gate = store.write_gate().await;
        let mut slot = store.lock_slot(slot_id).await?;
        let target = slot.slot;

        if target.span.has_started(now) {
            return Err(BookingError::SlotInPast(slot_id));
        }
        // A retry by the holder reports the duplicate even when the slot is full.
        if slot.holds_active(user_id) {
            return Err(BookingError::AlreadyBooked { user_id, slot_id });
        }
        if slot.is_full() {
            return Err(BookingError::SlotFull(slot_id));
        }
        let (booking, reserved) = store.stage_booking(&slot, user_id, now)?;

        let entitlement = store
            .lock_active_entitlement(user_id, target.gym_id, now)
            .await?
            .filter(|sub| sub.is_usable(target.gym_id, now));

        let payment = if let Some(mut sub) = entitlement {
            let mut record = vec![reserved];
            if sub.visits_limit.is_some() {
                record.push(Event::SubscriptionVisitUsed { id: sub.id });
            }
            store.commit(&record, &mut [&mut *slot, &mut *sub]).await?;
            PaymentDetails::Subscription {
                subscription_id: sub.id,
                visits_used: sub.visits_used,
                visits_limit: sub.visits_limit,
            }
        } else {
            let mut wallet = store.lock_wallet(user_id).await?;
            let mut record = vec![reserved];
            if self.slot_price > 0 {
                record.extend(store.stage_transaction(
                    &wallet,
                    -self.slot_price,
                    TransactionType::BookingPayment,
                    now,
                )?);
            }
            store.commit(&record, &mut [&mut *slot, &mut *wallet]).await?;
            PaymentDetails::Wallet {
                amount_debited: self.slot_price,
                balance_after: wallet.balance(),
            }
        };

        let booked = slot.active_count();
        if booked > target.capacity {
            error!(slot_id, booked, capacity = target.capacity, "slot overbooked after commit");
        }

        Ok((BookingOutcome { booking, payment }, target))
    }

    /// Cancel the user's own booking. No refund is issued and no subscription
    /// visit is returned.
    pub async fn cancel_booking(
        &self,
        user_id: UserId,
        booking_id: BookingId,
    ) -> Result<Booking, BookingError> {
        let result = self.try_cancel(user_id, booking_id).await;
        match &result {
            Ok(booking) => {
                metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => "success").increment(1);
                info!(user_id, booking_id, slot_id = booking.slot_id, "booking cancelled");
                if let Some(slot) = self.store.get_slot_by_id(booking.slot_id).await {
                    self.notify_user(user_id, &slot, |email, name| {
                        Notification::BookingCancelled {
                            user_id,
                            email,
                            name,
                            booking_id,
                            description: SLOT_DESCRIPTION.to_string(),
                            when: slot.span.start,
                        }
                    });
                }
            }
            Err(e) => {
                metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => e.code()).increment(1);
                log_rejection("cancel_booking", user_id, e);
            }
        }
        result
    }

    async fn try_cancel(
        &self,
        user_id: UserId,
        booking_id: BookingId,
    ) -> Result<Booking, BookingError> {
        let booking = self
            .store
            .get_booking(booking_id)
            .await
            .ok_or(BookingError::BookingNotFound(booking_id))?;
        if booking.user_id != user_id {
            return Err(BookingError::Forbidden {
                booking_id,
                user_id,
            });
        }
        Ok(self.store.cancel_booking(booking_id).await?)
    }

    /// Newest first.
    pub async fn user_bookings(&self, user_id: UserId) -> Vec<Booking> {
        self.store.user_bookings(user_id).await
    }

    /// Deliver in a detached task. The outcome of the booking never depends
    /// on it.
    fn notify_user(
        &self,
        user_id: UserId,
        slot: &Slot,
        build: impl FnOnce(String, String) -> Notification,
    ) {
        let Some(user) = self.store.get_user_by_id(user_id) else {
            debug!(user_id, slot_id = slot.id, "no user record, notification skipped");
            return;
        };
        let notification = build(user.email, user.name);
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let kind = notification.kind();
            if let Err(e) = sink.deliver(notification).await {
                metrics::counter!(NOTIFICATIONS_FAILED_TOTAL, "kind" => kind).increment(1);
                warn!(user_id, kind, "notification delivery failed: {e}");
            }
        });
    }
}

fn log_rejection(op: &'static str, user_id: UserId, e: &BookingError) {
    match e {
        BookingError::InvariantViolation(_) => error!(op, user_id, "{e}"),
        BookingError::StorageUnavailable(_) => warn!(op, user_id, "{e}"),
        _ => debug!(op, user_id, code = e.code(), "{e}"),
    }
}
