use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::model::*;

use super::{SharedSlot, SlotGuard, SlotState, Store, StoreError, now_ms};

impl Store {
    pub async fn count_active_bookings(&self, slot_id: SlotId) -> Result<u32, StoreError> {
        let cell = self
            .slot_cell(slot_id)
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        let guard = cell.read().await;
        Ok(guard.active_count())
    }

    pub async fn user_has_booking(
        &self,
        user_id: UserId,
        slot_id: SlotId,
    ) -> Result<bool, StoreError> {
        let cell = self
            .slot_cell(slot_id)
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        let guard = cell.read().await;
        Ok(guard.holds_active(user_id))
    }

    pub async fn get_booking(&self, booking_id: BookingId) -> Option<Booking> {
        let slot_id = *self.booking_index.get(&booking_id)?;
        let cell = self.slot_cell(slot_id)?;
        let guard = cell.read().await;
        guard.booking(booking_id).copied()
    }

    /// Every booking the user ever made, newest first.
    pub async fn user_bookings(&self, user_id: UserId) -> Vec<Booking> {
        let refs: Vec<(SlotId, BookingId)> = self
            .user_bookings
            .get(&user_id)
            .map(|v| v.clone())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(refs.len());
        for (slot_id, booking_id) in refs.into_iter().rev() {
            let Some(cell) = self.slot_cell(slot_id) else {
                continue;
            };
            let guard = cell.read().await;
            if let Some(b) = guard.booking(booking_id) {
                out.push(*b);
            }
        }
        out
    }

    /// Bookings on a slot, newest first, cancelled ones included.
    pub async fn slot_bookings(&self, slot_id: SlotId) -> Result<Vec<Booking>, StoreError> {
        let cell = self
            .slot_cell(slot_id)
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        let guard = cell.read().await;
        Ok(guard.bookings.iter().rev().copied().collect())
    }

    /// Every booking at the gym's slots with slot and user details. Latest
    /// slot first, then newest booking first.
    pub async fn gym_bookings(&self, gym_id: GymId) -> Vec<BookingDetails> {
        let slot_ids: Vec<SlotId> = self
            .gym_slots
            .get(&gym_id)
            .map(|v| v.clone())
            .unwrap_or_default();

        let mut out = Vec::new();
        for slot_id in slot_ids {
            let Some(cell) = self.slot_cell(slot_id) else {
                continue;
            };
            let guard = cell.read().await;
            out.extend(guard.bookings.iter().map(|b| self.booking_details(&guard.slot, b)));
        }
        out.sort_by_key(|d| {
            (
                Reverse(d.span.start),
                Reverse(d.booking.created_at),
                Reverse(d.booking.id),
            )
        });
        out
    }

    /// Bookings created in `[from, to]`, counted per UTC day, oldest day first.
    pub async fn booking_stats_by_day(&self, from: Ms, to: Ms) -> Vec<DailyBookingStats> {
        let mut days: BTreeMap<Ms, BookingCounts> = BTreeMap::new();
        for (_, booking) in self.bookings_created_between(from, to).await {
            days.entry(day_start(booking.created_at))
                .or_default()
                .count(&booking);
        }
        days.into_iter()
            .map(|(day, counts)| DailyBookingStats { day, counts })
            .collect()
    }

    /// Bookings created in `[from, to]`, counted per gym, by gym id.
    pub async fn booking_stats_by_gym(&self, from: Ms, to: Ms) -> Vec<GymBookingStats> {
        let mut gyms: BTreeMap<GymId, BookingCounts> = BTreeMap::new();
        for (gym_id, booking) in self.bookings_created_between(from, to).await {
            gyms.entry(gym_id).or_default().count(&booking);
        }
        gyms.into_iter()
            .map(|(gym_id, counts)| GymBookingStats { gym_id, counts })
            .collect()
    }

    async fn bookings_created_between(&self, from: Ms, to: Ms) -> Vec<(GymId, Booking)> {
        let cells: Vec<SharedSlot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for cell in cells {
            let guard = cell.read().await;
            let gym_id = guard.slot.gym_id;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| from <= b.created_at && b.created_at <= to)
                    .map(|b| (gym_id, *b)),
            );
        }
        out
    }

    fn booking_details(&self, slot: &Slot, booking: &Booking) -> BookingDetails {
        let user = self.users.get(&booking.user_id);
        BookingDetails {
            booking: *booking,
            gym_id: slot.gym_id,
            span: slot.span,
            user_name: user.as_ref().map(|u| u.name.clone()),
            user_email: user.as_ref().map(|u| u.email.clone()),
        }
    }

    pub async fn slot_availability(&self, slot_id: SlotId) -> Result<SlotAvailability, StoreError> {
        let cell = self
            .slot_cell(slot_id)
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        let guard = cell.read().await;
        Ok(guard.availability())
    }

    /// Capacity-aware conditional insert of a `booked` row.
    pub async fn create_booking(
        &self,
        user_id: UserId,
        slot_id: SlotId,
    ) -> Result<Booking, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = self.lock_slot(slot_id).await?;
        let (booking, event) = self.stage_booking(&guard, user_id, now_ms())?;
        self.commit(std::slice::from_ref(&event), &mut [&mut *guard])
            .await?;
        Ok(booking)
    }

    /// Transition `booked -> cancelled`. Zero matching rows, whether the
    /// booking is missing or already cancelled, is one error.
    pub async fn cancel_booking(&self, booking_id: BookingId) -> Result<Booking, StoreError> {
        let _gate = self.write_gate().await;
        let slot_id = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFoundOrAlreadyCancelled(booking_id))?;
        let mut guard = self.lock_slot(slot_id).await?;

        let booking = match guard.booking(booking_id) {
            Some(b) if b.is_active() => *b,
            _ => return Err(StoreError::NotFoundOrAlreadyCancelled(booking_id)),
        };

        let event = Event::BookingCancelled {
            id: booking_id,
            slot_id,
        };
        self.commit(std::slice::from_ref(&event), &mut [&mut *guard])
            .await?;
        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..booking
        })
    }

    pub(crate) async fn lock_slot(&self, slot_id: SlotId) -> Result<SlotGuard, StoreError> {
        let cell = self
            .slot_cell(slot_id)
            .ok_or(StoreError::SlotNotFound(slot_id))?;
        self.lock(&cell).await
    }

    /// Validate a new reservation against the locked slot and build its
    /// event. Nothing is persisted here.
    pub(crate) fn stage_booking(
        &self,
        state: &SlotState,
        user_id: UserId,
        now: Ms,
    ) -> Result<(Booking, Event), StoreError> {
        if state.holds_active(user_id) {
            return Err(StoreError::Conflict {
                user_id,
                slot_id: state.slot.id,
            });
        }
        if state.is_full() {
            return Err(StoreError::CapacityExceeded {
                slot_id: state.slot.id,
                capacity: state.slot.capacity,
            });
        }

        let booking = Booking {
            id: self.ids.bookings.next(),
            user_id,
            slot_id: state.slot.id,
            status: BookingStatus::Booked,
            created_at: now,
        };
        let event = Event::BookingCreated {
            id: booking.id,
            user_id,
            slot_id: booking.slot_id,
            created_at: now,
        };
        Ok((booking, event))
    }
}
