use crate::limits::{MAX_EMAIL_LEN, MAX_NAME_LEN, MAX_SLOT_CAPACITY};
use crate::model::*;

use super::{Store, StoreError};

impl Store {
    pub async fn register_user(&self, email: &str, name: &str) -> Result<User, StoreError> {
        let email = email.trim();
        let name = name.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(StoreError::InvalidArgument("invalid email"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(StoreError::InvalidArgument("email too long"));
        }
        if name.is_empty() {
            return Err(StoreError::InvalidArgument("name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(StoreError::InvalidArgument("name too long"));
        }

        let _gate = self.write_gate().await;
        let _registration = self.registration.lock().await;
        if self.emails.contains_key(email) {
            return Err(StoreError::EmailTaken(email.to_string()));
        }

        let user = User {
            id: self.ids.users.next(),
            email: email.to_string(),
            name: name.to_string(),
        };
        self.persist(&[Event::UserRegistered {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
        }])
        .await?;
        Ok(user)
    }

    pub fn get_user_by_id(&self, id: UserId) -> Option<User> {
        self.users.get(&id).map(|u| u.value().clone())
    }

    pub async fn create_slot(
        &self,
        gym_id: GymId,
        start: Ms,
        end: Ms,
        capacity: u32,
    ) -> Result<Slot, StoreError> {
        if end <= start {
            return Err(StoreError::InvalidArgument("slot end must be after start"));
        }
        if capacity == 0 {
            return Err(StoreError::InvalidArgument("slot capacity must be positive"));
        }
        if capacity > MAX_SLOT_CAPACITY {
            return Err(StoreError::InvalidArgument("slot capacity too large"));
        }

        let _gate = self.write_gate().await;
        let slot = Slot {
            id: self.ids.slots.next(),
            gym_id,
            span: Span::new(start, end),
            capacity,
        };
        self.persist(&[Event::SlotCreated {
            id: slot.id,
            gym_id,
            span: slot.span,
            capacity,
        }])
        .await?;
        Ok(slot)
    }

    pub async fn get_slot_by_id(&self, id: SlotId) -> Option<Slot> {
        let cell = self.slot_cell(id)?;
        let guard = cell.read().await;
        Some(guard.slot)
    }
}
