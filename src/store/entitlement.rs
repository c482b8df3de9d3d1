use crate::limits::{MAX_ENTITLEMENT_RETRIES, MAX_PRICE};
use crate::model::*;

use super::ledger::last_transaction;
use super::{Store, StoreError, SubscriptionGuard, now_ms};

/// Parameters for granting or selling a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub user_id: UserId,
    /// `None` makes it valid at any gym.
    pub gym_id: Option<GymId>,
    /// `None` means unlimited visits.
    pub visits_limit: Option<u32>,
    pub price: Cents,
    pub valid_from: Ms,
    pub valid_until: Ms,
}

impl NewSubscription {
    fn validate(&self) -> Result<(), StoreError> {
        if self.valid_until < self.valid_from {
            return Err(StoreError::InvalidArgument("valid_until before valid_from"));
        }
        if self.price < 0 {
            return Err(StoreError::InvalidArgument("price must not be negative"));
        }
        if self.price > MAX_PRICE {
            return Err(StoreError::InvalidArgument("price too large"));
        }
        Ok(())
    }

    fn into_subscription(self, id: SubscriptionId, now: Ms) -> Subscription {
        Subscription {
            id,
            user_id: self.user_id,
            gym_id: self.gym_id,
            status: SubscriptionStatus::Active,
            visits_limit: self.visits_limit,
            visits_used: 0,
            price: self.price,
            valid_from: self.valid_from,
            valid_until: self.valid_until,
            created_at: now,
        }
    }
}

impl Store {
    /// Administrative grant; no payment is taken.
    pub async fn create_subscription(
        &self,
        new: NewSubscription,
    ) -> Result<Subscription, StoreError> {
        new.validate()?;
        let _gate = self.write_gate().await;
        let sub = new.into_subscription(self.ids.subscriptions.next(), now_ms());
        self.persist(&[Event::subscription_created(&sub)]).await?;
        Ok(sub)
    }

    /// Debit the price as `subscription_payment` and create the subscription
    /// in one commit. A free subscription writes no ledger entry.
    pub async fn purchase_subscription(
        &self,
        new: NewSubscription,
    ) -> Result<(Subscription, Option<WalletTransaction>), StoreError> {
        new.validate()?;
        if new.price == 0 {
            return self.create_subscription(new).await.map(|s| (s, None));
        }

        let _gate = self.write_gate().await;
        let now = now_ms();
        let mut wallet = self.lock_wallet(new.user_id).await?;
        let mut record =
            self.stage_transaction(&wallet, -new.price, TransactionType::SubscriptionPayment, now)?;
        let sub = new.into_subscription(self.ids.subscriptions.next(), now);
        record.push(Event::subscription_created(&sub));

        self.commit(&record, &mut [&mut *wallet]).await?;
        Ok((sub, Some(last_transaction(&wallet)?)))
    }

    pub async fn get_subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        let cell = self.subscription_cell(id)?;
        let guard = cell.read().await;
        Some(guard.clone())
    }

    /// Active and inside the validity window at `now`, best-ranked first.
    pub async fn list_active_subscriptions(&self, user_id: UserId, now: Ms) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .user_subscriptions_snapshot(user_id)
            .await
            .into_iter()
            .filter(|s| s.is_current(now))
            .collect();
        subs.sort_by_key(|s| (s.priority(), s.id));
        subs
    }

    /// The top-ranked subscription that applies to `gym_id` at `now`:
    /// gym-scoped before unscoped, then the higher price. Visits left are
    /// not considered; an exhausted winner is still returned.
    pub async fn get_active_entitlement(
        &self,
        user_id: UserId,
        gym_id: GymId,
        now: Ms,
    ) -> Option<Subscription> {
        self.user_subscriptions_snapshot(user_id)
            .await
            .into_iter()
            .filter(|s| s.applies_to(gym_id, now))
            .min_by_key(|s| (s.priority(), s.id))
    }

    /// Add one visit. The caller has already confirmed the limit allows it.
    pub async fn increment_visit(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = self.lock_subscription(id).await?;
        let event = Event::SubscriptionVisitUsed { id };
        self.commit(std::slice::from_ref(&event), &mut [&mut *guard])
            .await?;
        Ok(guard.clone())
    }

    /// Mark an active subscription expired. Already inactive ones are
    /// returned unchanged.
    pub async fn expire_subscription(&self, id: SubscriptionId) -> Result<Subscription, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = self.lock_subscription(id).await?;
        if guard.status != SubscriptionStatus::Active {
            return Ok(guard.clone());
        }
        let event = Event::SubscriptionStatusChanged {
            id,
            status: SubscriptionStatus::Expired,
        };
        self.commit(std::slice::from_ref(&event), &mut [&mut *guard])
            .await?;
        Ok(guard.clone())
    }

    /// Ids of active subscriptions whose window closed before `now`.
    pub async fn collect_lapsed_subscriptions(&self, now: Ms) -> Vec<SubscriptionId> {
        let cells: Vec<_> = self
            .subscriptions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut lapsed = Vec::new();
        for cell in cells {
            let sub = cell.read().await;
            if sub.status == SubscriptionStatus::Active && sub.valid_until < now {
                lapsed.push(sub.id);
            }
        }
        lapsed.sort_unstable();
        lapsed
    }

    /// Pick the top-ranked entitlement and take its exclusive lock, then
    /// confirm it still applies. Retries when it changed in between.
    pub(crate) async fn lock_active_entitlement(
        &self,
        user_id: UserId,
        gym_id: GymId,
        now: Ms,
    ) -> Result<Option<SubscriptionGuard>, StoreError> {
        for _ in 0..MAX_ENTITLEMENT_RETRIES {
            let Some(candidate) = self.get_active_entitlement(user_id, gym_id, now).await else {
                return Ok(None);
            };
            let guard = self.lock_subscription(candidate.id).await?;
            if guard.applies_to(gym_id, now) {
                return Ok(Some(guard));
            }
        }
        Err(StoreError::Unavailable(format!(
            "entitlement for user {user_id} kept changing during selection"
        )))
    }

    async fn lock_subscription(&self, id: SubscriptionId) -> Result<SubscriptionGuard, StoreError> {
        let cell = self
            .subscription_cell(id)
            .ok_or(StoreError::SubscriptionNotFound(id))?;
        self.lock(&cell).await
    }

    async fn user_subscriptions_snapshot(&self, user_id: UserId) -> Vec<Subscription> {
        let ids: Vec<SubscriptionId> = self
            .user_subscriptions
            .get(&user_id)
            .map(|v| v.clone())
            .unwrap_or_default();
        let mut subs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(cell) = self.subscription_cell(id) {
                subs.push(cell.read().await.clone());
            }
        }
        subs
    }
}
