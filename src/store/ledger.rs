use ulid::Ulid;

use crate::limits::{DEFAULT_TRANSACTIONS_PAGE, MAX_TOPUP, MAX_TRANSACTIONS_PAGE};
use crate::model::*;

use super::{Store, StoreError, WalletGuard, WalletState, now_ms};

impl Store {
    /// The user's wallet, opening an empty one on first use. Concurrent
    /// callers share one cell, so at most one wallet per user is ever opened.
    pub async fn get_or_create_wallet(&self, user_id: UserId) -> Result<Wallet, StoreError> {
        let _gate = self.write_gate().await;
        let mut guard = self.lock_wallet(user_id).await?;
        if let Some(wallet) = &guard.wallet {
            return Ok(wallet.clone());
        }

        let event = Event::WalletOpened {
            id: self.ids.wallets.next(),
            user_id,
            currency: self.options.currency.clone(),
            created_at: now_ms(),
        };
        self.commit(std::slice::from_ref(&event), &mut [&mut *guard])
            .await?;
        guard
            .wallet
            .clone()
            .ok_or_else(|| StoreError::InvariantViolation(format!("wallet for user {user_id} not opened")))
    }

    /// Read-only; `None` if the user never had a wallet.
    pub async fn get_wallet(&self, user_id: UserId) -> Option<Wallet> {
        let cell = self.wallets.get(&user_id).map(|e| e.value().clone())?;
        let guard = cell.read().await;
        guard.wallet.clone()
    }

    /// Apply a signed amount under the wallet's exclusive lock. A result
    /// below zero fails with `InsufficientBalance` and changes nothing.
    pub async fn apply_transaction(
        &self,
        user_id: UserId,
        amount: Cents,
        kind: TransactionType,
    ) -> Result<WalletTransaction, StoreError> {
        if amount == 0 {
            return Err(StoreError::InvalidArgument("transaction amount must be non-zero"));
        }
        let _gate = self.write_gate().await;
        let mut guard = self.lock_wallet(user_id).await?;
        let record = self.stage_transaction(&guard, amount, kind, now_ms())?;
        self.commit(&record, &mut [&mut *guard]).await?;
        last_transaction(&guard)
    }

    pub async fn top_up(
        &self,
        user_id: UserId,
        amount: Cents,
    ) -> Result<WalletTransaction, StoreError> {
        if amount <= 0 {
            return Err(StoreError::InvalidArgument("top-up amount must be positive"));
        }
        if amount > MAX_TOPUP {
            return Err(StoreError::InvalidArgument("top-up amount too large"));
        }
        self.apply_transaction(user_id, amount, TransactionType::Topup)
            .await
    }

    /// Newest first. A non-positive `limit` means the default page.
    pub async fn get_transactions(
        &self,
        user_id: UserId,
        limit: i64,
        offset: i64,
    ) -> Vec<WalletTransaction> {
        let limit = if limit <= 0 {
            DEFAULT_TRANSACTIONS_PAGE
        } else {
            (limit as usize).min(MAX_TRANSACTIONS_PAGE)
        };
        let offset = offset.max(0) as usize;

        let Some(cell) = self.wallets.get(&user_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = cell.read().await;
        guard
            .transactions
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) async fn lock_wallet(&self, user_id: UserId) -> Result<WalletGuard, StoreError> {
        let cell = self.wallet_cell(user_id);
        self.lock(&cell).await
    }

    /// Build the events for one balance change against the locked wallet,
    /// opening it first if needed. Nothing is persisted here.
    pub(crate) fn stage_transaction(
        &self,
        state: &WalletState,
        amount: Cents,
        kind: TransactionType,
        now: Ms,
    ) -> Result<Vec<Event>, StoreError> {
        let balance = state.balance();
        let balance_after = balance
            .checked_add(amount)
            .ok_or(StoreError::InvalidArgument("amount overflows balance"))?;
        if balance_after < 0 {
            return Err(StoreError::InsufficientBalance {
                balance,
                required: -amount,
            });
        }

        let mut record = Vec::with_capacity(2);
        let wallet_id = match &state.wallet {
            Some(w) => w.id,
            None => {
                let id = self.ids.wallets.next();
                record.push(Event::WalletOpened {
                    id,
                    user_id: state.user_id,
                    currency: self.options.currency.clone(),
                    created_at: now,
                });
                id
            }
        };
        record.push(Event::WalletTransactionAppended {
            id: Ulid::new(),
            wallet_id,
            user_id: state.user_id,
            amount,
            kind,
            balance_after,
            created_at: now,
        });
        Ok(record)
    }
}

pub(crate) fn last_transaction(state: &WalletState) -> Result<WalletTransaction, StoreError> {
    state.transactions.last().cloned().ok_or_else(|| {
        StoreError::InvariantViolation(format!(
            "wallet for user {} has no transaction after commit",
            state.user_id
        ))
    })
}
