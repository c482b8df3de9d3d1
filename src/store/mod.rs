mod capacity;
mod directory;
mod entitlement;
mod error;
mod ledger;

pub use entitlement::NewSubscription;
pub use error::StoreError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard, mpsc, oneshot};

use crate::model::*;
use crate::wal::{Record, Wal};

pub type SharedSlot = Arc<RwLock<SlotState>>;
pub type SharedWallet = Arc<RwLock<WalletState>>;
pub type SharedSubscription = Arc<RwLock<Subscription>>;

pub type SlotGuard = OwnedRwLockWriteGuard<SlotState>;
pub type WalletGuard = OwnedRwLockWriteGuard<WalletState>;
pub type SubscriptionGuard = OwnedRwLockWriteGuard<Subscription>;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

// ── Entity cells ─────────────────────────────────────────

/// A slot and every booking ever made against it.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    pub bookings: Vec<Booking>,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
        }
    }

    pub fn active_count(&self) -> u32 {
        self.bookings.iter().filter(|b| b.is_active()).count() as u32
    }

    pub fn is_full(&self) -> bool {
        self.active_count() >= self.slot.capacity
    }

    pub fn holds_active(&self, user_id: UserId) -> bool {
        self.bookings
            .iter()
            .any(|b| b.user_id == user_id && b.is_active())
    }

    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn availability(&self) -> SlotAvailability {
        let booked = self.active_count();
        SlotAvailability {
            slot: self.slot,
            booked,
            available: self.slot.capacity.saturating_sub(booked),
            is_full: booked >= self.slot.capacity,
        }
    }
}

/// A user's wallet and its ledger. `wallet` stays `None` until `WalletOpened`
/// is durable; the cell itself exists as soon as anyone asks for it.
#[derive(Debug, Clone)]
pub struct WalletState {
    pub user_id: UserId,
    pub wallet: Option<Wallet>,
    /// Oldest first.
    pub transactions: Vec<WalletTransaction>,
}

impl WalletState {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            wallet: None,
            transactions: Vec::new(),
        }
    }

    pub fn balance(&self) -> Cents {
        self.wallet.as_ref().map_or(0, |w| w.balance)
    }
}

/// Apply a durable event to an in-memory cell. Events for other entities are
/// ignored, so a whole commit record can be applied to every guard it touched.
pub(crate) trait Apply: Send {
    fn apply(&mut self, event: &Event);

    fn apply_all(&mut self, record: &[Event]) {
        for event in record {
            self.apply(event);
        }
    }
}

impl Apply for SlotState {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::BookingCreated {
                id,
                user_id,
                slot_id,
                created_at,
            } if *slot_id == self.slot.id => {
                self.bookings.push(Booking {
                    id: *id,
                    user_id: *user_id,
                    slot_id: *slot_id,
                    status: BookingStatus::Booked,
                    created_at: *created_at,
                });
            }
            Event::BookingCancelled { id, slot_id } if *slot_id == self.slot.id => {
                if let Some(b) = self.bookings.iter_mut().find(|b| b.id == *id) {
                    b.status = BookingStatus::Cancelled;
                }
            }
            _ => {}
        }
    }
}

impl Apply for WalletState {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::WalletOpened {
                id,
                user_id,
                currency,
                created_at,
            } if *user_id == self.user_id && self.wallet.is_none() => {
                self.wallet = Some(Wallet {
                    id: *id,
                    user_id: *user_id,
                    balance: 0,
                    currency: currency.clone(),
                    created_at: *created_at,
                    updated_at: *created_at,
                });
            }
            Event::WalletTransactionAppended {
                id,
                wallet_id,
                amount,
                kind,
                balance_after,
                created_at,
                ..
            } => {
                let Some(wallet) = self.wallet.as_mut().filter(|w| w.id == *wallet_id) else {
                    return;
                };
                wallet.balance = *balance_after;
                wallet.updated_at = *created_at;
                self.transactions.push(WalletTransaction {
                    id: *id,
                    wallet_id: *wallet_id,
                    amount: *amount,
                    kind: *kind,
                    balance_after: *balance_after,
                    created_at: *created_at,
                });
            }
            _ => {}
        }
    }
}

impl Apply for Subscription {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::SubscriptionVisitUsed { id } if *id == self.id => {
                self.visits_used = self.visits_used.saturating_add(1);
            }
            Event::SubscriptionStatusChanged { id, status } if *id == self.id => {
                self.status = *status;
            }
            _ => {}
        }
    }
}

// ── Id sequences ─────────────────────────────────────────

#[derive(Debug, Default)]
struct Sequence(AtomicI64);

impl Sequence {
    fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn observe(&self, id: i64) {
        self.0.fetch_max(id, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct Sequences {
    users: Sequence,
    slots: Sequence,
    bookings: Sequence,
    wallets: Sequence,
    subscriptions: Sequence,
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Record, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Takes the first append, drains whatever
/// else is already queued, then pays for a single fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (record, response) = match cmd {
            WalCommand::Append { record, response } => (record, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(record, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
        }
        for (_, tx) in batch {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(reply);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// All or nothing: a failure rolls the log back so none of the batch can
/// surface on a later flush or replay.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(record, _)| wal.append_buffered(record))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        discard_unflushed(wal);
    }
    result
}

fn discard_unflushed(wal: &mut Wal) {
    if let Err(e) = wal.rollback() {
        tracing::error!("WAL rollback failed, retrying before next write: {e}");
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let result = wal.append_buffered(&record).and_then(|()| wal.flush_sync());
            if result.is_err() {
                discard_unflushed(wal);
            }
            let _ = response.send(result);
        }
    }
}

// ── Store ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Longest wait for an entity's exclusive lock before giving up.
    pub lock_timeout: Duration,
    /// Currency assigned to newly opened wallets.
    pub currency: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            currency: "KZT".to_string(),
        }
    }
}

/// All durable state: slots with their bookings (capacity), wallets with their
/// ledgers, subscriptions (entitlements), and the user directory.
///
/// Every mutable entity sits behind its own `RwLock`. Lock order is
/// commit gate → slot → subscription → wallet.
pub struct Store {
    users: DashMap<UserId, User>,
    emails: DashMap<String, UserId>,
    slots: DashMap<SlotId, SharedSlot>,
    wallets: DashMap<UserId, SharedWallet>,
    subscriptions: DashMap<SubscriptionId, SharedSubscription>,
    /// booking id → slot id
    booking_index: DashMap<BookingId, SlotId>,
    user_bookings: DashMap<UserId, Vec<(SlotId, BookingId)>>,
    gym_slots: DashMap<GymId, Vec<SlotId>>,
    user_subscriptions: DashMap<UserId, Vec<SubscriptionId>>,
    ids: Sequences,
    /// Mutations hold it shared; compaction holds it exclusively.
    commit_gate: RwLock<()>,
    /// Serializes user registration so email uniqueness holds.
    registration: Mutex<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    options: StoreOptions,
}

impl Store {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub async fn open(wal_path: PathBuf, options: StoreOptions) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            users: DashMap::new(),
            emails: DashMap::new(),
            slots: DashMap::new(),
            wallets: DashMap::new(),
            subscriptions: DashMap::new(),
            booking_index: DashMap::new(),
            user_bookings: DashMap::new(),
            gym_slots: DashMap::new(),
            user_subscriptions: DashMap::new(),
            ids: Sequences::default(),
            commit_gate: RwLock::new(()),
            registration: Mutex::new(()),
            wal_tx,
            options,
        };

        let mut events = 0usize;
        for record in &records {
            for event in record {
                store.replay_event(event).await;
                events += 1;
            }
        }
        tracing::info!(
            "store opened from {}: {} records, {} events",
            wal_path.display(),
            records.len(),
            events
        );

        Ok(store)
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    async fn replay_event(&self, event: &Event) {
        self.index(event);
        match event {
            Event::BookingCreated { slot_id, .. } | Event::BookingCancelled { slot_id, .. } => {
                if let Some(cell) = self.slot_cell(*slot_id) {
                    cell.write().await.apply(event);
                }
            }
            Event::WalletOpened { user_id, .. } => {
                self.wallet_cell(*user_id).write().await.apply(event);
            }
            Event::WalletTransactionAppended { user_id, .. } => {
                let cell = self.wallets.get(user_id).map(|e| e.value().clone());
                if let Some(cell) = cell {
                    cell.write().await.apply(event);
                }
            }
            Event::SubscriptionVisitUsed { id } | Event::SubscriptionStatusChanged { id, .. } => {
                if let Some(cell) = self.subscription_cell(*id) {
                    cell.write().await.apply(event);
                }
            }
            Event::UserRegistered { .. }
            | Event::SlotCreated { .. }
            | Event::SubscriptionCreated { .. } => {}
        }
    }

    /// Entity creation, secondary indexes and id sequences. Shared by replay
    /// and live commits; events that only touch an existing cell are applied
    /// through its guard instead.
    fn index(&self, event: &Event) {
        match event {
            Event::UserRegistered { id, email, name } => {
                self.ids.users.observe(*id);
                self.emails.insert(email.clone(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        email: email.clone(),
                        name: name.clone(),
                    },
                );
            }
            Event::SlotCreated {
                id,
                gym_id,
                span,
                capacity,
            } => {
                self.ids.slots.observe(*id);
                let slot = Slot {
                    id: *id,
                    gym_id: *gym_id,
                    span: *span,
                    capacity: *capacity,
                };
                self.slots
                    .insert(*id, Arc::new(RwLock::new(SlotState::new(slot))));
                self.gym_slots.entry(*gym_id).or_default().push(*id);
            }
            Event::BookingCreated {
                id,
                user_id,
                slot_id,
                ..
            } => {
                self.ids.bookings.observe(*id);
                self.booking_index.insert(*id, *slot_id);
                self.user_bookings
                    .entry(*user_id)
                    .or_default()
                    .push((*slot_id, *id));
            }
            Event::WalletOpened { id, .. } => self.ids.wallets.observe(*id),
            Event::SubscriptionCreated { id, user_id, .. } => {
                self.ids.subscriptions.observe(*id);
                if let Some(sub) = subscription_from_event(event) {
                    self.subscriptions.insert(*id, Arc::new(RwLock::new(sub)));
                }
                self.user_subscriptions.entry(*user_id).or_default().push(*id);
            }
            Event::BookingCancelled { .. }
            | Event::WalletTransactionAppended { .. }
            | Event::SubscriptionVisitUsed { .. }
            | Event::SubscriptionStatusChanged { .. } => {}
        }
    }

    // ── Commit path ──────────────────────────────────────

    /// Shared hold on the commit gate. Every mutation takes this first and
    /// exactly once, before any entity lock.
    pub(crate) async fn write_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_gate.read().await
    }

    /// Make a commit record durable and index it. The caller applies it to the
    /// guards it holds afterwards; nothing is visible if this fails.
    pub(crate) async fn persist(&self, record: &[Event]) -> Result<(), StoreError> {
        self.wal_append(record.to_vec()).await?;
        for event in record {
            self.index(event);
            if let Event::WalletTransactionAppended { kind, .. } = event {
                metrics::counter!(
                    crate::observability::WALLET_TRANSACTIONS_TOTAL,
                    "type" => kind.as_str()
                )
                .increment(1);
            }
        }
        Ok(())
    }

    /// Persist `record`, then apply it to every locked cell it touches.
    pub(crate) async fn commit(
        &self,
        record: &[Event],
        targets: &mut [&mut dyn Apply],
    ) -> Result<(), StoreError> {
        self.persist(record).await?;
        for target in targets.iter_mut() {
            target.apply_all(record);
        }
        Ok(())
    }

    async fn wal_append(&self, record: Record) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL error: {e}")))
    }

    /// Exclusive lock with the configured wait limit.
    pub(crate) async fn lock<T>(
        &self,
        cell: &Arc<RwLock<T>>,
    ) -> Result<OwnedRwLockWriteGuard<T>, StoreError> {
        match tokio::time::timeout(self.options.lock_timeout, cell.clone().write_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_WAIT_TIMEOUTS_TOTAL).increment(1);
                Err(StoreError::Unavailable("lock wait timeout".into()))
            }
        }
    }

    // ── Cell lookup ──────────────────────────────────────

    pub(crate) fn slot_cell(&self, slot_id: SlotId) -> Option<SharedSlot> {
        self.slots.get(&slot_id).map(|e| e.value().clone())
    }

    pub(crate) fn subscription_cell(&self, id: SubscriptionId) -> Option<SharedSubscription> {
        self.subscriptions.get(&id).map(|e| e.value().clone())
    }

    /// The one wallet cell for `user_id`, created on first use. Uniqueness
    /// comes from the map entry, so concurrent callers share the same cell.
    pub(crate) fn wallet_cell(&self, user_id: UserId) -> SharedWallet {
        self.wallets
            .entry(user_id)
            .or_insert_with(|| Arc::new(RwLock::new(WalletState::new(user_id))))
            .value()
            .clone()
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    /// Wallet ledgers are carried over in full.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        let _exclusive = self.commit_gate.write().await;
        let snapshot = self.snapshot().await;
        let events = snapshot.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                snapshot,
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction failed: {e}")))?;
        tracing::info!("WAL compacted to {events} events");
        Ok(())
    }

    async fn snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|u| Event::UserRegistered {
            id: u.id,
            email: u.email,
            name: u.name,
        }));

        for cell in sorted_cells(&self.slots) {
            let state = cell.read().await;
            events.push(Event::SlotCreated {
                id: state.slot.id,
                gym_id: state.slot.gym_id,
                span: state.slot.span,
                capacity: state.slot.capacity,
            });
            for b in &state.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    user_id: b.user_id,
                    slot_id: b.slot_id,
                    created_at: b.created_at,
                });
                if !b.is_active() {
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        slot_id: b.slot_id,
                    });
                }
            }
        }

        for cell in sorted_cells(&self.wallets) {
            let state = cell.read().await;
            let Some(wallet) = &state.wallet else { continue };
            events.push(Event::WalletOpened {
                id: wallet.id,
                user_id: wallet.user_id,
                currency: wallet.currency.clone(),
                created_at: wallet.created_at,
            });
            events.extend(state.transactions.iter().map(|t| Event::WalletTransactionAppended {
                id: t.id,
                wallet_id: t.wallet_id,
                user_id: wallet.user_id,
                amount: t.amount,
                kind: t.kind,
                balance_after: t.balance_after,
                created_at: t.created_at,
            }));
        }

        for cell in sorted_cells(&self.subscriptions) {
            let sub = cell.read().await;
            events.push(Event::subscription_created(&sub));
        }

        events
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn sorted_cells<T>(map: &DashMap<i64, Arc<RwLock<T>>>) -> Vec<Arc<RwLock<T>>> {
    let mut cells: Vec<(i64, Arc<RwLock<T>>)> = map
        .iter()
        .map(|e| (*e.key(), e.value().clone()))
        .collect();
    cells.sort_by_key(|(id, _)| *id);
    cells.into_iter().map(|(_, cell)| cell).collect()
}

fn subscription_from_event(event: &Event) -> Option<Subscription> {
    match event {
        Event::SubscriptionCreated {
            id,
            user_id,
            gym_id,
            status,
            visits_limit,
            visits_used,
            price,
            valid_from,
            valid_until,
            created_at,
        } => Some(Subscription {
            id: *id,
            user_id: *user_id,
            gym_id: *gym_id,
            status: *status,
            visits_limit: *visits_limit,
            visits_used: *visits_used,
            price: *price,
            valid_from: *valid_from,
            valid_until: *valid_until,
            created_at: *created_at,
        }),
        _ => None,
    }
}
