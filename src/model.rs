use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Money in minor currency units.
pub type Cents = i64;

pub type UserId = i64;
pub type GymId = i64;
pub type SlotId = i64;
pub type BookingId = i64;
pub type WalletId = i64;
pub type SubscriptionId = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The slot has started (or is about to start right now).
    pub fn has_started(&self, now: Ms) -> bool {
        self.start <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
}

/// A bookable window at a gym. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub gym_id: GymId,
    pub span: Span,
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Booked => "booked",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub slot_id: SlotId,
    pub status: BookingStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Booked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub balance: Cents,
    pub currency: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Topup,
    BookingPayment,
    SubscriptionPayment,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Topup => "topup",
            TransactionType::BookingPayment => "booking_payment",
            TransactionType::SubscriptionPayment => "subscription_payment",
            TransactionType::Refund => "refund",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "topup" => Ok(TransactionType::Topup),
            "booking_payment" => Ok(TransactionType::BookingPayment),
            "subscription_payment" => Ok(TransactionType::SubscriptionPayment),
            "refund" => Ok(TransactionType::Refund),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

/// One ledger line. Never mutated or removed once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Ulid,
    pub wallet_id: WalletId,
    /// Signed: negative is a debit.
    pub amount: Cents,
    pub kind: TransactionType,
    pub balance_after: Cents,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    /// `None` means the subscription is valid at any gym.
    pub gym_id: Option<GymId>,
    pub status: SubscriptionStatus,
    /// `None` means unlimited visits.
    pub visits_limit: Option<u32>,
    pub visits_used: u32,
    pub price: Cents,
    pub valid_from: Ms,
    pub valid_until: Ms,
    pub created_at: Ms,
}

impl Subscription {
    /// Active and inside `[valid_from, valid_until]`.
    pub fn is_current(&self, now: Ms) -> bool {
        self.status == SubscriptionStatus::Active && self.valid_from <= now && now <= self.valid_until
    }

    /// Current, and scoped to `gym_id` or unscoped.
    pub fn applies_to(&self, gym_id: GymId, now: Ms) -> bool {
        self.is_current(now) && self.gym_id.is_none_or(|g| g == gym_id)
    }

    pub fn has_visits_left(&self) -> bool {
        self.visits_limit.is_none_or(|limit| self.visits_used < limit)
    }

    pub fn is_exhausted(&self) -> bool {
        !self.has_visits_left()
    }

    /// Can pay for a booking at `gym_id` right now.
    pub fn is_usable(&self, gym_id: GymId, now: Ms) -> bool {
        self.applies_to(gym_id, now) && self.has_visits_left()
    }

    /// Ordering key for entitlement selection: gym-scoped before unscoped,
    /// then the more expensive tier. Smaller sorts first.
    pub fn priority(&self) -> (bool, std::cmp::Reverse<Cents>) {
        (self.gym_id.is_none(), std::cmp::Reverse(self.price))
    }
}

/// How a booking was paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Wallet,
    Subscription,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Wallet => "wallet",
            PaymentMethod::Subscription => "subscription",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PaymentDetails {
    Wallet {
        amount_debited: Cents,
        balance_after: Cents,
    },
    Subscription {
        subscription_id: SubscriptionId,
        visits_used: u32,
        visits_limit: Option<u32>,
    },
}

impl PaymentDetails {
    pub fn method(&self) -> PaymentMethod {
        match self {
            PaymentDetails::Wallet { .. } => PaymentMethod::Wallet,
            PaymentDetails::Subscription { .. } => PaymentMethod::Subscription,
        }
    }
}

/// Result of a successful `book_slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingOutcome {
    pub booking: Booking,
    pub payment: PaymentDetails,
}

/// A booking joined with its slot window and the booking user. The user
/// fields are `None` when the id was never registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDetails {
    pub booking: Booking,
    pub gym_id: GymId,
    pub span: Span,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
}

/// Bookings split by their current status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingCounts {
    pub booked: u32,
    pub cancelled: u32,
}

impl BookingCounts {
    pub fn count(&mut self, booking: &Booking) {
        match booking.status {
            BookingStatus::Booked => self.booked += 1,
            BookingStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// Counts for bookings created on one UTC day. `day` is its first millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyBookingStats {
    pub day: Ms,
    pub counts: BookingCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GymBookingStats {
    pub gym_id: GymId,
    pub counts: BookingCounts,
}

pub const DAY_MS: Ms = 86_400_000;

/// Start of the UTC day containing `at`.
pub fn day_start(at: Ms) -> Ms {
    at.div_euclid(DAY_MS) * DAY_MS
}

/// Slot together with its current occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAvailability {
    pub slot: Slot,
    pub booked: u32,
    pub available: u32,
    pub is_full: bool,
}

/// The event types, flat with no nesting. A WAL entry carries one or more of
/// these that are applied together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: UserId,
        email: String,
        name: String,
    },
    SlotCreated {
        id: SlotId,
        gym_id: GymId,
        span: Span,
        capacity: u32,
    },
    BookingCreated {
        id: BookingId,
        user_id: UserId,
        slot_id: SlotId,
        created_at: Ms,
    },
    BookingCancelled {
        id: BookingId,
        slot_id: SlotId,
    },
    WalletOpened {
        id: WalletId,
        user_id: UserId,
        currency: String,
        created_at: Ms,
    },
    WalletTransactionAppended {
        id: Ulid,
        wallet_id: WalletId,
        user_id: UserId,
        amount: Cents,
        kind: TransactionType,
        balance_after: Cents,
        created_at: Ms,
    },
    SubscriptionCreated {
        id: SubscriptionId,
        user_id: UserId,
        gym_id: Option<GymId>,
        status: SubscriptionStatus,
        visits_limit: Option<u32>,
        visits_used: u32,
        price: Cents,
        valid_from: Ms,
        valid_until: Ms,
        created_at: Ms,
    },
    SubscriptionVisitUsed {
        id: SubscriptionId,
    },
    SubscriptionStatusChanged {
        id: SubscriptionId,
        status: SubscriptionStatus,
    },
}

impl Event {
    pub fn subscription_created(sub: &Subscription) -> Self {
        Event::SubscriptionCreated {
            id: sub.id,
            user_id: sub.user_id,
            gym_id: sub.gym_id,
            status: sub.status,
            visits_limit: sub.visits_limit,
            visits_used: sub.visits_used,
            price: sub.price,
            valid_from: sub.valid_from,
            valid_until: sub.valid_until,
            created_at: sub.created_at,
        }
    }
}
