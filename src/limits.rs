use crate::model::Cents;

pub const MAX_SLOT_CAPACITY: u32 = 10_000;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_NAME_LEN: usize = 256;

/// Largest single top-up, in minor units.
pub const MAX_TOPUP: Cents = 100_000_000;
pub const MAX_PRICE: Cents = 100_000_000;

pub const DEFAULT_TRANSACTIONS_PAGE: usize = 50;
pub const MAX_TRANSACTIONS_PAGE: usize = 1_000;

/// Candidate re-selections when the chosen subscription changes under us.
pub const MAX_ENTITLEMENT_RETRIES: usize = 4;

/// Largest encoded WAL record. Bigger length prefixes are treated as damage.
pub const MAX_WAL_RECORD_BYTES: usize = 64 * 1024 * 1024;
