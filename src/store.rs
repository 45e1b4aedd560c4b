//! Narrow persistence interfaces consumed by the admission core.
//!
//! Every operation is scoped to one study instance. Implementations must not
//! block indefinitely: a slow or unreachable backend surfaces as a storage
//! error.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::{EntryCode, Reservation, SlotCurve};

/// Append-only history of slot curves per instance.
#[async_trait]
pub trait CurveStore: Send + Sync {
    /// Most recent curve by interval start, newest insert first on ties.
    async fn load_latest_slot_curve(&self, instance_id: &str) -> Result<Option<SlotCurve>>;

    async fn save_new_slot_curve(&self, instance_id: &str, curve: &SlotCurve) -> Result<()>;
}

#[async_trait]
pub trait ReservationLedger: Send + Sync {
    /// Reserved plus confirmed records with `reserved_at >= since`.
    async fn count_active_since(&self, instance_id: &str, since: DateTime<Utc>) -> Result<i64>;

    /// Inserts a `reserved` record. Existing reservations of the participant
    /// are not checked.
    async fn reserve(
        &self,
        instance_id: &str,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation>;

    /// Confirms the participant's most recent `reserved` record, or fails with
    /// `NotFound`.
    async fn confirm(&self, instance_id: &str, participant_id: &str) -> Result<Reservation>;

    /// Deletes the participant's most recent `reserved` record, or fails with
    /// `NotFound`.
    async fn cancel(&self, instance_id: &str, participant_id: &str) -> Result<Reservation>;

    /// Deletes `reserved` records strictly older than `now - retention`.
    /// Confirmed records are never touched. Returns the number removed.
    async fn expire_older_than(
        &self,
        instance_id: &str,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait EntryCodeStore: Send + Sync {
    /// Returns `false` when the code already exists.
    async fn add_entry_code(&self, instance_id: &str, code: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn find_entry_code(&self, instance_id: &str, code: &str) -> Result<Option<EntryCode>>;

    /// Compare-and-set on an unused code; `NotFound` when the code is unknown
    /// or already used.
    async fn mark_entry_code_used(
        &self,
        instance_id: &str,
        code: &str,
        used_by: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
}
