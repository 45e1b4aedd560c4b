//! In-process store used by tests and `serve --in-memory`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, SamplerError};
use crate::models::{EntryCode, Reservation, ReservationStatus, SlotCurve};
use crate::store::{CurveStore, EntryCodeStore, ReservationLedger};

#[derive(Debug, Default)]
pub struct MemoryStore {
    curves: Mutex<HashMap<String, Vec<SlotCurve>>>,
    reservations: Mutex<HashMap<String, Vec<Reservation>>>,
    entry_codes: Mutex<HashMap<String, HashMap<String, EntryCode>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn insert_reservation(&self, instance_id: &str, reservation: Reservation) {
        self.reservations
            .lock()
            .await
            .entry(instance_id.to_string())
            .or_default()
            .push(reservation);
    }

    #[cfg(test)]
    pub async fn reservations(&self, instance_id: &str) -> Vec<Reservation> {
        self.reservations
            .lock()
            .await
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn curve_count(&self, instance_id: &str) -> usize {
        self.curves
            .lock()
            .await
            .get(instance_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// Index of the participant's newest `reserved` record.
fn latest_reserved(rows: &[Reservation], participant_id: &str) -> Option<usize> {
    rows.iter()
        .enumerate()
        .filter(|(_, r)| r.participant_id == participant_id && r.status == ReservationStatus::Reserved)
        .max_by_key(|(_, r)| r.reserved_at)
        .map(|(index, _)| index)
}

#[async_trait]
impl CurveStore for MemoryStore {
    async fn load_latest_slot_curve(&self, instance_id: &str) -> Result<Option<SlotCurve>> {
        let curves = self.curves.lock().await;
        // max_by_key keeps the last maximum, i.e. the newest insert on ties
        Ok(curves
            .get(instance_id)
            .and_then(|history| history.iter().max_by_key(|c| c.interval_start))
            .cloned())
    }

    async fn save_new_slot_curve(&self, instance_id: &str, curve: &SlotCurve) -> Result<()> {
        self.curves
            .lock()
            .await
            .entry(instance_id.to_string())
            .or_default()
            .push(curve.clone());
        Ok(())
    }
}

#[async_trait]
impl ReservationLedger for MemoryStore {
    async fn count_active_since(&self, instance_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let reservations = self.reservations.lock().await;
        let count = reservations
            .get(instance_id)
            .map(|rows| rows.iter().filter(|r| r.reserved_at >= since).count())
            .unwrap_or(0);
        Ok(count as i64)
    }

    async fn reserve(
        &self,
        instance_id: &str,
        participant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let reservation = Reservation {
            id: Uuid::new_v4(),
            participant_id: participant_id.to_string(),
            reserved_at: now,
            status: ReservationStatus::Reserved,
        };
        self.reservations
            .lock()
            .await
            .entry(instance_id.to_string())
            .or_default()
            .push(reservation.clone());
        Ok(reservation)
    }

    async fn confirm(&self, instance_id: &str, participant_id: &str) -> Result<Reservation> {
        let mut reservations = self.reservations.lock().await;
        let rows = reservations.entry(instance_id.to_string()).or_default();
        let index = latest_reserved(rows, participant_id)
            .ok_or_else(|| SamplerError::not_found("reserved slot", participant_id))?;
        rows[index].status = ReservationStatus::Confirmed;
        Ok(rows[index].clone())
    }

    async fn cancel(&self, instance_id: &str, participant_id: &str) -> Result<Reservation> {
        let mut reservations = self.reservations.lock().await;
        let rows = reservations.entry(instance_id.to_string()).or_default();
        let index = latest_reserved(rows, participant_id)
            .ok_or_else(|| SamplerError::not_found("reserved slot", participant_id))?;
        Ok(rows.remove(index))
    }

    async fn expire_older_than(
        &self,
        instance_id: &str,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let cutoff = now - retention;
        let mut reservations = self.reservations.lock().await;
        let Some(rows) = reservations.get_mut(instance_id) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !(r.status == ReservationStatus::Reserved && r.reserved_at < cutoff));
        Ok((before - rows.len()) as u64)
    }
}

#[async_trait]
impl EntryCodeStore for MemoryStore {
    async fn add_entry_code(&self, instance_id: &str, code: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut codes = self.entry_codes.lock().await;
        let by_code = codes.entry(instance_id.to_string()).or_default();
        if by_code.contains_key(code) {
            return Ok(false);
        }
        by_code.insert(
            code.to_string(),
            EntryCode {
                code: code.to_string(),
                uploaded_at: now,
                used_at: None,
                used_by: None,
            },
        );
        Ok(true)
    }

    async fn find_entry_code(&self, instance_id: &str, code: &str) -> Result<Option<EntryCode>> {
        let codes = self.entry_codes.lock().await;
        Ok(codes.get(instance_id).and_then(|c| c.get(code)).cloned())
    }

    async fn mark_entry_code_used(
        &self,
        instance_id: &str,
        code: &str,
        used_by: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut codes = self.entry_codes.lock().await;
        match codes.get_mut(instance_id).and_then(|c| c.get_mut(code)) {
            Some(entry) if entry.used_at.is_none() => {
                entry.used_at = Some(now);
                entry.used_by = Some(used_by.to_string());
                Ok(())
            }
            _ => Err(SamplerError::not_found("unused entry code", code)),
        }
    }
}
