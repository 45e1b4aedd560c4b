use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One step of a slot curve: from `t` seconds after interval start onwards,
/// `value` slots are open in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSlot {
    pub t: i64,
    pub value: i64,
}

/// Planned enrollment pacing for one interval (one week).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotCurve {
    /// Unix seconds of the Monday 00:00 (local time) the curve is anchored to.
    pub interval_start: i64,
    pub open_slots: Vec<OpenSlot>,
}

impl SlotCurve {
    /// Cumulative target at `elapsed` seconds since interval start.
    ///
    /// Walks the steps and keeps the last one whose offset is not after
    /// `elapsed`. Before the first step (negative elapsed) the first step's
    /// value applies; an empty curve opens nothing.
    pub fn target_at(&self, elapsed: i64) -> i64 {
        let Some(first) = self.open_slots.first() else {
            return 0;
        };

        let mut open = first.value;
        for slot in &self.open_slots {
            if slot.t > elapsed {
                break;
            }
            open = slot.value;
        }
        open
    }

    pub fn final_target(&self) -> i64 {
        self.open_slots.last().map(|slot| slot.value).unwrap_or(0)
    }

    pub fn interval_start_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.interval_start, 0).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Reserved,
    Confirmed,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Confirmed => "confirmed",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "reserved" => Ok(ReservationStatus::Reserved),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            other => Err(format!("unknown reservation status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Uuid,
    #[serde(rename = "participantID")]
    pub participant_id: String,
    pub reserved_at: DateTime<Utc>,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryCode {
    pub code: String,
    pub uploaded_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<String>,
}

/// Snapshot of the admission state for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub interval_start: Option<i64>,
    pub target: i64,
    pub used: i64,
    pub available: i64,
}
