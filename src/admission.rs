//! Admission control for one study instance.
//!
//! Every admission runs the same sequence: opportunistic expiry sweep,
//! check-and-refresh of the curve, live count from the ledger, decision, and
//! a reservation when a slot is free. Reading the count and reserving are two
//! separate store calls, so concurrent requests can over-admit briefly; that
//! is accepted in exchange for not needing a transactional reserve.
//! Any other uncertainty denies admission.

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::curve::SampleSet;
use crate::error::Result;
use crate::models::{Reservation, SlotCurve, SlotStatus};
use crate::sampler::{CurvePlan, Sampler};
use crate::store::{CurveStore, ReservationLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub plan: CurvePlan,
    pub retention: Duration,
}

pub struct AdmissionController {
    instance_id: String,
    sampler: RwLock<Sampler>,
    ledger: Arc<dyn ReservationLedger>,
    sample: SampleSet,
    policy: AdmissionPolicy,
}

impl AdmissionController {
    pub fn new(
        instance_id: impl Into<String>,
        curves: Arc<dyn CurveStore>,
        ledger: Arc<dyn ReservationLedger>,
        sample: SampleSet,
        policy: AdmissionPolicy,
    ) -> Self {
        let instance_id = instance_id.into();
        Self {
            sampler: RwLock::new(Sampler::new(instance_id.clone(), curves)),
            instance_id,
            ledger,
            sample,
            policy,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Loads the stored curve at startup. A storage failure is logged and the
    /// sampler stays uninitialized until the first refresh.
    pub async fn load(&self) {
        if let Err(err) = self.sampler.write().await.load_curve().await {
            warn!(instance_id = %self.instance_id, error = %err, "could not load slot curve");
        }
    }

    /// Rebuilds the curve if the cached one is missing or from an older week.
    ///
    /// The check is repeated under the write lock so requests inside this
    /// process refresh at most once per week; separate processes may still
    /// append duplicate curves.
    pub async fn ensure_fresh_curve(&self, now: DateTime<Local>) -> Result<()> {
        if !self.sampler.read().await.needs_refresh_at(&now) {
            return Ok(());
        }

        let mut sampler = self.sampler.write().await;
        if !sampler.needs_refresh_at(&now) {
            return Ok(());
        }
        debug!(instance_id = %self.instance_id, "creating new slot curve from sample");
        sampler
            .refresh_at(&self.sample, self.policy.plan, &now)
            .await?;
        Ok(())
    }

    pub async fn needs_refresh(&self) -> bool {
        self.sampler.read().await.needs_refresh()
    }

    /// Rebuilds the curve for the current week unconditionally.
    pub async fn force_refresh(&self) -> Result<SlotCurve> {
        let mut sampler = self.sampler.write().await;
        let curve = sampler.refresh(&self.sample, self.policy.plan).await?;
        Ok(curve.clone())
    }

    pub async fn current_curve(&self) -> Option<SlotCurve> {
        self.sampler.read().await.curve().cloned()
    }

    /// Deletes abandoned reservations. Failures are logged and ignored.
    pub async fn expire_stale_reservations(&self, now: DateTime<Utc>) -> u64 {
        match self
            .ledger
            .expire_older_than(&self.instance_id, self.policy.retention, now)
            .await
        {
            Ok(removed) => {
                if removed > 0 {
                    info!(instance_id = %self.instance_id, removed, "expired unconfirmed reservations");
                }
                removed
            }
            Err(err) => {
                warn!(instance_id = %self.instance_id, error = %err, "reservation cleanup failed");
                0
            }
        }
    }

    pub async fn status(&self) -> Result<SlotStatus> {
        let now = Local::now();
        self.ensure_fresh_curve(now).await?;

        let sampler = self.sampler.read().await;
        let Some(curve) = sampler.curve() else {
            return Ok(SlotStatus {
                interval_start: None,
                target: 0,
                used: 0,
                available: 0,
            });
        };
        let interval_start = curve.interval_start;
        let since = curve.interval_start_utc();
        let target = sampler.target_open_slots_now();
        drop(sampler);

        let used = self.ledger.count_active_since(&self.instance_id, since).await?;
        Ok(SlotStatus {
            interval_start: Some(interval_start),
            target,
            used,
            available: (target - used).max(0),
        })
    }

    /// Decides whether `participant_id` may proceed and reserves a slot if so.
    pub async fn admit(&self, participant_id: &str) -> bool {
        let now = Local::now();
        self.expire_stale_reservations(now.with_timezone(&Utc)).await;

        if let Err(err) = self.ensure_fresh_curve(now).await {
            error!(instance_id = %self.instance_id, error = %err, "slot curve refresh failed, denying admission");
            return false;
        }

        let (since, target) = {
            let sampler = self.sampler.read().await;
            // a curve from an earlier week must never drive this week's decision
            match sampler.curve() {
                Some(curve) if !sampler.needs_refresh_at(&now) => {
                    (curve.interval_start_utc(), sampler.target_open_slots_at(&now))
                }
                _ => {
                    warn!(instance_id = %self.instance_id, "no current slot curve, denying admission");
                    return false;
                }
            }
        };

        let used = match self.ledger.count_active_since(&self.instance_id, since).await {
            Ok(used) => used,
            Err(err) => {
                error!(instance_id = %self.instance_id, error = %err, "could not count used slots");
                return false;
            }
        };

        let has_free_slot = self
            .sampler
            .read()
            .await
            .has_available_free_slots_at(used, &now);
        if !has_free_slot {
            debug!(instance_id = %self.instance_id, participant_id, target, used, "no free slot");
            return false;
        }

        match self
            .ledger
            .reserve(&self.instance_id, participant_id, now.with_timezone(&Utc))
            .await
        {
            Ok(reservation) => {
                info!(
                    instance_id = %self.instance_id,
                    participant_id,
                    reservation_id = %reservation.id,
                    target,
                    used,
                    "slot reserved"
                );
                true
            }
            Err(err) => {
                error!(instance_id = %self.instance_id, participant_id, error = %err, "slot reservation failed");
                false
            }
        }
    }

    /// Confirms (`accepted`) or cancels the participant's latest reservation.
    pub async fn respond_to_invite(&self, participant_id: &str, accepted: bool) -> Result<Reservation> {
        let result = if accepted {
            self.ledger.confirm(&self.instance_id, participant_id).await
        } else {
            self.ledger.cancel(&self.instance_id, participant_id).await
        };

        match &result {
            Ok(reservation) => info!(
                instance_id = %self.instance_id,
                participant_id,
                accepted,
                reservation_id = %reservation.id,
                "invite response recorded"
            ),
            Err(err) => warn!(
                instance_id = %self.instance_id,
                participant_id,
                accepted,
                error = %err,
                "invite response could not be applied"
            ),
        }
        result
    }
}
