//! Per-instance slot curve cache and admission arithmetic.
//!
//! The sampler holds the active curve for one instance as a revalidated read
//! of the [`CurveStore`]. It never triggers a rebuild on its own: callers ask
//! [`Sampler::needs_refresh_at`] and then call [`Sampler::refresh_at`].

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, info};

use crate::curve::{same_iso_week, week_start, SampleSet};
use crate::error::Result;
use crate::models::SlotCurve;
use crate::store::CurveStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Uninitialized,
    Loaded,
    Stale,
}

/// Target size and unconditional floor of each interval's curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurvePlan {
    pub target: i64,
    pub floor: i64,
}

pub struct Sampler {
    instance_id: String,
    store: Arc<dyn CurveStore>,
    curve: Option<SlotCurve>,
}

impl Sampler {
    pub fn new(instance_id: impl Into<String>, store: Arc<dyn CurveStore>) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            curve: None,
        }
    }

    pub fn curve(&self) -> Option<&SlotCurve> {
        self.curve.as_ref()
    }

    /// Loads the newest stored curve. With nothing stored the sampler stays
    /// uninitialized.
    pub async fn load_curve(&mut self) -> Result<()> {
        match self.store.load_latest_slot_curve(&self.instance_id).await? {
            Some(curve) => {
                debug!(
                    instance_id = %self.instance_id,
                    interval_start = curve.interval_start,
                    steps = curve.open_slots.len(),
                    "loaded slot curve"
                );
                self.curve = Some(curve);
            }
            None => {
                debug!(instance_id = %self.instance_id, "no slot curve stored yet");
            }
        }
        Ok(())
    }

    pub fn state_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> SamplerState {
        match &self.curve {
            None => SamplerState::Uninitialized,
            Some(curve) if same_iso_week(curve.interval_start, now) => SamplerState::Loaded,
            Some(_) => SamplerState::Stale,
        }
    }

    pub fn needs_refresh_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> bool {
        self.state_at(now) != SamplerState::Loaded
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(&Local::now())
    }

    /// Builds a new curve anchored at the start of `now`'s week, appends it to
    /// the store and caches it. The cache is left untouched if either step
    /// fails.
    pub async fn refresh_at<Tz: TimeZone>(
        &mut self,
        sample: &SampleSet,
        plan: CurvePlan,
        now: &DateTime<Tz>,
    ) -> Result<&SlotCurve> {
        let interval_start = week_start(now).timestamp();
        let curve = sample.build_curve(plan.target, plan.floor, interval_start)?;
        self.store
            .save_new_slot_curve(&self.instance_id, &curve)
            .await?;

        info!(
            instance_id = %self.instance_id,
            interval_start,
            steps = curve.open_slots.len(),
            target = curve.final_target(),
            "created new slot curve from sample"
        );
        Ok(&*self.curve.insert(curve))
    }

    pub async fn refresh(&mut self, sample: &SampleSet, plan: CurvePlan) -> Result<&SlotCurve> {
        let now = Local::now();
        self.refresh_at(sample, plan, &now).await
    }

    /// Cumulative open-slot target at `now`; 0 without a curve.
    pub fn target_open_slots_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> i64 {
        let Some(curve) = &self.curve else {
            debug!(instance_id = %self.instance_id, "slot curve is not available");
            return 0;
        };
        let elapsed = now.timestamp() - curve.interval_start;
        let target = curve.target_at(elapsed);
        debug!(instance_id = %self.instance_id, elapsed, target, "target slot count");
        target
    }

    pub fn target_open_slots_now(&self) -> i64 {
        self.target_open_slots_at(&Local::now())
    }

    pub fn has_available_free_slots_at<Tz: TimeZone>(&self, used: i64, now: &DateTime<Tz>) -> bool {
        self.target_open_slots_at(now) - used > 0
    }

    pub fn has_available_free_slots(&self, used: i64) -> bool {
        self.has_available_free_slots_at(used, &Local::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::OpenSlot;
    use chrono::{Duration, FixedOffset};

    const INSTANCE: &str = "study-a";

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(3600).unwrap()
    }

    fn plan() -> CurvePlan {
        CurvePlan { target: 6, floor: 2 }
    }

    fn stepped(interval_start: i64) -> SlotCurve {
        SlotCurve {
            interval_start,
            open_slots: vec![
                OpenSlot { t: 0, value: 5 },
                OpenSlot { t: 3600, value: 8 },
                OpenSlot { t: 7200, value: 10 },
            ],
        }
    }

    #[tokio::test]
    async fn refresh_lifecycle_follows_iso_weeks() {
        let store = Arc::new(MemoryStore::new());
        let mut sampler = Sampler::new(INSTANCE, store.clone());
        let wednesday = tz().with_ymd_and_hms(2026, 10, 14, 9, 30, 0).unwrap();

        sampler.load_curve().await.unwrap();
        assert_eq!(sampler.state_at(&wednesday), SamplerState::Uninitialized);
        assert!(sampler.needs_refresh_at(&wednesday));

        let sample = SampleSet::from_minutes([60, 60, 120, 180]);
        let curve = sampler.refresh_at(&sample, plan(), &wednesday).await.unwrap();
        let monday = tz().with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap();
        assert_eq!(curve.interval_start, monday.timestamp());
        assert!(!sampler.needs_refresh_at(&wednesday));

        let sunday_night = tz().with_ymd_and_hms(2026, 10, 18, 23, 59, 59).unwrap();
        assert!(!sampler.needs_refresh_at(&sunday_night));
        let next_monday = sunday_night + Duration::seconds(1);
        assert_eq!(sampler.state_at(&next_monday), SamplerState::Stale);
        assert!(sampler.needs_refresh_at(&next_monday));

        let persisted = store.load_latest_slot_curve(INSTANCE).await.unwrap();
        assert_eq!(persisted.as_ref(), sampler.curve());
    }

    #[tokio::test]
    async fn load_picks_up_stored_curve() {
        let store = Arc::new(MemoryStore::new());
        let monday = tz().with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap();
        store
            .save_new_slot_curve(INSTANCE, &stepped(monday.timestamp()))
            .await
            .unwrap();

        let mut sampler = Sampler::new(INSTANCE, store);
        sampler.load_curve().await.unwrap();
        assert_eq!(sampler.state_at(&monday), SamplerState::Loaded);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_state() {
        let store = Arc::new(MemoryStore::new());
        let mut sampler = Sampler::new(INSTANCE, store.clone());
        let now = tz().with_ymd_and_hms(2026, 10, 14, 9, 30, 0).unwrap();

        let err = sampler
            .refresh_at(&SampleSet::default(), plan(), &now)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::SamplerError::Configuration(_)));
        assert!(sampler.curve().is_none());
        assert_eq!(store.curve_count(INSTANCE).await, 0);
    }

    #[tokio::test]
    async fn target_walks_the_step_function() {
        let store = Arc::new(MemoryStore::new());
        let start = tz().with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap();
        store
            .save_new_slot_curve(INSTANCE, &stepped(start.timestamp()))
            .await
            .unwrap();
        let mut sampler = Sampler::new(INSTANCE, store);
        sampler.load_curve().await.unwrap();

        let at = |secs: i64| start + Duration::seconds(secs);
        assert_eq!(sampler.target_open_slots_at(&at(0)), 5);
        assert_eq!(sampler.target_open_slots_at(&at(3599)), 5);
        assert_eq!(sampler.target_open_slots_at(&at(3600)), 8);
        assert_eq!(sampler.target_open_slots_at(&at(10_000)), 10);

        assert!(sampler.has_available_free_slots_at(7, &at(3600)));
        assert!(!sampler.has_available_free_slots_at(8, &at(3600)));
        assert!(!sampler.has_available_free_slots_at(9, &at(3600)));
    }

    #[test]
    fn uninitialized_sampler_admits_nobody() {
        let sampler = Sampler::new(INSTANCE, Arc::new(MemoryStore::new()));
        assert_eq!(sampler.target_open_slots_now(), 0);
        assert!(!sampler.has_available_free_slots(0));
        assert!(sampler.needs_refresh());
    }
}
