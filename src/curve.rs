//! Slot curve construction from historical completion times.
//!
//! A curve is bootstrapped from the sample: `target - floor` offsets are drawn
//! with replacement, sorted, and folded into a cumulative step function that
//! starts at `(0, floor)`.

use std::path::Path;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone};
use rand::Rng;

use crate::error::{Result, SamplerError};
use crate::models::{OpenSlot, SlotCurve};

/// Historical offsets (seconds since interval start) at which past
/// participants completed enrollment.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    offsets: Vec<i64>,
}

impl SampleSet {
    pub fn from_minutes(minutes: impl IntoIterator<Item = i64>) -> Self {
        Self {
            offsets: minutes.into_iter().map(|m| m * 60).collect(),
        }
    }

    /// Reads a CSV whose second column holds minutes since interval start.
    /// The header row is skipped.
    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|err| {
                SamplerError::configuration(format!(
                    "unable to read sample file {}: {err}",
                    path.display()
                ))
            })?;

        let mut minutes = Vec::new();
        for (index, record) in reader.records().enumerate() {
            // header is line 1
            let line = index + 2;
            let record = record.map_err(|err| {
                SamplerError::configuration(format!("sample file line {line}: {err}"))
            })?;
            let raw = record.get(1).ok_or_else(|| {
                SamplerError::configuration(format!("sample file line {line}: missing second column"))
            })?;
            let value: i64 = raw.trim().parse().map_err(|_| {
                SamplerError::configuration(format!(
                    "sample file line {line}: '{raw}' is not a whole number of minutes"
                ))
            })?;
            if value < 0 {
                return Err(SamplerError::configuration(format!(
                    "sample file line {line}: negative offset {value}"
                )));
            }
            minutes.push(value);
        }

        Ok(Self::from_minutes(minutes))
    }

    pub fn offsets(&self) -> &[i64] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Builds a curve with the thread-local RNG.
    pub fn build_curve(&self, target: i64, floor: i64, interval_start: i64) -> Result<SlotCurve> {
        build_slot_curve(
            self.offsets(),
            target,
            floor,
            interval_start,
            &mut rand::thread_rng(),
        )
    }
}

pub fn build_slot_curve<R: Rng>(
    sample: &[i64],
    target: i64,
    floor: i64,
    interval_start: i64,
    rng: &mut R,
) -> Result<SlotCurve> {
    let mut open_slots = vec![OpenSlot { t: 0, value: floor }];

    if target <= floor {
        return Ok(SlotCurve {
            interval_start,
            open_slots,
        });
    }

    if sample.is_empty() {
        return Err(SamplerError::configuration(
            "sample set is empty, cannot draw slot openings",
        ));
    }

    let draws = (target - floor) as usize;
    let mut drawn: Vec<i64> = (0..draws)
        .map(|_| sample[rng.gen_range(0..sample.len())])
        .collect();
    drawn.sort_unstable();

    for offset in drawn {
        let last = open_slots.len() - 1;
        if open_slots[last].t == offset {
            open_slots[last].value += 1;
        } else {
            let value = open_slots[last].value + 1;
            open_slots.push(OpenSlot { t: offset, value });
        }
    }

    Ok(SlotCurve {
        interval_start,
        open_slots,
    })
}

/// Monday 00:00 of the week containing `now`, in `now`'s time zone.
pub fn week_start<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let days_back = i64::from(now.weekday().num_days_from_monday());
    let midnight = (now.date_naive() - Duration::days(days_back)).and_time(NaiveTime::MIN);
    let tz = now.timezone();
    tz.from_local_datetime(&midnight)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&midnight))
}

/// Whether the unix timestamp `start` falls in the same ISO week as `now`,
/// both read in `now`'s time zone.
pub fn same_iso_week<Tz: TimeZone>(start: i64, now: &DateTime<Tz>) -> bool {
    match now.timezone().timestamp_opt(start, 0).single() {
        Some(anchor) => anchor.iso_week() == now.iso_week(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::Write;

    fn assert_monotonic(curve: &SlotCurve) {
        assert_eq!(curve.open_slots[0].t, 0);
        for pair in curve.open_slots.windows(2) {
            assert!(pair[0].t < pair[1].t, "offsets must increase: {pair:?}");
            assert!(pair[0].value < pair[1].value, "counts must increase: {pair:?}");
        }
    }

    #[test]
    fn reaches_target_with_monotonic_steps() {
        let sample = SampleSet::from_minutes([5, 90, 90, 600, 1440, 2880, 9000]);
        for seed in 0..25 {
            let mut rng = StdRng::seed_from_u64(seed);
            let curve = build_slot_curve(sample.offsets(), 40, 3, 1_000, &mut rng).unwrap();
            assert_eq!(curve.interval_start, 1_000);
            assert_eq!(curve.open_slots[0].value, 3);
            assert_eq!(curve.final_target(), 40);
            assert_monotonic(&curve);
        }
    }

    #[test]
    fn saturated_when_target_not_above_floor() {
        let mut rng = StdRng::seed_from_u64(7);
        let curve = build_slot_curve(&[600], 4, 4, 0, &mut rng).unwrap();
        assert_eq!(curve.open_slots, vec![OpenSlot { t: 0, value: 4 }]);

        let curve = build_slot_curve(&[], 2, 5, 0, &mut rng).unwrap();
        assert_eq!(curve.open_slots, vec![OpenSlot { t: 0, value: 5 }]);
    }

    #[test]
    fn empty_sample_is_a_configuration_error() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = build_slot_curve(&[], 6, 2, 0, &mut rng).unwrap_err();
        assert!(matches!(err, SamplerError::Configuration(_)));
    }

    #[test]
    fn zero_offsets_merge_into_the_floor_step() {
        let mut rng = StdRng::seed_from_u64(3);
        let curve = build_slot_curve(&[0], 5, 1, 0, &mut rng).unwrap();
        assert_eq!(curve.open_slots, vec![OpenSlot { t: 0, value: 5 }]);
    }

    #[test]
    fn colliding_draws_coalesce() {
        let mut rng = StdRng::seed_from_u64(11);
        let curve = build_slot_curve(&[3600], 4, 0, 0, &mut rng).unwrap();
        assert_eq!(
            curve.open_slots,
            vec![OpenSlot { t: 0, value: 0 }, OpenSlot { t: 3600, value: 4 }]
        );
    }

    #[test]
    fn sample_file_end_to_end() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "participant,minutes").unwrap();
        for (id, minutes) in [("a", 60), ("b", 60), ("c", 120), ("d", 180)] {
            writeln!(file, "{id},{minutes}").unwrap();
        }

        let sample = SampleSet::load_csv(file.path()).unwrap();
        assert_eq!(sample.offsets(), &[3600, 3600, 7200, 10800]);

        let curve = sample.build_curve(6, 2, 0).unwrap();
        assert_eq!(curve.open_slots[0], OpenSlot { t: 0, value: 2 });
        assert_eq!(curve.final_target(), 6);
        assert_monotonic(&curve);
        for slot in &curve.open_slots[1..] {
            assert_eq!(slot.t % 3600, 0);
        }
    }

    #[test]
    fn sample_file_rejects_bad_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "participant,minutes").unwrap();
        writeln!(file, "a,sixty").unwrap();
        let err = SampleSet::load_csv(file.path()).unwrap_err();
        assert!(err.to_string().contains("line 2"));

        let err = SampleSet::load_csv(Path::new("/nonexistent/sample.csv")).unwrap_err();
        assert!(matches!(err, SamplerError::Configuration(_)));
    }

    #[test]
    fn week_starts_on_monday_midnight() {
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        // Sunday 2026-10-18 23:30 +02:00
        let sunday = tz.with_ymd_and_hms(2026, 10, 18, 23, 30, 0).unwrap();
        let start = week_start(&sunday);
        assert_eq!(start, tz.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap());

        let monday = tz.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap();
        assert_eq!(week_start(&monday), monday);
    }

    #[test]
    fn iso_week_comparison() {
        let start = Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap().timestamp();
        let same = Utc.with_ymd_and_hms(2026, 10, 18, 23, 59, 59).unwrap();
        let next = Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap();
        assert!(same_iso_week(start, &same));
        assert!(!same_iso_week(start, &next));

        // same week number, different ISO year
        let old = Utc.with_ymd_and_hms(2025, 10, 13, 0, 0, 0).unwrap().timestamp();
        assert!(!same_iso_week(old, &same));
    }
}
