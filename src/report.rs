use std::fmt::Write;

use chrono::{DateTime, Local};

use crate::models::{SlotCurve, SlotStatus};

/// Renders an offset in seconds as `Nd hh:mm`.
pub fn format_offset(seconds: i64) -> String {
    let minutes = seconds / 60;
    format!(
        "{}d {:02}:{:02}",
        minutes / (24 * 60),
        (minutes / 60) % 24,
        minutes % 60
    )
}

pub fn build_report(
    instance_id: &str,
    curve: Option<&SlotCurve>,
    status: &SlotStatus,
    generated_at: DateTime<Local>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Enrollment Pacing Report");
    let _ = writeln!(
        output,
        "Generated for {} at {}",
        instance_id,
        generated_at.format("%Y-%m-%d %H:%M")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Current Week");

    let Some(curve) = curve else {
        let _ = writeln!(output, "No slot curve available for this week.");
        return output;
    };

    let start = DateTime::from_timestamp(curve.interval_start, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| curve.interval_start.to_string());
    let _ = writeln!(output, "- Interval start: {start}");
    let _ = writeln!(output, "- Target now: {}", status.target);
    let _ = writeln!(output, "- Used slots: {}", status.used);
    let _ = writeln!(output, "- Available: {}", status.available);
    let _ = writeln!(output, "- Weekly target: {}", curve.final_target());

    let _ = writeln!(output);
    let _ = writeln!(output, "## Slot Curve");
    let _ = writeln!(output, "| Offset | Open slots |");
    let _ = writeln!(output, "|---|---|");
    for slot in &curve.open_slots {
        let _ = writeln!(output, "| {} | {} |", format_offset(slot.t), slot.value);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpenSlot;

    #[test]
    fn offsets_render_as_days_and_clock_time() {
        assert_eq!(format_offset(0), "0d 00:00");
        assert_eq!(format_offset(3600), "0d 01:00");
        assert_eq!(format_offset(2 * 86_400 + 5 * 3600 + 7 * 60), "2d 05:07");
    }

    #[test]
    fn report_lists_every_step() {
        let curve = SlotCurve {
            interval_start: 1_791_244_800,
            open_slots: vec![OpenSlot { t: 0, value: 2 }, OpenSlot { t: 7200, value: 6 }],
        };
        let status = SlotStatus {
            interval_start: Some(curve.interval_start),
            target: 6,
            used: 4,
            available: 2,
        };
        let report = build_report("study-a", Some(&curve), &status, Local::now());

        assert!(report.contains("Generated for study-a"));
        assert!(report.contains("- Available: 2"));
        assert!(report.contains("| 0d 02:00 | 6 |"));
    }

    #[test]
    fn report_without_curve() {
        let status = SlotStatus {
            interval_start: None,
            target: 0,
            used: 0,
            available: 0,
        };
        let report = build_report("study-a", None, &status, Local::now());
        assert!(report.contains("No slot curve available"));
    }
}
