use butler_core::config::ScheduleSpec;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

/// Compute the next UTC execution time for `spec` strictly after `from`.
///
/// Returns `None` when the schedule is exhausted (a `Once` whose instant has
/// already passed).
pub fn compute_next_run(spec: &ScheduleSpec, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match spec {
        ScheduleSpec::Once { at } => {
            if *at > from {
                Some(*at)
            } else {
                None
            }
        }

        ScheduleSpec::Interval { every_secs } => {
            Some(from + Duration::seconds((*every_secs).max(1) as i64))
        }

        ScheduleSpec::Daily { hour, minute } => {
            let candidate = Utc
                .with_ymd_and_hms(
                    from.year(),
                    from.month(),
                    from.day(),
                    (*hour as u32).min(23),
                    (*minute as u32).min(59),
                    0,
                )
                .single()?;
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }

        ScheduleSpec::Weekly { day, hour, minute } => {
            // ISO weekday numbering: 0 = Monday … 6 = Sunday.
            let today_dow = from.weekday().num_days_from_monday() as i64;
            let target_dow = (*day as i64).clamp(0, 6);
            let days_ahead = (target_dow - today_dow).rem_euclid(7);

            let candidate_day = from + Duration::days(days_ahead);
            let candidate = Utc
                .with_ymd_and_hms(
                    candidate_day.year(),
                    candidate_day.month(),
                    candidate_day.day(),
                    (*hour as u32).min(23),
                    (*minute as u32).min(59),
                    0,
                )
                .single()?;
            if candidate > from {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(7))
            }
        }
    }
}
