use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::{sync::mpsc::UnboundedSender, task::AbortHandle};
use tracing::debug;

use heating_common::{DayOfWeek, TimerHandle, TimerTarget, WeekdaySet};

use crate::mqtt::HostMessage;

pub fn local_now(timezone: Tz) -> NaiveDateTime {
    Utc::now().with_timezone(&timezone).naive_local()
}

/// First instant strictly after `after` that falls on `at` on one of
/// `weekdays`.
pub fn next_daily_occurrence(
    after: NaiveDateTime,
    at: NaiveTime,
    weekdays: WeekdaySet,
) -> Option<NaiveDateTime> {
    (0..=7)
        .map(|offset| (after.date() + Duration::days(offset)).and_time(at))
        .find(|candidate| {
            *candidate > after && weekdays.contains(DayOfWeek::from_chrono(candidate.weekday()))
        })
}

/// Wall-clock delay until a local time. Local times skipped by a DST change
/// are taken an hour later.
fn delay_until(timezone: Tz, local: NaiveDateTime) -> std::time::Duration {
    let target = timezone
        .from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            timezone
                .from_local_datetime(&(local + Duration::hours(1)))
                .earliest()
        });

    target
        .map(|target| target.with_timezone(&Utc).signed_duration_since(Utc::now()))
        .and_then(|delay| delay.to_std().ok())
        .unwrap_or(std::time::Duration::ZERO)
}

pub fn spawn_daily(
    timezone: Tz,
    at: NaiveTime,
    weekdays: WeekdaySet,
    handle: TimerHandle,
    target: TimerTarget,
    dispatch: UnboundedSender<HostMessage>,
) -> AbortHandle {
    tokio::spawn(async move {
        let mut after = local_now(timezone);
        while let Some(next) = next_daily_occurrence(after, at, weekdays) {
            debug!(room = %target.room, %next, "timer armed");
            tokio::time::sleep(delay_until(timezone, next)).await;
            if dispatch
                .send(HostMessage::Timer(handle, target.clone()))
                .is_err()
            {
                return;
            }
            after = next;
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn fires_later_today_when_allowed() {
        let workdays: WeekdaySet = "1-5".parse().unwrap();
        // Tuesday
        assert_eq!(
            next_daily_occurrence(at(6, 7, 30), time(8, 0), workdays),
            Some(at(6, 8, 0))
        );
    }

    #[test]
    fn skips_to_next_allowed_day() {
        let workdays: WeekdaySet = "1-5".parse().unwrap();
        // Friday after the boundary, then Monday.
        assert_eq!(
            next_daily_occurrence(at(9, 8, 0), time(8, 0), workdays),
            Some(at(12, 8, 0))
        );
        let sundays: WeekdaySet = "7".parse().unwrap();
        assert_eq!(
            next_daily_occurrence(at(11, 9, 0), time(6, 0), sundays),
            Some(at(18, 6, 0))
        );
    }

    #[test]
    fn past_deadlines_fire_immediately() {
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        assert_eq!(delay_until(berlin, at(5, 6, 0)), std::time::Duration::ZERO);
    }
}
