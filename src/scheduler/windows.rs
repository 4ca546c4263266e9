use crate::adapter::CycleWindow;
use chrono::{Duration, NaiveDateTime};

/// Contiguous fixed-length analysis windows. A window is produced while
/// its start lies before `end_time`; the final window keeps its full
/// length even when `end_time` is not a multiple of `cycle_length`,
/// because a truncated assimilation interval would change the science.
pub fn cycle_windows(
    start_time: NaiveDateTime,
    end_time: NaiveDateTime,
    cycle_length: Duration,
) -> Vec<CycleWindow> {
    let mut windows = Vec::new();
    let mut start = start_time;
    while start < end_time {
        let end = start + cycle_length;
        windows.push(CycleWindow { start, end });
        start = end;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn one_day_with_twelve_hour_cycles_yields_two_windows() {
        let windows = cycle_windows(at(1, 0), at(2, 0), Duration::hours(12));
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start, at(1, 0));
        assert_eq!(windows[0].end, at(1, 12));
        assert_eq!(windows[1].start, at(1, 12));
        assert_eq!(windows[1].end, at(2, 0));
    }

    #[test]
    fn windows_are_contiguous_and_ordered() {
        let windows = cycle_windows(at(1, 0), at(3, 0), Duration::hours(6));
        assert_eq!(windows.len(), 8);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[1].start);
        }
    }

    #[test]
    fn final_window_keeps_full_length_past_end_time() {
        let windows = cycle_windows(at(1, 0), at(1, 20), Duration::hours(12));
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].end, at(2, 0));
    }

    #[test]
    fn empty_when_start_not_before_end() {
        assert!(cycle_windows(at(2, 0), at(1, 0), Duration::hours(12)).is_empty());
    }
}
