use chrono::{Duration, FixedOffset, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::db::{AvailabilityWindow, Session};
use crate::time::{at_wall_clock, generate_slots, periods_overlap, WallClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub time: WallClock,
    pub available: bool,
}

/// Splits the windows into `slot_minutes` slots on `date` and marks each one
/// taken when it overlaps a booked session.
///
/// The result is sorted by time with one entry per start time, even when
/// windows overlap. `booked` is expected to hold active sessions only.
pub fn project_slots(
    windows: &[AvailabilityWindow],
    booked: &[Session],
    date: NaiveDate,
    offset: FixedOffset,
    slot_minutes: u16,
) -> Vec<Slot> {
    let length = Duration::minutes(slot_minutes as i64);
    let mut slots: BTreeMap<WallClock, bool> = BTreeMap::new();

    for window in windows.iter().filter(|w| w.recurrence.applies_to(date)) {
        for time in generate_slots(window.start_time, window.end_time, slot_minutes) {
            slots.entry(time).or_insert_with(|| {
                let start = at_wall_clock(date, time, offset);
                let end = start + length;
                !booked
                    .iter()
                    .any(|s| periods_overlap(start, end, s.start_time, s.end_time))
            });
        }
    }

    slots
        .into_iter()
        .map(|(time, available)| Slot { time, available })
        .collect()
}
