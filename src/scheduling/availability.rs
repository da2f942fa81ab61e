use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AvailabilityPolicy;
use crate::db::{AvailabilityPatch, AvailabilityWindow, NewAvailability, Recurrence, Role, Stores};
use crate::error::AppError;
use crate::scheduling::slots::{project_slots, Slot};
use crate::scheduling::{load_caller, require_role, SchedulingRules};
use crate::time::{self, day_bounds, local_parts, WallClock};
use crate::Result;

const INVALID_TIME: &str = "Invalid time format. Use HH:MM in 24-hour format.";
const END_BEFORE_START: &str = "End time must be after start time.";
const DAY_OUT_OF_RANGE: &str = "Day of week must be between 0 (Sunday) and 6 (Saturday).";
const DAY_REQUIRED: &str = "Day of week is required for recurring availability.";
const DATE_REQUIRED: &str = "Date is required for non-recurring availability.";

fn parse_wall_clock(raw: &str) -> Result<WallClock> {
    raw.parse()
        .map_err(|_| AppError::Validation(INVALID_TIME.to_string()))
}

fn parse_day(day: i64) -> Result<u8> {
    u8::try_from(day)
        .ok()
        .filter(|d| *d <= 6)
        .ok_or_else(|| AppError::Validation(DAY_OUT_OF_RANGE.to_string()))
}

fn check_order(start: WallClock, end: WallClock) -> Result<()> {
    if time::is_end_after_start(start, end) {
        Ok(())
    } else {
        Err(AppError::Validation(END_BEFORE_START.to_string()))
    }
}

/// Builds the recurrence of a new window. Without an explicit flag a window
/// is recurring unless it names a date.
fn recurrence_of(input: &NewAvailability) -> Result<Recurrence> {
    // Range-checked even when the window ends up pinned to a date
    let day = input.day_of_week.map(parse_day).transpose()?;
    let recurring = input.is_recurring.unwrap_or(input.date.is_none());
    if recurring {
        let day_of_week = day.ok_or_else(|| AppError::Validation(DAY_REQUIRED.to_string()))?;
        Ok(Recurrence::Weekly { day_of_week })
    } else {
        let raw = input
            .date
            .as_deref()
            .ok_or_else(|| AppError::Validation(DATE_REQUIRED.to_string()))?;
        Ok(Recurrence::OnDate { date: time::parse_date(raw)? })
    }
}

/// Merges a patch into the current recurrence. Fields that do not apply to
/// the resulting kind are ignored.
fn merged_recurrence(current: Recurrence, patch: &AvailabilityPatch) -> Result<Recurrence> {
    let day = patch.day_of_week.map(parse_day).transpose()?;
    let recurring = patch.is_recurring.unwrap_or(current.is_recurring());
    if recurring {
        let day_of_week = match (day, current) {
            (Some(day), _) => day,
            (None, Recurrence::Weekly { day_of_week }) => day_of_week,
            (None, Recurrence::OnDate { date }) => time::day_of_week(date),
        };
        Ok(Recurrence::Weekly { day_of_week })
    } else {
        let date = match (patch.date.as_deref(), current) {
            (Some(raw), _) => time::parse_date(raw)?,
            (None, Recurrence::OnDate { date }) => date,
            (None, Recurrence::Weekly { .. }) => {
                return Err(AppError::Validation(DATE_REQUIRED.to_string()))
            }
        };
        Ok(Recurrence::OnDate { date })
    }
}

/// Tutor availability: declared windows, the booking containment check and
/// the per-date slot view.
pub struct AvailabilityService {
    stores: Stores,
    clock: Arc<dyn Clock>,
    rules: SchedulingRules,
}

impl AvailabilityService {
    pub fn new(stores: Stores, clock: Arc<dyn Clock>, rules: SchedulingRules) -> Self {
        Self { stores, clock, rules }
    }

    pub fn rules(&self) -> &SchedulingRules {
        &self.rules
    }

    pub async fn add(&self, tutor_id: Uuid, input: NewAvailability) -> Result<AvailabilityWindow> {
        require_role(self.stores.directory.as_ref(), tutor_id, Role::Tutor, "add availability").await?;

        let start_time = parse_wall_clock(&input.start_time)?;
        let end_time = parse_wall_clock(&input.end_time)?;
        check_order(start_time, end_time)?;
        let recurrence = recurrence_of(&input)?;

        let now = self.clock.now();
        let window = AvailabilityWindow {
            id: Uuid::new_v4(),
            tutor_id,
            recurrence,
            start_time,
            end_time,
            created_at: now,
            updated_at: now,
        };
        let window = self.stores.availability.insert_window(&window).await?;
        info!(tutor = %tutor_id, window = %window.id, "availability added");
        Ok(window)
    }

    /// Loads a window and checks that `tutor_id` owns it.
    async fn owned_window(&self, tutor_id: Uuid, id: Uuid, action: &str) -> Result<AvailabilityWindow> {
        load_caller(self.stores.directory.as_ref(), tutor_id).await?;
        let window = self
            .stores
            .availability
            .get_window(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Availability not found".to_string()))?;
        if window.tutor_id != tutor_id {
            warn!(caller = %tutor_id, window = %id, "rejected availability {} by non-owner", action);
            return Err(AppError::Forbidden(format!(
                "You can only {} your own availability",
                action
            )));
        }
        Ok(window)
    }

    pub async fn update(&self, tutor_id: Uuid, id: Uuid, patch: AvailabilityPatch) -> Result<AvailabilityWindow> {
        let mut window = self.owned_window(tutor_id, id, "update").await?;

        let start_time = match patch.start_time.as_deref() {
            Some(raw) => parse_wall_clock(raw)?,
            None => window.start_time,
        };
        let end_time = match patch.end_time.as_deref() {
            Some(raw) => parse_wall_clock(raw)?,
            None => window.end_time,
        };
        check_order(start_time, end_time)?;

        window.recurrence = merged_recurrence(window.recurrence, &patch)?;
        window.start_time = start_time;
        window.end_time = end_time;

        let updated = self
            .stores
            .availability
            .update_window(&window)
            .await?
            .ok_or_else(|| AppError::NotFound("Availability not found".to_string()))?;
        info!(tutor = %tutor_id, window = %id, "availability updated");
        Ok(updated)
    }

    pub async fn remove(&self, tutor_id: Uuid, id: Uuid) -> Result<()> {
        self.owned_window(tutor_id, id, "delete").await?;
        if !self.stores.availability.delete_window(id).await? {
            return Err(AppError::NotFound("Availability not found".to_string()));
        }
        info!(tutor = %tutor_id, window = %id, "availability removed");
        Ok(())
    }

    pub async fn list_mine(&self, tutor_id: Uuid) -> Result<Vec<AvailabilityWindow>> {
        require_role(self.stores.directory.as_ref(), tutor_id, Role::Tutor, "view their availability").await?;
        self.stores.availability.windows_for_tutor(tutor_id).await
    }

    pub async fn list_for_tutor(&self, tutor_id: Uuid) -> Result<Vec<AvailabilityWindow>> {
        self.ensure_tutor(tutor_id).await?;
        self.stores.availability.windows_for_tutor(tutor_id).await
    }

    async fn ensure_tutor(&self, tutor_id: Uuid) -> Result<()> {
        match self.stores.directory.get_user(tutor_id).await? {
            Some(user) if user.role == Role::Tutor => Ok(()),
            _ => Err(AppError::NotFound("Tutor not found".to_string())),
        }
    }

    /// Whether `[start, end)` falls inside one of the tutor's windows under
    /// the configured policy. Day and time-of-day are taken in the configured
    /// offset.
    pub async fn is_available(&self, tutor_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<bool> {
        let from = local_parts(start, self.rules.offset);
        let windows = self.stores.availability.windows_for_date(tutor_id, from.date).await?;

        let available = match self.rules.availability_policy {
            AvailabilityPolicy::StartOnly => windows.iter().any(|w| w.contains_time(from.time)),
            AvailabilityPolicy::FullInterval => {
                let to = local_parts(end, self.rules.offset);
                to.date == from.date && windows.iter().any(|w| w.contains_span(from.time, to.time))
            }
        };
        Ok(available)
    }

    pub async fn list_slots_for_date(&self, tutor_id: Uuid, date: &str) -> Result<Vec<Slot>> {
        self.ensure_tutor(tutor_id).await?;
        let date: NaiveDate = time::parse_date(date)?;

        let windows = self.stores.availability.windows_for_date(tutor_id, date).await?;
        let (from, to) = day_bounds(date, self.rules.offset);
        let booked = self.stores.sessions.active_sessions_between(tutor_id, from, to).await?;

        Ok(project_slots(&windows, &booked, date, self.rules.offset, self.rules.slot_minutes))
    }
}
