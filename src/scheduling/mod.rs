//! Scheduling core
//!
//! Tutor availability, session booking with its status state machine, slot
//! projection and the periodic reminder sweep.

pub mod availability;
pub mod reminders;
pub mod sessions;
pub mod slots;

use chrono::{FixedOffset, Offset, Utc};
use uuid::Uuid;

use crate::config::{AvailabilityPolicy, SchedulingConfig};
use crate::db::{Directory, Role, User};
use crate::error::AppError;
use crate::time::offset_from_minutes;
use crate::Result;

pub use availability::AvailabilityService;
pub use reminders::{ReminderHandle, ReminderScheduler, SweepReport};
pub use sessions::{BookingRequest, FeedbackRequest, SessionService, StatusChange};
pub use slots::{project_slots, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingRules {
    pub slot_minutes: u16,
    pub offset: FixedOffset,
    pub availability_policy: AvailabilityPolicy,
}

impl SchedulingRules {
    pub fn from_config(config: &SchedulingConfig) -> Result<Self> {
        if config.slot_minutes == 0 {
            return Err(AppError::ConfigError("scheduling.slot_minutes must be positive".to_string()));
        }
        let offset = offset_from_minutes(config.utc_offset_minutes)
            .map_err(|e| AppError::ConfigError(e.to_string()))?;
        Ok(Self {
            slot_minutes: config.slot_minutes,
            offset,
            availability_policy: config.availability_policy,
        })
    }
}

impl Default for SchedulingRules {
    fn default() -> Self {
        Self {
            slot_minutes: 30,
            offset: Utc.fix(),
            availability_policy: AvailabilityPolicy::FullInterval,
        }
    }
}

/// Resolves the caller; an unknown id is not an authenticated user.
pub(crate) async fn load_caller(directory: &dyn Directory, user_id: Uuid) -> Result<User> {
    directory
        .get_user(user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized(format!("Unknown user {}", user_id)))
}

pub(crate) async fn require_role(
    directory: &dyn Directory,
    user_id: Uuid,
    role: Role,
    action: &str,
) -> Result<User> {
    let user = load_caller(directory, user_id).await?;
    if user.role == role {
        Ok(user)
    } else {
        Err(AppError::Forbidden(format!("Only {}s can {}", role, action)))
    }
}
