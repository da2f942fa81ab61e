//! Notification dispatch
//!
//! The scheduling core hands notifications to a `Notifier` and never lets a
//! delivery failure undo the change that triggered it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SessionRequest,
    SessionUpdate,
    SessionFeedback,
    SessionReminder,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::SessionRequest => "session_request",
            NotificationKind::SessionUpdate => "session_update",
            NotificationKind::SessionFeedback => "session_feedback",
            NotificationKind::SessionReminder => "session_reminder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub related_session_id: Option<Uuid>,
}

impl Notification {
    pub fn about_session(
        recipient_id: Uuid,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        session_id: Uuid,
    ) -> Self {
        Self {
            recipient_id,
            kind,
            title: title.into(),
            message: message.into(),
            related_session_id: Some(session_id),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Sends and logs a failure instead of returning it.
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: Notification) {
    let recipient = notification.recipient_id;
    let kind = notification.kind;
    if let Err(e) = notifier.notify(notification).await {
        warn!(%recipient, kind = kind.as_str(), error = %e, "failed to deliver notification");
    }
}

/// Persists notifications in the `notifications` table.
pub struct PgNotifier {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl PgNotifier {
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, recipient_id, kind, title, message, related_session_id, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification.recipient_id)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.related_session_id)
        .bind(self.clock.now())
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        info!(
            recipient = %notification.recipient_id,
            kind = notification.kind.as_str(),
            session = ?notification.related_session_id,
            "{}: {}",
            notification.title,
            notification.message
        );
        Ok(())
    }
}

/// Keeps every notification in memory so callers can inspect what was sent.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    delivered: RwLock<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn delivered(&self) -> Vec<Notification> {
        self.delivered.read().await.clone()
    }

    pub async fn delivered_to(&self, recipient: Uuid) -> Vec<Notification> {
        self.delivered
            .read()
            .await
            .iter()
            .filter(|n| n.recipient_id == recipient)
            .cloned()
            .collect()
    }

    pub async fn count_of(&self, kind: NotificationKind) -> usize {
        self.delivered
            .read()
            .await
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.delivered.write().await.push(notification);
        Ok(())
    }
}
