use std::sync::atomic::Ordering;

use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::Dispatch;

use super::conflict::now_ms;
use super::{Engine, EngineError};

impl Engine {
    /// Fan a message out to every recipient. Best-effort: a failed write for
    /// one recipient is logged and skipped, never reported to the caller.
    /// Returns how many notifications were stored.
    pub async fn notify(&self, dispatch: Dispatch) -> usize {
        let _commit = self.commit_gate.read().await;
        self.dispatch(dispatch).await
    }

    /// `notify` for callers already holding the commit gate.
    pub(super) async fn dispatch(&self, dispatch: Dispatch) -> usize {
        let metadata = dispatch.metadata.as_ref().map(|m| m.to_string());
        let mut delivered = 0;
        for user_id in &dispatch.recipients {
            let notification = Notification {
                id: Ulid::new(),
                user_id: *user_id,
                kind: dispatch.kind,
                message: dispatch.message.clone(),
                related_id: dispatch.related_id,
                metadata: metadata.clone(),
                read: false,
                created_at: now_ms(),
            };
            match self.persist(&Event::NotificationCreated { notification }).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                    warn!(
                        "notification {} for user {user_id} dropped: {e}",
                        dispatch.kind.as_str()
                    );
                }
            }
        }
        metrics::counter!(crate::observability::NOTIFICATIONS_TOTAL, "kind" => dispatch.kind.as_str())
            .increment(delivered as u64);
        delivered
    }

    /// Mark one of the caller's notifications read. Repeating it is a no-op.
    pub async fn mark_notification_read(&self, actor: &User, id: Ulid) -> Result<Notification, EngineError> {
        let _commit = self.commit_gate.read().await;
        let notification = self
            .notifications
            .get(&id)
            .ok_or(EngineError::NotFound(id))?;
        if notification.user_id != actor.id {
            return Err(EngineError::Forbidden("notification belongs to another user"));
        }
        if notification.read {
            return Ok(notification);
        }
        self.persist(&Event::NotificationRead { id }).await?;
        self.notifications.get(&id).ok_or(EngineError::NotFound(id))
    }

    pub fn my_notifications(&self, actor: &User) -> Vec<Notification> {
        self.notifications.for_user(&actor.id)
    }

    pub fn unread_count(&self, actor: &User) -> usize {
        self.notifications.unread_count(&actor.id)
    }

    /// Users whose role holds `permission`, in registration order.
    pub(super) fn users_with(&self, permission: crate::auth::Permission) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .users
            .iter()
            .filter(|u| crate::auth::can(u.role, permission))
            .map(|u| u.id)
            .collect();
        ids.sort();
        ids
    }
}
