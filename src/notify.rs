use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Notification, NotificationKind};

/// One message fanned out to several recipients.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub recipients: Vec<Ulid>,
    pub kind: NotificationKind,
    pub message: String,
    pub related_id: Option<Ulid>,
    pub metadata: Option<serde_json::Value>,
}

/// Stored notifications with a per-recipient index. Consumers poll it.
pub struct NotificationBook {
    by_id: DashMap<Ulid, Notification>,
    /// Recipient → notification ids, insertion order.
    inbox: DashMap<Ulid, Vec<Ulid>>,
}

impl Default for NotificationBook {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBook {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            inbox: DashMap::new(),
        }
    }

    pub fn insert(&self, notification: Notification) {
        let user_id = notification.user_id;
        let id = notification.id;
        self.by_id.insert(id, notification);
        self.inbox.entry(user_id).or_default().push(id);
    }

    /// Returns false if the notification does not exist.
    pub fn mark_read(&self, id: &Ulid) -> bool {
        match self.by_id.get_mut(id) {
            Some(mut n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &Ulid) -> Option<Notification> {
        self.by_id.get(id).map(|n| n.value().clone())
    }

    /// Newest first.
    pub fn for_user(&self, user_id: &Ulid) -> Vec<Notification> {
        let Some(ids) = self.inbox.get(user_id).map(|ids| ids.value().clone()) else {
            return Vec::new();
        };
        ids.iter().rev().filter_map(|id| self.get(id)).collect()
    }

    pub fn unread_count(&self, user_id: &Ulid) -> usize {
        let Some(ids) = self.inbox.get(user_id).map(|ids| ids.value().clone()) else {
            return 0;
        };
        ids.iter()
            .filter(|id| self.by_id.get(id).is_some_and(|n| !n.read))
            .count()
    }

    /// Every stored notification, creation order.
    pub fn all(&self) -> Vec<Notification> {
        let mut all: Vec<Notification> = self.by_id.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|n| (n.created_at, n.id));
        all
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(user_id: Ulid, created_at: i64) -> Notification {
        Notification {
            id: Ulid::new(),
            user_id,
            kind: NotificationKind::BookingApproved,
            message: "Your booking request has been approved".into(),
            related_id: None,
            metadata: None,
            read: false,
            created_at,
        }
    }

    #[test]
    fn inbox_is_newest_first_and_per_user() {
        let book = NotificationBook::new();
        let alice = Ulid::new();
        let bob = Ulid::new();
        let first = note(alice, 1);
        let second = note(alice, 2);
        book.insert(first.clone());
        book.insert(note(bob, 3));
        book.insert(second.clone());

        let inbox = book.for_user(&alice);
        assert_eq!(inbox, vec![second, first]);
        assert_eq!(book.unread_count(&bob), 1);
        assert!(book.for_user(&Ulid::new()).is_empty());
    }

    #[test]
    fn mark_read_is_idempotent() {
        let book = NotificationBook::new();
        let user = Ulid::new();
        let n = note(user, 1);
        book.insert(n.clone());
        assert!(book.mark_read(&n.id));
        assert!(book.mark_read(&n.id));
        assert_eq!(book.unread_count(&user), 0);
        assert!(!book.mark_read(&Ulid::new()));
    }
}
