use tokio::sync::oneshot;

use crate::model::*;

use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Minimal event sequence that rebuilds the current state on replay.
    /// Caller holds the commit gate exclusively.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|u| Event::UserRegistered {
            id: u.id,
            name: u.name,
            email: u.email,
            role: u.role,
            department: u.department,
            created_at: u.created_at,
        }));

        let mut labs: Vec<_> = self.labs.iter().map(|e| (*e.key(), e.value().clone())).collect();
        labs.sort_by_key(|(id, _)| *id);
        let mut lab_scoped = Vec::new();
        for (_, ls) in labs {
            let guard = ls.read().await;
            let lab = &guard.lab;
            events.push(Event::LabCreated {
                id: lab.id,
                name: lab.name.clone(),
                location: lab.location.clone(),
                capacity: lab.capacity,
                status: lab.status,
            });
            lab_scoped.extend(lab_events(&guard));
        }

        let mut equipment: Vec<Equipment> = self.equipment.iter().map(|e| e.value().clone()).collect();
        equipment.sort_by_key(|e| e.id);
        events.extend(equipment.into_iter().map(|e| Event::EquipmentAdded {
            id: e.id,
            lab_id: e.lab_id,
            name: e.name,
            kind: e.kind,
            status: e.status,
            serial_number: e.serial_number,
        }));
        events.extend(lab_scoped);

        let mut requests: Vec<EquipmentRequest> =
            self.equipment_requests.iter().map(|e| e.value().clone()).collect();
        requests.sort_by_key(|r| r.id);
        events.extend(requests.into_iter().map(|request| Event::EquipmentRequested { request }));

        let tickets: Vec<_> = self.tickets.iter().map(|e| e.value().clone()).collect();
        let mut restored = Vec::with_capacity(tickets.len());
        for t in tickets {
            restored.push(t.read().await.clone());
        }
        restored.sort_by_key(|t| t.id);
        events.extend(restored.into_iter().map(|ticket| Event::TicketRestored { ticket }));

        let experiments: Vec<_> = self.experiments.iter().map(|e| e.value().clone()).collect();
        let mut docs = Vec::new();
        let mut created = Vec::new();
        for es in experiments {
            let guard = es.read().await;
            let x = &guard.experiment;
            created.push(Event::ExperimentCreated {
                id: x.id,
                lab_id: x.lab_id,
                created_by: x.created_by,
                title: x.title.clone(),
                description: x.description.clone(),
                created_at: x.created_at,
            });
            docs.extend(guard.documents.iter().cloned().map(|document| Event::DocumentUploaded { document }));
        }
        events.extend(created);
        events.extend(docs);

        // Carries the read flag, so no NotificationRead events are needed.
        events.extend(
            self.notifications
                .all()
                .into_iter()
                .map(|notification| Event::NotificationCreated { notification }),
        );
        events
    }

    /// Rewrite the WAL as a snapshot of the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let events = self.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Slots, then each booking's request plus its decision, then current slot marks.
fn lab_events(ls: &LabState) -> Vec<Event> {
    let lab_id = ls.id();
    let mut events = Vec::new();
    if !ls.slots.is_empty() {
        events.push(Event::SlotsAdded {
            lab_id,
            slots: ls.slots.iter().map(|s| (s.id, s.span)).collect(),
        });
    }
    for b in &ls.bookings {
        events.push(Event::BookingRequested {
            id: b.id,
            lab_id,
            user_id: b.user_id,
            span: b.span,
            purpose: b.purpose.clone(),
            created_at: b.created_at,
        });
        if let (Some(approved_by), Some(approved_at)) = (b.approved_by, b.approved_at) {
            events.push(Event::BookingApproved {
                id: b.id,
                lab_id,
                approved_by,
                approved_at,
            });
        }
        match b.status {
            BookingStatus::Rejected => events.push(Event::BookingRejected { id: b.id, lab_id }),
            BookingStatus::Cancelled => events.push(Event::BookingCancelled { id: b.id, lab_id }),
            _ => {}
        }
    }
    let booked: Vec<_> = ls
        .slots
        .iter()
        .filter(|s| s.status == SlotStatus::Booked)
        .map(|s| s.id)
        .collect();
    if !booked.is_empty() {
        events.push(Event::SlotsMarked {
            lab_id,
            slot_ids: booked,
            status: SlotStatus::Booked,
        });
    }
    events
}
