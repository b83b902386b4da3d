mod bookings;
mod compact;
mod conflict;
mod directory;
mod equipment_requests;
mod error;
mod maintenance;
mod notifications;
mod queries;
mod slots;

pub use error::{EngineError, ErrorKind};
pub use queries::ExperimentView;
pub use slots::{SlotChanges, mark_overlapping, reconcile};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotificationBook;
use crate::wal::Wal;

pub type SharedLabState = Arc<RwLock<LabState>>;
pub type SharedTicket = Arc<RwLock<MaintenanceTicket>>;
pub type SharedExperimentState = Arc<RwLock<ExperimentState>>;

/// Test hook: events for which the WAL append is made to fail.
#[cfg(test)]
pub(super) type WriteFault = Box<dyn Fn(&Event) -> bool + Send + Sync>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) struct PendingAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

pub(super) enum WalCommand {
    Append(PendingAppend),
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL. Every append queued while the previous
/// fsync was running joins the next batch, so one fsync commits many events.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut control = match first {
            WalCommand::Append(p) => {
                batch.push(p);
                None
            }
            other => Some(other),
        };
        while control.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append(p)) => batch.push(p),
                Ok(other) => control = Some(other),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            commit_batch(&mut wal, &mut batch);
        }
        if let Some(cmd) = control {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch.iter().try_for_each(|p| wal.append_buffered(&p.event));
    // Flush even after a failed append: the whole batch is reported failed and
    // half-buffered bytes must not be carried into the next one.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for pending in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = pending.response.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append(_) => unreachable!("appends are batched before control commands"),
    }
}

/// The lab resource engine: in-memory state rebuilt from the WAL, with one lock
/// per lab serializing every booking and slot mutation of that lab.
pub struct Engine {
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) users: DashMap<Ulid, User>,
    /// Lower-cased email → user id.
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) labs: DashMap<Ulid, SharedLabState>,
    pub(super) equipment: DashMap<Ulid, Equipment>,
    pub(super) equipment_requests: DashMap<Ulid, EquipmentRequest>,
    /// Reverse lookup: booking id → lab id
    pub(super) booking_to_lab: DashMap<Ulid, Ulid>,
    pub(super) tickets: DashMap<Ulid, SharedTicket>,
    pub(super) experiments: DashMap<Ulid, SharedExperimentState>,
    pub notifications: NotificationBook,
    /// Mutations hold this shared for their whole duration; compaction takes it
    /// exclusively so its snapshot sees no half-applied operation. Always
    /// acquired before any lab, ticket or experiment lock.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes user record writes: the email uniqueness check in
    /// `register` and the read-modify-write in `update_me`.
    pub(super) user_writes: Mutex<()>,
    /// Notifications skipped because their write failed.
    pub(super) notifications_dropped: AtomicU64,
    #[cfg(test)]
    pub(super) write_fault: std::sync::Mutex<Option<WriteFault>>,
}

/// Apply a lab-scoped event. Caller holds the lab lock.
fn apply_to_lab(ls: &mut LabState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::SlotsAdded { lab_id, slots } => {
            for (id, span) in slots {
                ls.insert_slot(Slot {
                    id: *id,
                    lab_id: *lab_id,
                    span: *span,
                    status: SlotStatus::Available,
                });
            }
        }
        Event::SlotsMarked { slot_ids, status, .. } => {
            for id in slot_ids {
                if let Some(slot) = ls.slot_mut(id) {
                    slot.status = *status;
                }
            }
        }
        Event::BookingRequested {
            id,
            lab_id,
            user_id,
            span,
            purpose,
            created_at,
        } => {
            ls.insert_booking(Booking {
                id: *id,
                lab_id: *lab_id,
                user_id: *user_id,
                span: *span,
                purpose: purpose.clone(),
                status: BookingStatus::Pending,
                approved_by: None,
                approved_at: None,
                created_at: *created_at,
            });
            booking_index.insert(*id, *lab_id);
        }
        Event::BookingApproved {
            id,
            approved_by,
            approved_at,
            ..
        } => {
            if let Some(b) = ls.booking_mut(id) {
                b.status = BookingStatus::Confirmed;
                b.approved_by = Some(*approved_by);
                b.approved_at = Some(*approved_at);
            }
        }
        Event::BookingRejected { id, .. } => {
            if let Some(b) = ls.booking_mut(id) {
                b.status = BookingStatus::Rejected;
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = ls.booking_mut(id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        _ => {}
    }
}

/// Apply a ticket transition (caller holds the ticket lock).
fn apply_to_ticket(ticket: &mut MaintenanceTicket, event: &Event) {
    match event {
        Event::TicketAssigned {
            assigned_to,
            note,
            actor,
            at,
            ..
        } => {
            ticket.assigned_to = Some(*assigned_to);
            ticket.status = TicketStatus::InProgress;
            ticket.updated_at = *at;
            ticket.history.push(HistoryEntry {
                at: *at,
                note: note.clone(),
                actor: Some(*actor),
            });
        }
        Event::TicketResolved { note, actor, at, .. } => {
            ticket.status = TicketStatus::Resolved;
            ticket.updated_at = *at;
            ticket.history.push(HistoryEntry {
                at: *at,
                note: note.clone(),
                actor: Some(*actor),
            });
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            wal_tx,
            users: DashMap::new(),
            emails: DashMap::new(),
            labs: DashMap::new(),
            equipment: DashMap::new(),
            equipment_requests: DashMap::new(),
            booking_to_lab: DashMap::new(),
            tickets: DashMap::new(),
            experiments: DashMap::new(),
            notifications: NotificationBook::new(),
            commit_gate: RwLock::new(()),
            user_writes: Mutex::new(()),
            notifications_dropped: AtomicU64::new(0),
            #[cfg(test)]
            write_fault: std::sync::Mutex::new(None),
        };

        // We're the sole owner of every Arc during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            engine.apply_replayed(event);
        }
        let mut repaired = 0usize;
        for entry in engine.labs.iter() {
            let mut guard = entry.value().try_write().expect("replay: uncontended write");
            repaired += slots::resync_grid(&mut guard);
        }
        if repaired > 0 {
            tracing::warn!("slot grid drift repaired after replay: {repaired} slots");
        }
        tracing::info!(
            "replayed {} events: {} users, {} labs, {} bookings",
            events.len(),
            engine.users.len(),
            engine.labs.len(),
            engine.booking_to_lab.len()
        );
        Ok(engine)
    }

    fn apply_replayed(&self, event: &Event) {
        if let Some(lab_id) = event.lab_id() {
            if let Some(entry) = self.labs.get(&lab_id) {
                let ls = entry.value().clone();
                let mut guard = ls.try_write().expect("replay: uncontended write");
                apply_to_lab(&mut guard, event, &self.booking_to_lab);
            }
            return;
        }
        match event {
            Event::TicketAssigned { id, .. } | Event::TicketResolved { id, .. } => {
                if let Some(entry) = self.tickets.get(id) {
                    let ticket = entry.value().clone();
                    let mut guard = ticket.try_write().expect("replay: uncontended write");
                    apply_to_ticket(&mut guard, event);
                }
            }
            Event::DocumentUploaded { document } => {
                if let Some(entry) = self.experiments.get(&document.experiment_id) {
                    let es = entry.value().clone();
                    let mut guard = es.try_write().expect("replay: uncontended write");
                    guard.documents.push(document.clone());
                }
            }
            other => self.apply_global(other),
        }
    }

    /// Apply an event that creates or updates an unlocked top-level record.
    fn apply_global(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                name,
                email,
                role,
                department,
                created_at,
            } => {
                self.emails.insert(email.clone(), *id);
                self.users.insert(
                    *id,
                    User {
                        id: *id,
                        name: name.clone(),
                        email: email.clone(),
                        role: *role,
                        department: department.clone(),
                        created_at: *created_at,
                    },
                );
            }
            Event::UserUpdated {
                id,
                name,
                department,
            } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    user.name = name.clone();
                    user.department = department.clone();
                }
            }
            Event::LabCreated {
                id,
                name,
                location,
                capacity,
                status,
            } => {
                let lab = Lab {
                    id: *id,
                    name: name.clone(),
                    location: location.clone(),
                    capacity: *capacity,
                    status: *status,
                };
                self.labs.insert(*id, Arc::new(RwLock::new(LabState::new(lab))));
            }
            Event::EquipmentAdded {
                id,
                lab_id,
                name,
                kind,
                status,
                serial_number,
            } => {
                self.equipment.insert(
                    *id,
                    Equipment {
                        id: *id,
                        lab_id: *lab_id,
                        name: name.clone(),
                        kind: kind.clone(),
                        status: *status,
                        serial_number: serial_number.clone(),
                    },
                );
            }
            Event::EquipmentRequested { request } => {
                self.equipment_requests.insert(request.id, request.clone());
            }
            Event::TicketReported {
                id,
                equipment_id,
                lab_id,
                description,
                reported_by,
                priority,
                at,
            } => {
                let ticket = MaintenanceTicket {
                    id: *id,
                    equipment_id: *equipment_id,
                    lab_id: *lab_id,
                    description: description.clone(),
                    reported_by: *reported_by,
                    assigned_to: None,
                    status: TicketStatus::Open,
                    priority: *priority,
                    created_at: *at,
                    updated_at: *at,
                    history: vec![HistoryEntry {
                        at: *at,
                        note: "Ticket created".to_string(),
                        actor: Some(*reported_by),
                    }],
                };
                self.tickets.insert(*id, Arc::new(RwLock::new(ticket)));
            }
            Event::TicketRestored { ticket } => {
                self.tickets
                    .insert(ticket.id, Arc::new(RwLock::new(ticket.clone())));
            }
            Event::ExperimentCreated {
                id,
                lab_id,
                created_by,
                title,
                description,
                created_at,
            } => {
                let es = ExperimentState {
                    experiment: Experiment {
                        id: *id,
                        lab_id: *lab_id,
                        created_by: *created_by,
                        title: title.clone(),
                        description: description.clone(),
                        created_at: *created_at,
                    },
                    documents: Vec::new(),
                };
                self.experiments.insert(*id, Arc::new(RwLock::new(es)));
            }
            Event::NotificationCreated { notification } => {
                self.notifications.insert(notification.clone());
            }
            Event::NotificationRead { id } => {
                self.notifications.mark_read(id);
            }
            // Lab-, ticket- and experiment-scoped events are applied under their own locks.
            _ => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        #[cfg(test)]
        if self.write_fails(event) {
            return Err(EngineError::WalError("injected write failure".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append(PendingAppend {
                event: event.clone(),
                response: tx,
            }))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply a top-level event.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_global(event);
        Ok(())
    }

    /// WAL-append then apply a lab-scoped event. Caller holds the lab write lock.
    pub(super) async fn persist_lab(&self, ls: &mut LabState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_lab(ls, event, &self.booking_to_lab);
        Ok(())
    }

    /// WAL-append then apply a ticket transition. Caller holds the ticket write lock.
    pub(super) async fn persist_ticket(
        &self,
        ticket: &mut MaintenanceTicket,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ticket(ticket, event);
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn fail_writes_where(&self, fault: impl Fn(&Event) -> bool + Send + Sync + 'static) {
        if let Ok(mut slot) = self.write_fault.lock() {
            *slot = Some(Box::new(fault));
        }
    }

    #[cfg(test)]
    pub(super) fn clear_write_faults(&self) {
        if let Ok(mut slot) = self.write_fault.lock() {
            *slot = None;
        }
    }

    #[cfg(test)]
    fn write_fails(&self, event: &Event) -> bool {
        self.write_fault
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|fault| fault(event)))
            .unwrap_or(false)
    }

    /// Notifications dropped since startup because their write failed.
    pub fn notifications_dropped(&self) -> u64 {
        self.notifications_dropped.load(Ordering::Relaxed)
    }

    pub fn get_lab(&self, id: &Ulid) -> Option<SharedLabState> {
        self.labs.get(id).map(|e| e.value().clone())
    }

    pub fn get_lab_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_lab.get(booking_id).map(|e| *e.value())
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    /// Lookup booking → lab, acquire the lab write lock.
    pub(super) async fn lock_lab_for_booking(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<LabState>), EngineError> {
        let lab_id = self
            .get_lab_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ls = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        Ok((lab_id, ls.write_owned().await))
    }
}
