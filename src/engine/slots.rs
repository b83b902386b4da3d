use std::collections::HashSet;

use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::checked_span;
use super::{Engine, EngineError};

/// Slot ids that change when a status is forced onto every slot overlapping `window`.
pub fn mark_overlapping(ls: &LabState, window: &Span, status: SlotStatus) -> Vec<Ulid> {
    ls.overlapping_slots(window)
        .filter(|s| s.status != status)
        .map(|s| s.id)
        .collect()
}

/// Changes produced by re-deriving slot statuses from confirmed bookings.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SlotChanges {
    pub booked: Vec<Ulid>,
    pub available: Vec<Ulid>,
}

impl SlotChanges {
    pub fn is_empty(&self) -> bool {
        self.booked.is_empty() && self.available.is_empty()
    }

    pub fn len(&self) -> usize {
        self.booked.len() + self.available.len()
    }
}

fn covered_by_confirmed(ls: &LabState, span: &Span) -> bool {
    ls.overlapping_bookings(span)
        .any(|b| b.status == BookingStatus::Confirmed)
}

/// For every slot overlapping `window`: BOOKED iff some CONFIRMED booking
/// overlaps the slot, AVAILABLE otherwise. Only slots whose status differs are returned.
pub fn reconcile(ls: &LabState, window: &Span) -> SlotChanges {
    let mut changes = SlotChanges::default();
    for slot in ls.overlapping_slots(window) {
        let want = if covered_by_confirmed(ls, &slot.span) {
            SlotStatus::Booked
        } else {
            SlotStatus::Available
        };
        if want != slot.status {
            match want {
                SlotStatus::Booked => changes.booked.push(slot.id),
                SlotStatus::Available => changes.available.push(slot.id),
            }
        }
    }
    changes
}

/// Re-derive the whole grid in memory. Returns the number of slots corrected.
pub(super) fn resync_grid(ls: &mut LabState) -> usize {
    let Some(first) = ls.slots.first().map(|s| s.span.start) else {
        return 0;
    };
    let last = ls.slots.iter().map(|s| s.span.end).max().unwrap_or(first + 1);
    reconcile_in_memory(ls, &Span::new(first, last))
}

/// `reconcile` applied to memory only, without a WAL record. Replay re-derives
/// the same statuses, so the grid stays consistent across a restart.
pub(super) fn reconcile_in_memory(ls: &mut LabState, window: &Span) -> usize {
    let changes = reconcile(ls, window);
    for id in &changes.booked {
        if let Some(slot) = ls.slot_mut(id) {
            slot.status = SlotStatus::Booked;
        }
    }
    for id in &changes.available {
        if let Some(slot) = ls.slot_mut(id) {
            slot.status = SlotStatus::Available;
        }
    }
    changes.len()
}

impl Engine {
    /// Force `status` onto every slot overlapping `window`. Caller holds the lab lock.
    pub(super) async fn mark_slots_locked(
        &self,
        ls: &mut LabState,
        window: &Span,
        status: SlotStatus,
    ) -> Result<usize, EngineError> {
        let slot_ids = mark_overlapping(ls, window, status);
        if slot_ids.is_empty() {
            return Ok(0);
        }
        let count = slot_ids.len();
        let event = Event::SlotsMarked {
            lab_id: ls.id(),
            slot_ids,
            status,
        };
        self.persist_lab(ls, &event).await?;
        Ok(count)
    }

    /// Re-derive slot statuses inside `window`. Caller holds the lab lock.
    pub(super) async fn reconcile_slots_locked(
        &self,
        ls: &mut LabState,
        window: &Span,
    ) -> Result<usize, EngineError> {
        let SlotChanges { booked, available } = reconcile(ls, window);
        let count = booked.len() + available.len();
        for (slot_ids, status) in [(booked, SlotStatus::Booked), (available, SlotStatus::Available)] {
            if slot_ids.is_empty() {
                continue;
            }
            let event = Event::SlotsMarked {
                lab_id: ls.id(),
                slot_ids,
                status,
            };
            self.persist_lab(ls, &event).await?;
        }
        if count > 0 {
            debug!("reconciled {count} slots of lab {}", ls.id());
        }
        Ok(count)
    }

    /// Reconcile the slot grid of one lab over `[start, end)`.
    pub async fn reconcile_slots(&self, lab_id: Ulid, start: Ms, end: Ms) -> Result<usize, EngineError> {
        let _commit = self.commit_gate.read().await;
        let window = checked_span(start, end)?;
        let ls = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let mut guard = ls.write().await;
        self.reconcile_slots_locked(&mut guard, &window).await
    }

    /// Add schedule slots to a lab. New slots start AVAILABLE and are then
    /// reconciled against already confirmed bookings.
    pub async fn add_slots(&self, lab_id: Ulid, windows: &[(Ms, Ms)]) -> Result<Vec<Slot>, EngineError> {
        let _commit = self.commit_gate.read().await;
        if windows.is_empty() {
            return Ok(Vec::new());
        }
        if windows.len() > MAX_SLOTS_PER_BATCH {
            return Err(EngineError::LimitExceeded("too many slots in one batch"));
        }
        let spans = windows
            .iter()
            .map(|&(start, end)| checked_span(start, end))
            .collect::<Result<Vec<_>, _>>()?;

        let ls = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let mut guard = ls.write().await;
        if guard.slots.len() + spans.len() > MAX_SLOTS_PER_LAB {
            return Err(EngineError::LimitExceeded("too many slots on lab"));
        }

        let slots: Vec<(Ulid, Span)> = spans.iter().map(|s| (Ulid::new(), *s)).collect();
        let covering = spans.iter().skip(1).fold(spans[0], |acc, s| acc.union(s));
        let ids: HashSet<Ulid> = slots.iter().map(|(id, _)| *id).collect();
        self.persist_lab(&mut guard, &Event::SlotsAdded { lab_id, slots })
            .await?;
        self.reconcile_slots_locked(&mut guard, &covering).await?;

        Ok(guard
            .slots
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab() -> LabState {
        LabState::new(Lab {
            id: Ulid::new(),
            name: "Automation Lab".into(),
            location: "SMEC Block, Floor 2".into(),
            capacity: 24,
            status: LabStatus::Open,
        })
    }

    fn add_slot(ls: &mut LabState, start: Ms, end: Ms, status: SlotStatus) -> Ulid {
        let id = Ulid::new();
        let lab_id = ls.id();
        ls.insert_slot(Slot {
            id,
            lab_id,
            span: Span::new(start, end),
            status,
        });
        id
    }

    fn add_booking(ls: &mut LabState, start: Ms, end: Ms, status: BookingStatus) {
        let lab_id = ls.id();
        ls.insert_booking(Booking {
            id: Ulid::new(),
            lab_id,
            user_id: Ulid::new(),
            span: Span::new(start, end),
            purpose: None,
            status,
            approved_by: None,
            approved_at: None,
            created_at: 0,
        });
    }

    #[test]
    fn mark_touches_only_overlapping_slots_needing_change() {
        let mut ls = lab();
        let a = add_slot(&mut ls, 0, 100, SlotStatus::Available);
        let _b = add_slot(&mut ls, 100, 200, SlotStatus::Booked);
        let _c = add_slot(&mut ls, 200, 300, SlotStatus::Available);
        let changed = mark_overlapping(&ls, &Span::new(50, 200), SlotStatus::Booked);
        assert_eq!(changed, vec![a]);
    }

    #[test]
    fn mark_with_no_slots_is_empty() {
        let ls = lab();
        assert!(mark_overlapping(&ls, &Span::new(0, 100), SlotStatus::Booked).is_empty());
    }

    #[test]
    fn reconcile_frees_slot_without_confirmed_cover() {
        let mut ls = lab();
        let slot = add_slot(&mut ls, 0, 100, SlotStatus::Booked);
        add_booking(&mut ls, 0, 100, BookingStatus::Cancelled);
        add_booking(&mut ls, 0, 100, BookingStatus::Pending);
        let changes = reconcile(&ls, &Span::new(0, 100));
        assert_eq!(changes.available, vec![slot]);
        assert!(changes.booked.is_empty());
    }

    #[test]
    fn reconcile_keeps_slot_booked_under_other_confirmed() {
        let mut ls = lab();
        add_slot(&mut ls, 0, 100, SlotStatus::Booked);
        add_booking(&mut ls, 0, 50, BookingStatus::Cancelled);
        add_booking(&mut ls, 50, 100, BookingStatus::Confirmed);
        assert!(reconcile(&ls, &Span::new(0, 50)).is_empty());
    }

    #[test]
    fn reconcile_books_drifted_slot() {
        let mut ls = lab();
        let slot = add_slot(&mut ls, 0, 100, SlotStatus::Available);
        add_booking(&mut ls, 90, 120, BookingStatus::Confirmed);
        assert_eq!(reconcile(&ls, &Span::new(0, 100)).booked, vec![slot]);
    }

    #[test]
    fn resync_repairs_whole_grid() {
        let mut ls = lab();
        add_slot(&mut ls, 0, 100, SlotStatus::Booked);
        add_slot(&mut ls, 100, 200, SlotStatus::Available);
        add_booking(&mut ls, 150, 160, BookingStatus::Confirmed);
        assert_eq!(resync_grid(&mut ls), 2);
        let statuses: Vec<SlotStatus> = ls.slots.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![SlotStatus::Available, SlotStatus::Booked]);
        assert_eq!(resync_grid(&mut ls), 0);
    }
}
