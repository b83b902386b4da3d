use serde_json::json;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::{can, require, Permission};
use crate::limits::*;
use crate::model::*;
use crate::notify::Dispatch;

use super::conflict::{check_no_conflict, clean_optional, now_ms, validate_booking_window, ConflictScope};
use super::slots::reconcile_in_memory;
use super::{Engine, EngineError};

fn expect_pending(booking: &Booking) -> Result<(), EngineError> {
    if booking.status == BookingStatus::Pending {
        Ok(())
    } else {
        Err(EngineError::InvalidState {
            entity: "booking",
            id: booking.id,
            actual: booking.status.as_str(),
            expected: BookingStatus::Pending.as_str(),
        })
    }
}

fn count_transition(to: BookingStatus) {
    metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
}

impl Engine {
    /// Request a lab window. The request claims the window immediately:
    /// any PENDING or CONFIRMED overlap fails the request with `Conflict`.
    pub async fn create_booking(
        &self,
        actor: &User,
        lab_id: Ulid,
        start: Ms,
        end: Ms,
        purpose: Option<String>,
    ) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::BookingCreate)?;
        let span = validate_booking_window(start, end)?;
        let purpose = clean_optional(purpose, MAX_PURPOSE_LEN, "purpose too long")?;
        let ls = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;

        let mut guard = ls.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_LAB {
            return Err(EngineError::LimitExceeded("too many bookings on lab"));
        }
        check_no_conflict(&guard, &span, ConflictScope::Claimed, None)?;

        let id = Ulid::new();
        let event = Event::BookingRequested {
            id,
            lab_id,
            user_id: actor.id,
            span,
            purpose,
            created_at: now_ms(),
        };
        self.persist_lab(&mut guard, &event).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        let lab_name = guard.lab.name.clone();
        drop(guard);

        count_transition(BookingStatus::Pending);
        info!("booking {id} requested by {} on lab {lab_id}", actor.id);

        self.dispatch(Dispatch {
            recipients: self.users_with(Permission::BookingApprove),
            kind: NotificationKind::BookingRequest,
            message: format!("{} requested to book {lab_name}", actor.name),
            related_id: Some(id),
            metadata: Some(json!({
                "bookingId": id,
                "labId": lab_id,
                "userId": actor.id,
                "start": span.start,
                "end": span.end,
            })),
        })
        .await;
        Ok(booking)
    }

    /// PENDING → CONFIRMED, then mark the overlapping slots BOOKED.
    pub async fn approve_booking(&self, actor: &User, id: Ulid) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::BookingApprove)?;
        let (lab_id, mut guard) = self.lock_lab_for_booking(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        expect_pending(&booking)?;
        check_no_conflict(&guard, &booking.span, ConflictScope::Confirmed, Some(id))?;

        let event = Event::BookingApproved {
            id,
            lab_id,
            approved_by: actor.id,
            approved_at: now_ms(),
        };
        self.persist_lab(&mut guard, &event).await?;

        // The approval is already durable. Without a durable slot record the
        // grid is still corrected in memory; replay derives it again.
        if let Err(e) = self
            .mark_slots_locked(&mut guard, &booking.span, SlotStatus::Booked)
            .await
        {
            let fixed = reconcile_in_memory(&mut guard, &booking.span);
            warn!("booking {id} approved but slot marks not persisted ({fixed} set in memory): {e}");
        }
        let approved = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        count_transition(BookingStatus::Confirmed);
        info!("booking {id} approved by {}", actor.id);

        self.dispatch(Dispatch {
            recipients: vec![approved.user_id],
            kind: NotificationKind::BookingApproved,
            message: format!("Your booking request has been approved by {}", actor.name),
            related_id: Some(id),
            metadata: Some(json!({ "bookingId": id, "approvedBy": actor.id })),
        })
        .await;
        Ok(approved)
    }

    /// PENDING → REJECTED. The slot grid is not touched: a pending request never booked it.
    pub async fn reject_booking(&self, actor: &User, id: Ulid) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::BookingApprove)?;
        let (lab_id, mut guard) = self.lock_lab_for_booking(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        expect_pending(&booking)?;

        self.persist_lab(&mut guard, &Event::BookingRejected { id, lab_id })
            .await?;
        let rejected = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        count_transition(BookingStatus::Rejected);
        info!("booking {id} rejected by {}", actor.id);

        self.dispatch(Dispatch {
            recipients: vec![rejected.user_id],
            kind: NotificationKind::BookingRejected,
            message: format!("Your booking request has been rejected by {}", actor.name),
            related_id: Some(id),
            metadata: Some(json!({ "bookingId": id, "rejectedBy": actor.id })),
        })
        .await;
        Ok(rejected)
    }

    /// Cancel a PENDING or CONFIRMED booking. Allowed for the requester and for
    /// holders of `booking:manage`. Cancelling a finished booking changes nothing.
    pub async fn cancel_booking(&self, actor: &User, id: Ulid) -> Result<Booking, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (lab_id, mut guard) = self.lock_lab_for_booking(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.user_id != actor.id && !can(actor.role, Permission::BookingManage) {
            return Err(EngineError::Forbidden(
                "only the requester or a booking manager may cancel",
            ));
        }
        if booking.status.is_terminal() {
            debug!("cancel of {} booking {id} ignored", booking.status);
            return Ok(booking);
        }

        self.persist_lab(&mut guard, &Event::BookingCancelled { id, lab_id })
            .await?;
        if booking.status == BookingStatus::Confirmed
            && let Err(e) = self.reconcile_slots_locked(&mut guard, &booking.span).await
        {
            let fixed = reconcile_in_memory(&mut guard, &booking.span);
            warn!("booking {id} cancelled but slot marks not persisted ({fixed} set in memory): {e}");
        }
        let cancelled = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        drop(guard);

        count_transition(BookingStatus::Cancelled);
        info!("booking {id} cancelled by {}", actor.id);
        Ok(cancelled)
    }
}
