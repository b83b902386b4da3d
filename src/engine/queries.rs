use serde::Serialize;
use ulid::Ulid;

use crate::auth::{can, require, Permission};
use crate::model::*;

use super::{Engine, EngineError};

/// An experiment together with its documents, in upload order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentView {
    #[serde(flatten)]
    pub experiment: Experiment,
    pub documents: Vec<Document>,
}

impl Engine {
    pub fn list_users(&self, actor: &User) -> Result<Vec<User>, EngineError> {
        require(actor, Permission::UsersManage)?;
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    pub async fn list_labs(&self, actor: &User) -> Result<Vec<Lab>, EngineError> {
        require(actor, Permission::LabView)?;
        let shared: Vec<_> = self.labs.iter().map(|e| e.value().clone()).collect();
        let mut labs = Vec::with_capacity(shared.len());
        for ls in shared {
            labs.push(ls.read().await.lab.clone());
        }
        labs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(labs)
    }

    pub fn list_equipment(&self, actor: &User, lab_id: Option<Ulid>) -> Result<Vec<Equipment>, EngineError> {
        require(actor, Permission::EquipmentView)?;
        let mut items: Vec<Equipment> = self
            .equipment
            .iter()
            .filter(|e| lab_id.is_none_or(|lab| e.lab_id == lab))
            .map(|e| e.value().clone())
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    /// Slots of one lab, optionally limited to those overlapping `[from, to)`.
    /// A missing bound is open.
    pub async fn lab_schedule(
        &self,
        actor: &User,
        lab_id: Ulid,
        from: Option<Ms>,
        to: Option<Ms>,
    ) -> Result<Vec<Slot>, EngineError> {
        require(actor, Permission::LabView)?;
        let ls = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let from = from.unwrap_or(Ms::MIN);
        let to = to.unwrap_or(Ms::MAX);
        if to <= from {
            return Err(EngineError::Validation("end must be after start"));
        }
        let guard = ls.read().await;
        Ok(guard
            .overlapping_slots(&Span::new(from, to))
            .cloned()
            .collect())
    }

    /// Bookings of a single lab, any status.
    pub async fn lab_bookings(&self, actor: &User, lab_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        require(actor, Permission::BookingApprove)?;
        let ls = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let guard = ls.read().await;
        Ok(guard.bookings.clone())
    }

    /// The caller's bookings, newest request first.
    pub async fn my_bookings(&self, actor: &User) -> Result<Vec<Booking>, EngineError> {
        require(actor, Permission::BookingView)?;
        let mut mine = self
            .collect_bookings(|b| b.user_id == actor.id)
            .await;
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(mine)
    }

    /// Every PENDING booking across labs, oldest request first.
    pub async fn pending_bookings(&self, actor: &User) -> Result<Vec<Booking>, EngineError> {
        require(actor, Permission::BookingApprove)?;
        let mut pending = self
            .collect_bookings(|b| b.status == BookingStatus::Pending)
            .await;
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pending)
    }

    /// Visible to the requester and to anyone who may decide or manage bookings.
    pub async fn get_booking(&self, actor: &User, id: Ulid) -> Result<Booking, EngineError> {
        require(actor, Permission::BookingView)
            .or_else(|_| require(actor, Permission::BookingApprove))?;
        let lab_id = self.get_lab_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let ls = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let booking = ls
            .read()
            .await
            .booking(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let privileged = can(actor.role, Permission::BookingApprove)
            || can(actor.role, Permission::BookingManage);
        if booking.user_id != actor.id && !privileged {
            return Err(EngineError::Forbidden("booking belongs to another user"));
        }
        Ok(booking)
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let shared: Vec<_> = self.labs.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ls in shared {
            let guard = ls.read().await;
            out.extend(guard.bookings.iter().filter(|b| keep(b)).cloned());
        }
        out
    }

    /// All tickets, most recently updated first.
    pub async fn maintenance_tickets(&self, actor: &User) -> Result<Vec<MaintenanceTicket>, EngineError> {
        require(actor, Permission::MaintenanceView)?;
        let shared: Vec<_> = self.tickets.iter().map(|e| e.value().clone()).collect();
        let mut tickets = Vec::with_capacity(shared.len());
        for t in shared {
            tickets.push(t.read().await.clone());
        }
        tickets.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(tickets)
    }

    pub async fn maintenance_ticket(&self, actor: &User, id: Ulid) -> Result<MaintenanceTicket, EngineError> {
        require(actor, Permission::MaintenanceView)?;
        let ticket = self.get_ticket(&id).ok_or(EngineError::NotFound(id))?;
        let snapshot = ticket.read().await.clone();
        Ok(snapshot)
    }

    /// Experiments with their documents, newest first.
    pub async fn list_experiments(&self, actor: &User) -> Result<Vec<ExperimentView>, EngineError> {
        require(actor, Permission::ExperimentUpload)?;
        let shared: Vec<_> = self.experiments.iter().map(|e| e.value().clone()).collect();
        let mut views = Vec::with_capacity(shared.len());
        for es in shared {
            let guard = es.read().await;
            views.push(ExperimentView {
                experiment: guard.experiment.clone(),
                documents: guard.documents.clone(),
            });
        }
        views.sort_by(|a, b| b.experiment.created_at.cmp(&a.experiment.created_at));
        Ok(views)
    }
}
