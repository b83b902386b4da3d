use serde_json::json;
use tracing::info;
use ulid::Ulid;

use crate::auth::{require, Permission};
use crate::limits::*;
use crate::model::*;
use crate::notify::Dispatch;

use super::conflict::{clean_optional, clean_required, now_ms};
use super::{Engine, EngineError, SharedTicket};

impl Engine {
    pub(super) fn get_ticket(&self, id: &Ulid) -> Option<SharedTicket> {
        self.tickets.get(id).map(|e| e.value().clone())
    }

    /// Open a ticket against a piece of equipment.
    pub async fn report_issue(
        &self,
        actor: &User,
        equipment_id: Ulid,
        lab_id: Ulid,
        description: &str,
        priority: Priority,
    ) -> Result<MaintenanceTicket, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::MaintenanceReport)?;
        let description = clean_required(
            description,
            MAX_DESCRIPTION_LEN,
            "description is required",
            "description too long",
        )?;
        let equipment = self
            .equipment
            .get(&equipment_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(equipment_id))?;
        if !self.labs.contains_key(&lab_id) {
            return Err(EngineError::NotFound(lab_id));
        }
        if equipment.lab_id != lab_id {
            return Err(EngineError::Validation("equipment does not belong to lab"));
        }

        let id = Ulid::new();
        self.persist(&Event::TicketReported {
            id,
            equipment_id,
            lab_id,
            description,
            reported_by: actor.id,
            priority,
            at: now_ms(),
        })
        .await?;
        let ticket = self.get_ticket(&id).ok_or(EngineError::NotFound(id))?;
        let snapshot = ticket.read().await.clone();
        metrics::counter!(crate::observability::TICKET_TRANSITIONS_TOTAL, "to" => TicketStatus::Open.as_str())
            .increment(1);
        info!("ticket {id} reported on equipment {equipment_id} by {}", actor.id);
        Ok(snapshot)
    }

    /// Assign (or reassign) a ticket. Resolved tickets stay resolved.
    pub async fn assign_ticket(
        &self,
        actor: &User,
        id: Ulid,
        assignee_id: Ulid,
    ) -> Result<MaintenanceTicket, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::MaintenanceAssign)?;
        let ticket = self.get_ticket(&id).ok_or(EngineError::NotFound(id))?;
        let assignee = self
            .get_user(&assignee_id)
            .ok_or(EngineError::NotFound(assignee_id))?;

        let mut guard = ticket.write().await;
        if guard.status == TicketStatus::Resolved {
            return Err(EngineError::InvalidState {
                entity: "ticket",
                id,
                actual: guard.status.as_str(),
                expected: "OPEN or IN_PROGRESS",
            });
        }
        let event = Event::TicketAssigned {
            id,
            assigned_to: assignee.id,
            note: format!("Assigned to {}", assignee.name),
            actor: actor.id,
            at: now_ms(),
        };
        self.persist_ticket(&mut guard, &event).await?;
        let assigned = guard.clone();
        drop(guard);

        metrics::counter!(crate::observability::TICKET_TRANSITIONS_TOTAL, "to" => TicketStatus::InProgress.as_str())
            .increment(1);
        info!("ticket {id} assigned to {assignee_id} by {}", actor.id);

        self.dispatch(Dispatch {
            recipients: vec![assignee.id],
            kind: NotificationKind::Maintenance,
            message: format!("Maintenance ticket assigned to you: {}", assigned.description),
            related_id: Some(id),
            metadata: Some(json!({ "ticketId": id, "assignedBy": actor.id })),
        })
        .await;
        Ok(assigned)
    }

    /// Close a ticket from any state.
    pub async fn resolve_ticket(
        &self,
        actor: &User,
        id: Ulid,
        note: Option<String>,
    ) -> Result<MaintenanceTicket, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::MaintenanceResolve)?;
        let note = clean_optional(note, MAX_NOTE_LEN, "note too long")?
            .unwrap_or_else(|| "Resolved".to_string());
        let ticket = self.get_ticket(&id).ok_or(EngineError::NotFound(id))?;

        let mut guard = ticket.write().await;
        let event = Event::TicketResolved {
            id,
            note,
            actor: actor.id,
            at: now_ms(),
        };
        self.persist_ticket(&mut guard, &event).await?;
        let resolved = guard.clone();
        drop(guard);

        metrics::counter!(crate::observability::TICKET_TRANSITIONS_TOTAL, "to" => TicketStatus::Resolved.as_str())
            .increment(1);
        info!("ticket {id} resolved by {}", actor.id);

        self.dispatch(Dispatch {
            recipients: vec![resolved.reported_by],
            kind: NotificationKind::Maintenance,
            message: format!("Your maintenance ticket has been resolved by {}", actor.name),
            related_id: Some(id),
            metadata: Some(json!({ "ticketId": id, "resolvedBy": actor.id })),
        })
        .await;
        Ok(resolved)
    }
}
