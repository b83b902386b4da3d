use tracing::info;
use ulid::Ulid;

use crate::auth::{can, require, Permission};
use crate::limits::*;
use crate::model::*;

use super::conflict::{clean_optional, clean_required, now_ms};
use super::{Engine, EngineError};

impl Engine {
    /// Ask for equipment a lab does not have yet. Requests start PENDING.
    pub async fn request_equipment(
        &self,
        actor: &User,
        name: &str,
        kind: &str,
        reason: Option<String>,
    ) -> Result<EquipmentRequest, EngineError> {
        let _commit = self.commit_gate.read().await;
        require(actor, Permission::EquipmentRequest)?;
        let name = clean_required(name, MAX_NAME_LEN, "equipment name is required", "equipment name too long")?;
        let kind = clean_required(kind, MAX_NAME_LEN, "equipment type is required", "equipment type too long")?;
        let reason = clean_optional(reason, MAX_DESCRIPTION_LEN, "reason too long")?;

        let request = EquipmentRequest {
            id: Ulid::new(),
            name,
            kind,
            reason,
            requested_by: actor.id,
            status: RequestStatus::Pending,
            created_at: now_ms(),
        };
        self.persist(&Event::EquipmentRequested {
            request: request.clone(),
        })
        .await?;
        info!("equipment request {} filed by {}", request.id, actor.id);
        Ok(request)
    }

    /// Newest first. User managers see every request, everyone else their own.
    pub fn equipment_requests(&self, actor: &User) -> Result<Vec<EquipmentRequest>, EngineError> {
        let all = can(actor.role, Permission::UsersManage);
        if !all {
            require(actor, Permission::EquipmentRequest)?;
        }
        let mut requests: Vec<EquipmentRequest> = self
            .equipment_requests
            .iter()
            .filter(|r| all || r.requested_by == actor.id)
            .map(|r| r.value().clone())
            .collect();
        requests.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(requests)
    }
}
