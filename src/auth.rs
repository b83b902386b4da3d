use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Role, User};

/// Capabilities a role may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "lab:view")]
    LabView,
    #[serde(rename = "lab:book")]
    LabBook,
    #[serde(rename = "equipment:view")]
    EquipmentView,
    #[serde(rename = "equipment:request")]
    EquipmentRequest,
    #[serde(rename = "booking:view")]
    BookingView,
    #[serde(rename = "booking:create")]
    BookingCreate,
    #[serde(rename = "booking:manage")]
    BookingManage,
    #[serde(rename = "booking:approve")]
    BookingApprove,
    #[serde(rename = "maintenance:view")]
    MaintenanceView,
    #[serde(rename = "maintenance:report")]
    MaintenanceReport,
    #[serde(rename = "maintenance:assign")]
    MaintenanceAssign,
    #[serde(rename = "maintenance:resolve")]
    MaintenanceResolve,
    #[serde(rename = "experiment:upload")]
    ExperimentUpload,
    #[serde(rename = "analytics:view")]
    AnalyticsView,
    #[serde(rename = "users:manage")]
    UsersManage,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::LabView => "lab:view",
            Permission::LabBook => "lab:book",
            Permission::EquipmentView => "equipment:view",
            Permission::EquipmentRequest => "equipment:request",
            Permission::BookingView => "booking:view",
            Permission::BookingCreate => "booking:create",
            Permission::BookingManage => "booking:manage",
            Permission::BookingApprove => "booking:approve",
            Permission::MaintenanceView => "maintenance:view",
            Permission::MaintenanceReport => "maintenance:report",
            Permission::MaintenanceAssign => "maintenance:assign",
            Permission::MaintenanceResolve => "maintenance:resolve",
            Permission::ExperimentUpload => "experiment:upload",
            Permission::AnalyticsView => "analytics:view",
            Permission::UsersManage => "users:manage",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

use Permission::*;

/// Role → permission table. Every role must appear exactly once.
static ROLE_PERMISSIONS: &[(Role, &[Permission])] = &[
    (
        Role::Admin,
        &[
            LabView,
            EquipmentView,
            EquipmentRequest,
            BookingView,
            BookingManage,
            BookingApprove,
            MaintenanceView,
            MaintenanceAssign,
            MaintenanceResolve,
            ExperimentUpload,
            AnalyticsView,
            UsersManage,
        ],
    ),
    (
        Role::Faculty,
        &[
            LabView,
            LabBook,
            EquipmentView,
            EquipmentRequest,
            BookingView,
            BookingCreate,
            BookingApprove,
            MaintenanceView,
            MaintenanceReport,
            ExperimentUpload,
            AnalyticsView,
        ],
    ),
    (
        Role::Student,
        &[
            LabView,
            LabBook,
            EquipmentView,
            BookingView,
            BookingCreate,
            MaintenanceReport,
            ExperimentUpload,
        ],
    ),
    (
        Role::Technician,
        &[
            LabView,
            EquipmentView,
            MaintenanceView,
            MaintenanceAssign,
            MaintenanceResolve,
            BookingApprove,
        ],
    ),
];

pub fn permissions_for(role: Role) -> &'static [Permission] {
    ROLE_PERMISSIONS
        .iter()
        .find(|(r, _)| *r == role)
        .map_or(&[], |(_, perms)| *perms)
}

pub fn can(role: Role, permission: Permission) -> bool {
    permissions_for(role).contains(&permission)
}

/// Roles holding a permission, in table order.
pub fn roles_with(permission: Permission) -> impl Iterator<Item = Role> {
    ROLE_PERMISSIONS
        .iter()
        .filter(move |(_, perms)| perms.contains(&permission))
        .map(|(role, _)| *role)
}

/// Check the static table at startup: every role defined once, no duplicate grants.
pub fn validate_table() -> Result<(), String> {
    for role in Role::ALL {
        let entries = ROLE_PERMISSIONS.iter().filter(|(r, _)| *r == role).count();
        if entries != 1 {
            return Err(format!("role {role} has {entries} permission entries, expected 1"));
        }
    }
    for (role, perms) in ROLE_PERMISSIONS {
        for (i, p) in perms.iter().enumerate() {
            if perms[..i].contains(p) {
                return Err(format!("role {role} grants {p} twice"));
            }
        }
    }
    Ok(())
}

/// Fail with `PermissionDenied` unless the user's role holds `permission`.
pub fn require(user: &User, permission: Permission) -> Result<(), EngineError> {
    if can(user.role, permission) {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(permission))
    }
}

/// An opaque caller credential: a user id or an email address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Id(Ulid),
    Email(String),
}

impl Credential {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let raw = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
        if raw.is_empty() {
            return None;
        }
        if let Ok(id) = Ulid::from_string(raw) {
            return Some(Credential::Id(id));
        }
        if raw.contains('@') {
            return Some(Credential::Email(raw.to_lowercase()));
        }
        None
    }
}

/// Resolves the acting identity. Called once per request; results are never cached.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<User, EngineError>;
}
