use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{EngineError, ErrorKind};
use crate::model::{DocumentKind, Ms, Priority, Role};

/// One request line: `{"credential": "...", "command": {"op": "...", ...}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub credential: Option<String>,
    pub command: Command,
}

fn default_role() -> Role {
    Role::Student
}

fn default_priority() -> Priority {
    Priority::Medium
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Register {
        email: String,
        name: String,
        #[serde(default = "default_role")]
        role: Role,
        #[serde(default)]
        department: Option<String>,
    },
    Login {
        email: String,
    },
    Me,
    UpdateMe {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        department: Option<String>,
    },
    Users,
    Labs,
    Equipment {
        #[serde(default)]
        lab_id: Option<Ulid>,
    },
    LabSchedule {
        lab_id: Ulid,
        #[serde(default)]
        from: Option<Ms>,
        #[serde(default)]
        to: Option<Ms>,
    },
    LabBookings {
        lab_id: Ulid,
    },
    MyBookings,
    PendingBookings,
    Booking {
        id: Ulid,
    },
    CreateBooking {
        lab_id: Ulid,
        start: Ms,
        end: Ms,
        #[serde(default)]
        purpose: Option<String>,
    },
    ApproveBooking {
        id: Ulid,
    },
    RejectBooking {
        id: Ulid,
    },
    CancelBooking {
        id: Ulid,
    },
    RequestEquipment {
        name: String,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        reason: Option<String>,
    },
    EquipmentRequests,
    MaintenanceTickets,
    MaintenanceTicket {
        id: Ulid,
    },
    ReportIssue {
        equipment_id: Ulid,
        lab_id: Ulid,
        description: String,
        #[serde(default = "default_priority")]
        priority: Priority,
    },
    AssignTicket {
        id: Ulid,
        assignee: Ulid,
    },
    ResolveTicket {
        id: Ulid,
        #[serde(default)]
        note: Option<String>,
    },
    Experiments,
    CreateExperiment {
        lab_id: Ulid,
        title: String,
        #[serde(default)]
        description: Option<String>,
    },
    UploadDocument {
        experiment_id: Ulid,
        kind: DocumentKind,
        title: String,
        #[serde(default)]
        url: Option<String>,
    },
    MyNotifications,
    UnreadCount,
    MarkNotificationRead {
        id: Ulid,
    },
}

impl Command {
    /// Commands that run without a resolved identity.
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Command::Register { .. } | Command::Login { .. })
    }
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { data: serde_json::Value },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

impl From<&EngineError> for Response {
    fn from(e: &EngineError) -> Self {
        Response::error(e.kind(), e.public_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_booking_request() {
        let lab = Ulid::new();
        let line = format!(
            r#"{{"credential":"student@vit.ac.in","command":{{"op":"create_booking","lab_id":"{lab}","start":1000,"end":2000}}}}"#
        );
        let req: Request = serde_json::from_str(&line).unwrap();
        assert_eq!(req.credential.as_deref(), Some("student@vit.ac.in"));
        assert_eq!(
            req.command,
            Command::CreateBooking {
                lab_id: lab,
                start: 1000,
                end: 2000,
                purpose: None
            }
        );
    }

    #[test]
    fn unit_ops_and_defaults() {
        let req: Request = serde_json::from_str(r#"{"command":{"op":"my_notifications"}}"#).unwrap();
        assert_eq!(req.credential, None);
        assert_eq!(req.command, Command::MyNotifications);

        let req: Request = serde_json::from_str(
            r#"{"command":{"op":"register","email":"a@b.c","name":"A"}}"#,
        )
        .unwrap();
        assert!(req.command.is_anonymous());
        match req.command {
            Command::Register { role, department, .. } => {
                assert_eq!(role, Role::Student);
                assert_eq!(department, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn equipment_request_uses_type_key() {
        let req: Request = serde_json::from_str(
            r#"{"command":{"op":"request_equipment","name":"Oscilloscope","type":"Electronics"}}"#,
        )
        .unwrap();
        assert_eq!(
            req.command,
            Command::RequestEquipment {
                name: "Oscilloscope".into(),
                kind: "Electronics".into(),
                reason: None
            }
        );
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"command":{"op":"drop_tables"}}"#).is_err());
    }

    #[test]
    fn response_shapes() {
        let ok = serde_json::to_value(Response::Ok {
            data: serde_json::json!({"count": 2}),
        })
        .unwrap();
        assert_eq!(ok, serde_json::json!({"status": "ok", "data": {"count": 2}}));

        let err = serde_json::to_value(Response::from(&EngineError::Conflict(Ulid::nil()))).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["kind"], "CONFLICT");

        let hidden = Response::from(&EngineError::WalError("disk full at /var/lib".into()));
        assert_eq!(
            hidden,
            Response::error(ErrorKind::Internal, "internal storage error")
        );
    }
}
