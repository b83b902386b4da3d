use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::auth::IdentityResolver;
use crate::command::{Command, Request, Response};
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::limits::MAX_LINE_LEN;
use crate::model::User;
use crate::observability::{self, command_label};

fn data<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::WalError(format!("encode response: {e}")))
}

/// Run one command for an already resolved actor.
async fn execute_command(engine: &Engine, actor: &User, cmd: Command) -> Result<Value, EngineError> {
    match cmd {
        Command::Register { .. } | Command::Login { .. } => {
            Err(EngineError::Validation("register and login run without an identity"))
        }
        Command::Me => data(actor),
        Command::UpdateMe { name, department } => data(engine.update_me(actor, name, department).await?),
        Command::Users => data(engine.list_users(actor)?),
        Command::Labs => data(engine.list_labs(actor).await?),
        Command::Equipment { lab_id } => data(engine.list_equipment(actor, lab_id)?),
        Command::LabSchedule { lab_id, from, to } => {
            data(engine.lab_schedule(actor, lab_id, from, to).await?)
        }
        Command::LabBookings { lab_id } => data(engine.lab_bookings(actor, lab_id).await?),
        Command::MyBookings => data(engine.my_bookings(actor).await?),
        Command::PendingBookings => data(engine.pending_bookings(actor).await?),
        Command::Booking { id } => data(engine.get_booking(actor, id).await?),
        Command::CreateBooking {
            lab_id,
            start,
            end,
            purpose,
        } => data(engine.create_booking(actor, lab_id, start, end, purpose).await?),
        Command::ApproveBooking { id } => data(engine.approve_booking(actor, id).await?),
        Command::RejectBooking { id } => data(engine.reject_booking(actor, id).await?),
        Command::CancelBooking { id } => data(engine.cancel_booking(actor, id).await?),
        Command::RequestEquipment { name, kind, reason } => {
            data(engine.request_equipment(actor, &name, &kind, reason).await?)
        }
        Command::EquipmentRequests => data(engine.equipment_requests(actor)?),
        Command::MaintenanceTickets => data(engine.maintenance_tickets(actor).await?),
        Command::MaintenanceTicket { id } => data(engine.maintenance_ticket(actor, id).await?),
        Command::ReportIssue {
            equipment_id,
            lab_id,
            description,
            priority,
        } => data(
            engine
                .report_issue(actor, equipment_id, lab_id, &description, priority)
                .await?,
        ),
        Command::AssignTicket { id, assignee } => data(engine.assign_ticket(actor, id, assignee).await?),
        Command::ResolveTicket { id, note } => data(engine.resolve_ticket(actor, id, note).await?),
        Command::Experiments => data(engine.list_experiments(actor).await?),
        Command::CreateExperiment {
            lab_id,
            title,
            description,
        } => data(engine.create_experiment(actor, lab_id, &title, description).await?),
        Command::UploadDocument {
            experiment_id,
            kind,
            title,
            url,
        } => data(
            engine
                .upload_document(actor, experiment_id, kind, &title, url)
                .await?,
        ),
        Command::MyNotifications => data(engine.my_notifications(actor)),
        Command::UnreadCount => data(json!({ "count": engine.unread_count(actor) })),
        Command::MarkNotificationRead { id } => data(engine.mark_notification_read(actor, id).await?),
    }
}

/// Resolve the caller (once) and run the request.
pub async fn execute(engine: &Engine, request: Request) -> Result<Value, EngineError> {
    match request.command {
        Command::Register {
            email,
            name,
            role,
            department,
        } => data(engine.register(&email, &name, role, department).await?),
        Command::Login { email } => data(engine.login(&email)?),
        cmd => {
            let credential = request.credential.as_deref().unwrap_or_default();
            let actor = engine.resolve(credential).await.inspect_err(|_| {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            })?;
            execute_command(engine, &actor, cmd).await
        }
    }
}

/// Parse, execute and time one request line. Never fails: every outcome is a response.
pub async fn handle_line(engine: &Arc<Engine>, line: &str, timeout: Duration) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return Response::error(ErrorKind::Validation, format!("malformed request: {e}")),
    };
    let label = command_label(&request.command);
    let started = Instant::now();

    // The operation runs on its own task so a timeout abandons only the wait,
    // never a half-applied mutation.
    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { execute(&engine, request).await })
    };
    let response = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(value))) => Response::Ok { data: value },
        Ok(Ok(Err(e))) => {
            if e.kind() == ErrorKind::Internal {
                tracing::error!("{label} failed: {e}");
            } else {
                tracing::debug!("{label} refused: {e}");
            }
            Response::from(&e)
        }
        Ok(Err(join_error)) => {
            tracing::error!("{label} task failed: {join_error}");
            Response::error(ErrorKind::Internal, "internal error")
        }
        Err(_) => {
            tracing::warn!("{label} timed out after {timeout:?}");
            Response::error(ErrorKind::Transport, "request timed out; outcome unknown")
        }
    };

    let status = if response.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::REQUESTS_TOTAL, "command" => label, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "command" => label)
        .record(started.elapsed().as_secs_f64());
    response
}

/// Serve one client: one JSON request per line in, one JSON response per line out.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    timeout: Duration,
) -> Result<(), LinesCodecError> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(frame) = lines.next().await {
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&engine, &line, timeout).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                Response::error(ErrorKind::Validation, "request line too long")
            }
            Err(e) => return Err(e),
        };
        let encoded = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"status":"error","kind":"INTERNAL","message":"encode failed"}"#.into());
        lines.send(encoded).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("labslot_test_wire");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    const T: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn malformed_line_is_validation_error() {
        let engine = Arc::new(Engine::new(test_wal_path("malformed.wal")).unwrap());
        let response = handle_line(&engine, "{not json", T).await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Validation, .. }));
    }

    #[tokio::test]
    async fn missing_credential_is_permission_error() {
        let engine = Arc::new(Engine::new(test_wal_path("no_credential.wal")).unwrap());
        let response = handle_line(&engine, r#"{"command":{"op":"me"}}"#, T).await;
        assert!(matches!(response, Response::Error { kind: ErrorKind::Permission, .. }));
    }

    #[tokio::test]
    async fn register_then_me_by_email() {
        let engine = Arc::new(Engine::new(test_wal_path("register_me.wal")).unwrap());
        let response = handle_line(
            &engine,
            r#"{"command":{"op":"register","email":"tech@vit.ac.in","name":"Lab Technician","role":"TECHNICIAN"}}"#,
            T,
        )
        .await;
        assert!(response.is_ok());

        let Response::Ok { data } = handle_line(
            &engine,
            r#"{"credential":"tech@vit.ac.in","command":{"op":"me"}}"#,
            T,
        )
        .await
        else {
            panic!("me failed");
        };
        assert_eq!(data["role"], "TECHNICIAN");
        assert_eq!(data["name"], "Lab Technician");
        assert_eq!(
            engine.login("tech@vit.ac.in").unwrap().role,
            Role::Technician
        );
    }
}
