use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use labslot::engine::Engine;
use labslot::model::LabStatus;
use labslot::wire;

const HOUR: i64 = 3_600_000;
const DAY0: i64 = 1_767_225_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("labslot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("labslot.wal")).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, Duration::from_secs(5)).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    lines: Framed<TcpStream, LinesCodec>,
    credential: Option<String>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            lines: Framed::new(socket, LinesCodec::new()),
            credential: None,
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.lines.send(line.to_string()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), self.lines.next())
            .await
            .expect("no reply")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, command: Value) -> Value {
        let request = match &self.credential {
            Some(c) => json!({ "credential": c, "command": command }),
            None => json!({ "command": command }),
        };
        self.send_raw(&request.to_string()).await
    }

    /// Unwrap an ok response's data.
    async fn ok(&mut self, command: Value) -> Value {
        let response = self.call(command).await;
        assert_eq!(response["status"], "ok", "unexpected response: {response}");
        response["data"].clone()
    }

    async fn error_kind(&mut self, command: Value) -> String {
        let response = self.call(command).await;
        assert_eq!(response["status"], "error", "unexpected response: {response}");
        response["kind"].as_str().unwrap().to_string()
    }

    async fn register(addr: SocketAddr, email: &str, name: &str, role: &str) -> (Self, String) {
        let mut client = Self::connect(addr).await;
        let user = client
            .ok(json!({ "op": "register", "email": email, "name": name, "role": role }))
            .await;
        let id = user["id"].as_str().unwrap().to_string();
        client.credential = Some(id.clone());
        (client, id)
    }
}

async fn automation_lab(engine: &Engine) -> Ulid {
    let lab = engine
        .create_lab("Automation Lab", "SMEC Block, Floor 2", 24, LabStatus::Open)
        .await
        .unwrap();
    let slots: Vec<(i64, i64)> = (8..18)
        .map(|h| (DAY0 + h * HOUR, DAY0 + (h + 1) * HOUR))
        .collect();
    engine.add_slots(lab.id, &slots).await.unwrap();
    lab.id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_round_trip_over_tcp() {
    let (addr, engine) = start_test_server().await;
    let lab_id = automation_lab(&engine).await;

    let (mut student, student_id) =
        Client::register(addr, "student@vit.ac.in", "Student User", "STUDENT").await;
    let (mut faculty, _) =
        Client::register(addr, "faculty@vit.ac.in", "Dr. Faculty", "FACULTY").await;

    let booking = student
        .ok(json!({
            "op": "create_booking",
            "lab_id": lab_id.to_string(),
            "start": DAY0 + 10 * HOUR,
            "end": DAY0 + 12 * HOUR,
            "purpose": "PLC practice",
        }))
        .await;
    assert_eq!(booking["status"], "PENDING");
    assert_eq!(booking["user_id"], student_id.as_str());
    let booking_id = booking["id"].as_str().unwrap().to_string();

    let count = faculty.ok(json!({ "op": "unread_count" })).await;
    assert_eq!(count["count"], 1);
    let inbox = faculty.ok(json!({ "op": "my_notifications" })).await;
    assert_eq!(inbox[0]["kind"], "BOOKING_REQUEST");
    assert_eq!(inbox[0]["related_id"], booking_id.as_str());

    let pending = faculty.ok(json!({ "op": "pending_bookings" })).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);

    let approved = faculty
        .ok(json!({ "op": "approve_booking", "id": booking_id }))
        .await;
    assert_eq!(approved["status"], "CONFIRMED");

    let schedule = student
        .ok(json!({
            "op": "lab_schedule",
            "lab_id": lab_id.to_string(),
            "from": DAY0 + 9 * HOUR,
            "to": DAY0 + 13 * HOUR,
        }))
        .await;
    let statuses: Vec<&str> = schedule
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["status"].as_str().unwrap())
        .collect();
    assert_eq!(statuses, ["AVAILABLE", "BOOKED", "BOOKED", "AVAILABLE"]);

    let inbox = student.ok(json!({ "op": "my_notifications" })).await;
    assert_eq!(inbox[0]["kind"], "BOOKING_APPROVED");
    let notification_id = inbox[0]["id"].as_str().unwrap().to_string();
    let read = student
        .ok(json!({ "op": "mark_notification_read", "id": notification_id }))
        .await;
    assert_eq!(read["read"], true);
    assert_eq!(student.ok(json!({ "op": "unread_count" })).await["count"], 0);

    let cancelled = student
        .ok(json!({ "op": "cancel_booking", "id": booking_id }))
        .await;
    assert_eq!(cancelled["status"], "CANCELLED");
    let schedule = student
        .ok(json!({ "op": "lab_schedule", "lab_id": lab_id.to_string() }))
        .await;
    assert!(
        schedule
            .as_array()
            .unwrap()
            .iter()
            .all(|s| s["status"] == "AVAILABLE")
    );
}

#[tokio::test]
async fn errors_carry_their_kind() {
    let (addr, engine) = start_test_server().await;
    let lab_id = automation_lab(&engine).await;

    let (mut student, _) =
        Client::register(addr, "student@vit.ac.in", "Student User", "STUDENT").await;
    let (mut other, _) =
        Client::register(addr, "student2@vit.ac.in", "Second Student", "STUDENT").await;

    let window = json!({
        "op": "create_booking",
        "lab_id": lab_id.to_string(),
        "start": DAY0 + 10 * HOUR,
        "end": DAY0 + 11 * HOUR,
    });
    let booking = student.ok(window.clone()).await;
    let booking_id = booking["id"].as_str().unwrap().to_string();

    assert_eq!(other.error_kind(window).await, "CONFLICT");
    assert_eq!(
        other
            .error_kind(json!({
                "op": "create_booking",
                "lab_id": lab_id.to_string(),
                "start": DAY0 + 11 * HOUR,
                "end": DAY0 + 11 * HOUR,
            }))
            .await,
        "VALIDATION"
    );
    assert_eq!(
        student
            .error_kind(json!({ "op": "approve_booking", "id": booking_id }))
            .await,
        "PERMISSION"
    );
    assert_eq!(
        other
            .error_kind(json!({ "op": "cancel_booking", "id": booking_id }))
            .await,
        "PERMISSION"
    );
    assert_eq!(
        student
            .error_kind(json!({ "op": "booking", "id": Ulid::new().to_string() }))
            .await,
        "NOT_FOUND"
    );

    let mut anonymous = Client::connect(addr).await;
    assert_eq!(anonymous.error_kind(json!({ "op": "me" })).await, "PERMISSION");
    assert_eq!(
        anonymous
            .error_kind(json!({ "op": "login", "email": "ghost@vit.ac.in" }))
            .await,
        "NOT_FOUND"
    );
}

#[tokio::test]
async fn bad_lines_do_not_close_the_connection() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let response = client.send_raw("{this is not json").await;
    assert_eq!(response["status"], "error");
    assert_eq!(response["kind"], "VALIDATION");

    let response = client
        .send_raw(r#"{"command":{"op":"drop_everything"}}"#)
        .await;
    assert_eq!(response["kind"], "VALIDATION");

    let user = client
        .ok(json!({ "op": "register", "email": "Admin@VIT.ac.in", "name": "Admin User", "role": "ADMIN" }))
        .await;
    assert_eq!(user["email"], "admin@vit.ac.in");

    let again = client
        .ok(json!({ "op": "login", "email": "admin@vit.ac.in" }))
        .await;
    assert_eq!(again["id"], user["id"]);
}

#[tokio::test]
async fn maintenance_flow_over_tcp() {
    let (addr, engine) = start_test_server().await;
    let lab_id = automation_lab(&engine).await;
    let kit = engine
        .add_equipment(lab_id, "PLC Trainer Kit", "PLC", Some("PLC-0042".into()))
        .await
        .unwrap();

    let (mut student, student_id) =
        Client::register(addr, "student@vit.ac.in", "Student User", "STUDENT").await;
    let (mut admin, _) = Client::register(addr, "admin@vit.ac.in", "Admin User", "ADMIN").await;
    let (mut tech, tech_id) =
        Client::register(addr, "tech@vit.ac.in", "Lab Technician", "TECHNICIAN").await;

    let ticket = student
        .ok(json!({
            "op": "report_issue",
            "equipment_id": kit.id.to_string(),
            "lab_id": lab_id.to_string(),
            "description": "Display flickers",
            "priority": "HIGH",
        }))
        .await;
    assert_eq!(ticket["status"], "OPEN");
    let ticket_id = ticket["id"].as_str().unwrap().to_string();

    assert_eq!(
        student
            .error_kind(json!({ "op": "maintenance_tickets" }))
            .await,
        "PERMISSION"
    );

    let assigned = admin
        .ok(json!({ "op": "assign_ticket", "id": ticket_id, "assignee": tech_id }))
        .await;
    assert_eq!(assigned["status"], "IN_PROGRESS");
    assert_eq!(assigned["assigned_to"], tech_id.as_str());

    let resolved = tech
        .ok(json!({ "op": "resolve_ticket", "id": ticket_id, "note": "Replaced ribbon cable" }))
        .await;
    assert_eq!(resolved["status"], "RESOLVED");
    let notes: Vec<&str> = resolved["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["note"].as_str().unwrap())
        .collect();
    assert_eq!(
        notes,
        ["Ticket created", "Assigned to Lab Technician", "Replaced ribbon cable"]
    );

    let inbox = student.ok(json!({ "op": "my_notifications" })).await;
    assert_eq!(inbox[0]["kind"], "MAINTENANCE");
    assert_eq!(inbox[0]["user_id"], student_id.as_str());
}

#[tokio::test]
async fn equipment_requests_over_tcp() {
    let (addr, _engine) = start_test_server().await;
    let (mut student, _) =
        Client::register(addr, "student@vit.ac.in", "Student User", "STUDENT").await;
    let (mut faculty, faculty_id) =
        Client::register(addr, "faculty@vit.ac.in", "Dr. Faculty", "FACULTY").await;
    let (mut admin, _) = Client::register(addr, "admin@vit.ac.in", "Admin User", "ADMIN").await;

    let ask = json!({
        "op": "request_equipment",
        "name": "Digital Oscilloscope",
        "type": "Electronics",
        "reason": "Signal processing lab",
    });
    assert_eq!(student.error_kind(ask.clone()).await, "PERMISSION");

    let request = faculty.ok(ask).await;
    assert_eq!(request["status"], "PENDING");
    assert_eq!(request["requested_by"], faculty_id.as_str());

    admin
        .ok(json!({ "op": "request_equipment", "name": "Robot Arm", "type": "Robotics" }))
        .await;

    let mine = faculty.ok(json!({ "op": "equipment_requests" })).await;
    assert_eq!(mine.as_array().unwrap().len(), 1);
    assert_eq!(mine[0]["id"], request["id"]);
    let all = admin.ok(json!({ "op": "equipment_requests" })).await;
    assert_eq!(all.as_array().unwrap().len(), 2);
}
