use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Smallest span covering both.
    pub fn union(&self, other: &Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

// ── Roles & people ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Faculty,
    Student,
    Technician,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Faculty, Role::Student, Role::Technician];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Faculty => "FACULTY",
            Role::Student => "STUDENT",
            Role::Technician => "TECHNICIAN",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub department: Option<String>,
    pub created_at: Ms,
}

// ── Labs & equipment ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lab {
    pub id: Ulid,
    pub name: String,
    pub location: String,
    pub capacity: u32,
    pub status: LabStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EquipmentStatus {
    Available,
    InUse,
    UnderMaintenance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: Ulid,
    pub lab_id: Ulid,
    pub name: String,
    pub kind: String,
    pub status: EquipmentStatus,
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

/// A user's request for equipment a lab does not have yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentRequest {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
    pub reason: Option<String>,
    pub requested_by: Ulid,
    pub status: RequestStatus,
    pub created_at: Ms,
}

// ── Bookings & slots ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
    /// Time-driven; never produced by the engine itself.
    Completed,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Completed => "COMPLETED",
        }
    }

    /// Pending and confirmed bookings both claim their window.
    pub fn claims_window(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Rejected | BookingStatus::Cancelled | BookingStatus::Completed
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub lab_id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub purpose: Option<String>,
    pub status: BookingStatus,
    pub approved_by: Option<Ulid>,
    pub approved_at: Option<Ms>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Available,
    Booked,
}

/// A pre-generated bookable window of a lab (a lab schedule row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub lab_id: Ulid,
    pub span: Span,
    pub status: SlotStatus,
}

/// Everything that is contended per lab: the lab record, its bookings and its
/// slot grid. Held behind one lock so conflict checks and writes are serialized.
#[derive(Debug, Clone)]
pub struct LabState {
    pub lab: Lab,
    /// Sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Sorted by `span.start`.
    pub slots: Vec<Slot>,
}

impl LabState {
    pub fn new(lab: Lab) -> Self {
        Self {
            lab,
            bookings: Vec::new(),
            slots: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.lab.id
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings whose span overlaps the query window, any status.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping_bookings(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn overlapping_slots(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    pub fn slot_mut(&mut self, id: &Ulid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == *id)
    }
}

// ── Maintenance ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Open => "OPEN",
            TicketStatus::InProgress => "IN_PROGRESS",
            TicketStatus::Resolved => "RESOLVED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: Ms,
    pub note: String,
    pub actor: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceTicket {
    pub id: Ulid,
    pub equipment_id: Ulid,
    pub lab_id: Ulid,
    pub description: String,
    pub reported_by: Ulid,
    pub assigned_to: Option<Ulid>,
    pub status: TicketStatus,
    pub priority: Priority,
    pub created_at: Ms,
    pub updated_at: Ms,
    /// Append-only.
    pub history: Vec<HistoryEntry>,
}

// ── Experiments & documents ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentKind {
    Report,
    Result,
    Sop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Ulid,
    pub experiment_id: Ulid,
    pub kind: DocumentKind,
    pub title: String,
    /// Opaque storage reference.
    pub url: String,
    pub version: u32,
    pub uploaded_by: Ulid,
    pub uploaded_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: Ulid,
    pub lab_id: Ulid,
    pub created_by: Ulid,
    pub title: String,
    pub description: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct ExperimentState {
    pub experiment: Experiment,
    /// Upload order.
    pub documents: Vec<Document>,
}

impl ExperimentState {
    /// Next version for a document title: highest existing version + 1, else 1.
    pub fn next_version(&self, title: &str) -> u32 {
        self.documents
            .iter()
            .filter(|d| d.title == title)
            .map(|d| d.version)
            .max()
            .map_or(1, |v| v + 1)
    }
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    BookingRequest,
    BookingApproved,
    BookingRejected,
    Maintenance,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::BookingRequest => "BOOKING_REQUEST",
            NotificationKind::BookingApproved => "BOOKING_APPROVED",
            NotificationKind::BookingRejected => "BOOKING_REJECTED",
            NotificationKind::Maintenance => "MAINTENANCE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub kind: NotificationKind,
    pub message: String,
    pub related_id: Option<Ulid>,
    /// JSON text.
    pub metadata: Option<String>,
    pub read: bool,
    pub created_at: Ms,
}

/// Flat event enum. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        role: Role,
        department: Option<String>,
        created_at: Ms,
    },
    UserUpdated {
        id: Ulid,
        name: String,
        department: Option<String>,
    },
    LabCreated {
        id: Ulid,
        name: String,
        location: String,
        capacity: u32,
        status: LabStatus,
    },
    EquipmentAdded {
        id: Ulid,
        lab_id: Ulid,
        name: String,
        kind: String,
        status: EquipmentStatus,
        serial_number: Option<String>,
    },
    EquipmentRequested {
        request: EquipmentRequest,
    },
    SlotsAdded {
        lab_id: Ulid,
        slots: Vec<(Ulid, Span)>,
    },
    SlotsMarked {
        lab_id: Ulid,
        slot_ids: Vec<Ulid>,
        status: SlotStatus,
    },
    BookingRequested {
        id: Ulid,
        lab_id: Ulid,
        user_id: Ulid,
        span: Span,
        purpose: Option<String>,
        created_at: Ms,
    },
    BookingApproved {
        id: Ulid,
        lab_id: Ulid,
        approved_by: Ulid,
        approved_at: Ms,
    },
    BookingRejected {
        id: Ulid,
        lab_id: Ulid,
    },
    BookingCancelled {
        id: Ulid,
        lab_id: Ulid,
    },
    TicketReported {
        id: Ulid,
        equipment_id: Ulid,
        lab_id: Ulid,
        description: String,
        reported_by: Ulid,
        priority: Priority,
        at: Ms,
    },
    TicketAssigned {
        id: Ulid,
        assigned_to: Ulid,
        note: String,
        actor: Ulid,
        at: Ms,
    },
    TicketResolved {
        id: Ulid,
        note: String,
        actor: Ulid,
        at: Ms,
    },
    /// Full ticket image, written by compaction so history survives verbatim.
    TicketRestored {
        ticket: MaintenanceTicket,
    },
    ExperimentCreated {
        id: Ulid,
        lab_id: Ulid,
        created_by: Ulid,
        title: String,
        description: Option<String>,
        created_at: Ms,
    },
    DocumentUploaded {
        document: Document,
    },
    NotificationCreated {
        notification: Notification,
    },
    NotificationRead {
        id: Ulid,
    },
}

impl Event {
    /// The lab whose state this event mutates, if it is lab-scoped.
    pub fn lab_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotsAdded { lab_id, .. }
            | Event::SlotsMarked { lab_id, .. }
            | Event::BookingRequested { lab_id, .. }
            | Event::BookingApproved { lab_id, .. }
            | Event::BookingRejected { lab_id, .. }
            | Event::BookingCancelled { lab_id, .. } => Some(*lab_id),
            _ => None,
        }
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

    fn booking(lab_id: Ulid, start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            lab_id,
            user_id: Ulid::new(),
            span: Span::new(start, end),
            purpose: None,
            status,
            approved_by: None,
            approved_at: None,
            created_at: 0,
        }
    }

    fn slot(lab_id: Ulid, start: Ms, end: Ms) -> Slot {
        Slot {
            id: Ulid::new(),
            lab_id,
            span: Span::new(start, end),
            status: SlotStatus::Available,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_union() {
        let a = Span::new(100, 200);
        let b = Span::new(400, 500);
        assert_eq!(a.union(&b), Span::new(100, 500));
        assert_eq!(b.union(&a), Span::new(100, 500));
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut ls = lab();
        let id = ls.id();
        ls.insert_booking(booking(id, 300, 400, BookingStatus::Pending));
        ls.insert_booking(booking(id, 100, 200, BookingStatus::Pending));
        ls.insert_booking(booking(id, 200, 300, BookingStatus::Confirmed));
        let starts: Vec<Ms> = ls.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_bookings_skips_past_and_future() {
        let mut ls = lab();
        let id = ls.id();
        ls.insert_booking(booking(id, 100, 200, BookingStatus::Confirmed));
        ls.insert_booking(booking(id, 450, 600, BookingStatus::Pending));
        ls.insert_booking(booking(id, 1000, 1100, BookingStatus::Confirmed));

        let hits: Vec<_> = ls.overlapping_bookings(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_bookings_adjacent_not_included() {
        let mut ls = lab();
        let id = ls.id();
        ls.insert_booking(booking(id, 100, 200, BookingStatus::Confirmed));
        assert_eq!(ls.overlapping_bookings(&Span::new(200, 300)).count(), 0);
        assert_eq!(ls.overlapping_bookings(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_bookings_long_booking_spanning_query() {
        let mut ls = lab();
        let id = ls.id();
        ls.insert_booking(booking(id, 0, 10_000, BookingStatus::Confirmed));
        assert_eq!(ls.overlapping_bookings(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn overlapping_slots_single_ms_overlap() {
        let mut ls = lab();
        let id = ls.id();
        ls.insert_slot(slot(id, 100, 201));
        ls.insert_slot(slot(id, 300, 400));
        let hits: Vec<_> = ls.overlapping_slots(&Span::new(200, 300)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(100, 201));
    }

    #[test]
    fn booking_status_classes() {
        assert!(BookingStatus::Pending.claims_window());
        assert!(BookingStatus::Confirmed.claims_window());
        assert!(!BookingStatus::Rejected.claims_window());
        assert!(!BookingStatus::Cancelled.claims_window());

        assert!(!BookingStatus::Pending.is_terminal());
        assert!(!BookingStatus::Confirmed.is_terminal());
        assert!(BookingStatus::Rejected.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(BookingStatus::Completed.is_terminal());
    }

    #[test]
    fn next_document_version_per_title() {
        let exp = Experiment {
            id: Ulid::new(),
            lab_id: Ulid::new(),
            created_by: Ulid::new(),
            title: "Control Systems Experiment".into(),
            description: None,
            created_at: 0,
        };
        let mut es = ExperimentState {
            experiment: exp.clone(),
            documents: Vec::new(),
        };
        assert_eq!(es.next_version("Initial Report"), 1);
        for version in [1, 2] {
            es.documents.push(Document {
                id: Ulid::new(),
                experiment_id: exp.id,
                kind: DocumentKind::Report,
                title: "Initial Report".into(),
                url: "/docs/initial-report.pdf".into(),
                version,
                uploaded_by: exp.created_by,
                uploaded_at: 0,
            });
        }
        assert_eq!(es.next_version("Initial Report"), 3);
        assert_eq!(es.next_version("Safety Procedures"), 1);
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&BookingStatus::Confirmed).unwrap();
        assert_eq!(json, "\"CONFIRMED\"");
        let json = serde_json::to_string(&TicketStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let role: Role = serde_json::from_str("\"TECHNICIAN\"").unwrap();
        assert_eq!(role, Role::Technician);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingRequested {
            id: Ulid::new(),
            lab_id: Ulid::new(),
            user_id: Ulid::new(),
            span: Span::new(10, 20),
            purpose: Some("Thesis run".into()),
            created_at: 5,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
