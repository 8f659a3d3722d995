use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds UTC — the only time type inside the engine.
pub type Ms = i64;

/// Milliseconds in one minute.
pub const MINUTE_MS: Ms = 60_000;

pub const fn minutes_ms(minutes: u32) -> Ms {
    minutes as Ms * MINUTE_MS
}

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
}

/// Session lifecycle. CANCELLED is terminal; everything else occupies
/// calendar time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Changed,
    Confirmed,
    Cancelled,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Changed => "changed",
            SessionStatus::Confirmed => "confirmed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How the session is delivered. Fixed at booking time, copied from the
/// service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Online,
    InPerson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Paypal,
    Venmo,
    Cash,
}

/// One identity, usable as client in one session and coach in another.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: Ulid,
    pub name: String,
    /// IANA zone used for availability rendering and view-local times.
    pub tz: Tz,
    pub admin: bool,
}

#[derive(Debug, Clone)]
pub struct ServiceState {
    pub id: Ulid,
    pub coach_id: Ulid,
    pub name: String,
    pub duration_min: u32,
    pub price: Decimal,
    pub currency: String,
    pub mode: DeliveryMode,
    pub active: bool,
}

/// A booking. Never deleted; cancellation is a status flip. Duration,
/// price, currency and mode are copies frozen at booking time.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Ulid,
    pub client_id: Ulid,
    pub coach_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub duration_min: u32,
    pub mode: DeliveryMode,
    pub status: SessionStatus,
    pub notes: String,
    pub meeting_url: Option<String>,
    pub meeting_address: Option<String>,
    /// Handle returned by the external calendar provider, if any.
    pub calendar_event: Option<String>,
    pub price: Decimal,
    pub currency: String,
}

impl SessionRecord {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.start + minutes_ms(self.duration_min))
    }
}

/// The single payment obligation attached to a session. `settled_at`
/// stays `None` until the external processor confirms.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub session_id: Ulid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub settled_at: Option<Ms>,
    pub external_ref: Option<String>,
}

impl PaymentRecord {
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some()
    }
}

/// Client feedback on a confirmed session. At most one per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub session_id: Ulid,
    pub rating: u8,
    pub comment: String,
    pub at: Ms,
}

/// One calendar entry: the time a non-cancelled session occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub session_id: Ulid,
    pub span: Span,
}

/// Per-user occupancy index. Every user owns exactly one; a session
/// appears in both its client's and its coach's calendar.
#[derive(Debug, Clone)]
pub struct CalendarState {
    pub owner: Ulid,
    /// All occupancies, sorted by `span.start`.
    pub entries: Vec<Occupancy>,
}

impl CalendarState {
    pub fn new(owner: Ulid) -> Self {
        Self { owner, entries: Vec::new() }
    }

    /// Insert an occupancy maintaining sort order by span.start.
    pub fn occupy(&mut self, session_id: Ulid, span: Span) {
        let pos = self
            .entries
            .binary_search_by_key(&span.start, |o| o.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, Occupancy { session_id, span });
    }

    /// Remove the occupancy of a session.
    pub fn vacate(&mut self, session_id: Ulid) -> Option<Occupancy> {
        if let Some(pos) = self.entries.iter().position(|o| o.session_id == session_id) {
            Some(self.entries.remove(pos))
        } else {
            None
        }
    }

    /// Move a session's occupancy to a new span.
    pub fn reassign(&mut self, session_id: Ulid, span: Span) {
        self.vacate(session_id);
        self.occupy(session_id, span);
    }

    /// Return only occupancies whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Occupancy> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.entries.partition_point(|o| o.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |o| o.span.end > query.start)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        tz: Tz,
        admin: bool,
    },
    ServicePublished {
        id: Ulid,
        coach_id: Ulid,
        name: String,
        duration_min: u32,
        price: Decimal,
        currency: String,
        mode: DeliveryMode,
        active: bool,
    },
    ServiceUpdated {
        id: Ulid,
        name: String,
        duration_min: u32,
        price: Decimal,
        active: bool,
    },
    SessionBooked {
        id: Ulid,
        client_id: Ulid,
        coach_id: Ulid,
        service_id: Ulid,
        start: Ms,
        duration_min: u32,
        mode: DeliveryMode,
        price: Decimal,
        currency: String,
        notes: String,
        method: PaymentMethod,
    },
    /// Client edit: new start (possibly unchanged) and optionally new
    /// notes. Always flips the session to CHANGED.
    SessionRescheduled {
        id: Ulid,
        start: Ms,
        notes: Option<String>,
    },
    /// Coach edit: present fields overwrite, absent fields keep their
    /// value.
    MeetingDetailsSet {
        id: Ulid,
        meeting_url: Option<String>,
        meeting_address: Option<String>,
    },
    SessionConfirmed {
        id: Ulid,
    },
    SessionCancelled {
        id: Ulid,
    },
    CalendarEventLinked {
        id: Ulid,
        handle: String,
    },
    CalendarEventUnlinked {
        id: Ulid,
    },
    PaymentSettled {
        session_id: Ulid,
        external_ref: Option<String>,
        at: Ms,
    },
    ReviewLeft {
        session_id: Ulid,
        rating: u8,
        comment: String,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A bookable start offered by the availability calculator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub start: Ms,
    pub end: Ms,
    /// Rendered in the coach's zone, e.g. `Monday 05.05.2025 14:00`.
    pub label: String,
}

/// Per-actor session read. `editable`/`cancelable` are computed for the
/// requesting actor from role, status and the grace window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: Ulid,
    pub client_id: Ulid,
    pub coach_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    /// RFC 3339 rendering of `start` in the viewer's zone.
    pub start_local: String,
    pub duration_min: u32,
    pub mode: DeliveryMode,
    pub status: SessionStatus,
    pub notes: String,
    pub meeting_url: Option<String>,
    pub meeting_address: Option<String>,
    pub calendar_event: Option<String>,
    pub price: Decimal,
    pub currency: String,
    pub editable: bool,
    pub cancelable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub coach_id: Ulid,
    pub name: String,
    pub duration_min: u32,
    pub price: Decimal,
    pub currency: String,
    pub mode: DeliveryMode,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentInfo {
    pub session_id: Ulid,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub settled_at: Option<Ms>,
    pub external_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn occupancy_ordering() {
        let mut cal = CalendarState::new(Ulid::new());
        cal.occupy(Ulid::new(), Span::new(300, 400));
        cal.occupy(Ulid::new(), Span::new(100, 200));
        cal.occupy(Ulid::new(), Span::new(200, 300));
        assert_eq!(cal.entries[0].span.start, 100);
        assert_eq!(cal.entries[1].span.start, 200);
        assert_eq!(cal.entries[2].span.start, 300);
    }

    #[test]
    fn vacate_removes_entry() {
        let mut cal = CalendarState::new(Ulid::new());
        let id = Ulid::new();
        cal.occupy(id, Span::new(100, 200));
        assert_eq!(cal.entries.len(), 1);
        cal.vacate(id);
        assert!(cal.entries.is_empty());
    }

    #[test]
    fn vacate_nonexistent_returns_none() {
        let mut cal = CalendarState::new(Ulid::new());
        cal.occupy(Ulid::new(), Span::new(100, 200));
        assert!(cal.vacate(Ulid::new()).is_none());
        assert_eq!(cal.entries.len(), 1); // original still there
    }

    #[test]
    fn reassign_preserves_order() {
        let mut cal = CalendarState::new(Ulid::new());
        let id = Ulid::new();
        cal.occupy(id, Span::new(100, 200));
        cal.occupy(Ulid::new(), Span::new(300, 400));
        cal.reassign(id, Span::new(500, 600));
        assert_eq!(cal.entries.len(), 2);
        assert_eq!(cal.entries[0].span.start, 300);
        assert_eq!(cal.entries[1].span.start, 500);
        assert_eq!(cal.entries[1].session_id, id);
    }

    #[test]
    fn overlapping_skips_disjoint() {
        let mut cal = CalendarState::new(Ulid::new());
        cal.occupy(Ulid::new(), Span::new(100, 200)); // past
        cal.occupy(Ulid::new(), Span::new(450, 600)); // hits
        cal.occupy(Ulid::new(), Span::new(1000, 1100)); // starts after query end
        let query = Span::new(500, 800);
        let hits: Vec<_> = cal.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        // Entry ending exactly at query.start is NOT overlapping (half-open)
        let mut cal = CalendarState::new(Ulid::new());
        cal.occupy(Ulid::new(), Span::new(100, 200));
        let query = Span::new(200, 300);
        assert!(cal.overlapping(&query).next().is_none());
    }

    #[test]
    fn overlapping_entry_spanning_query() {
        let mut cal = CalendarState::new(Ulid::new());
        cal.occupy(Ulid::new(), Span::new(0, 10_000));
        let query = Span::new(500, 600);
        assert_eq!(cal.overlapping(&query).count(), 1);
    }

    #[test]
    fn overlapping_empty_calendar() {
        let cal = CalendarState::new(Ulid::new());
        let query = Span::new(0, 1000);
        assert!(cal.overlapping(&query).next().is_none());
    }

    #[test]
    fn overlapping_single_ms() {
        let mut cal = CalendarState::new(Ulid::new());
        // [100, 201) overlaps query [200, 300) by exactly 1ms
        cal.occupy(Ulid::new(), Span::new(100, 201));
        let query = Span::new(200, 300);
        assert_eq!(cal.overlapping(&query).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::SessionBooked {
            id: Ulid::new(),
            client_id: Ulid::new(),
            coach_id: Ulid::new(),
            service_id: Ulid::new(),
            start: 1_700_000_000_000,
            duration_min: 60,
            mode: DeliveryMode::Online,
            price: Decimal::new(75_00, 2),
            currency: "USD".into(),
            notes: "first call".into(),
            method: PaymentMethod::Paypal,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn zone_serialization_roundtrip() {
        let event = Event::UserRegistered {
            id: Ulid::new(),
            name: "Mira".into(),
            tz: chrono_tz::Europe::Prague,
            admin: false,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
