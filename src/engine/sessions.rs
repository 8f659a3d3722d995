use ulid::Ulid;

use crate::calendar::EventHandle;
use crate::limits::*;
use crate::model::*;

use super::error::Party;
use super::overlap::{check_side_free, validate_span};
use super::{Engine, EngineError, TxnGuards};

// ── Role / field authorization ───────────────────────────

/// Who the actor is relative to a session. Parties act as themselves;
/// the admin flag only matters for outsiders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Coach,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionField {
    Start,
    Notes,
    MeetingUrl,
    MeetingAddress,
}

/// The per-(role, status) mutability table. Every edit path consults
/// this; presentation layers get no say.
pub fn permitted_fields(role: Role, status: SessionStatus) -> &'static [SessionField] {
    use SessionField::*;
    use SessionStatus::*;
    match (role, status) {
        (Role::Client, Pending | Changed) => &[Start, Notes],
        (Role::Client, Confirmed | Cancelled) => &[],
        (Role::Coach, Cancelled) => &[],
        (Role::Coach, _) => &[MeetingUrl, MeetingAddress],
        (Role::Admin, _) => &[],
    }
}

/// A committed booking plus the soft outcome of calendar sync.
#[derive(Debug)]
pub struct BookingOutcome {
    pub session_id: Ulid,
    pub sync_warning: Option<String>,
}

#[derive(Debug)]
pub struct CancelOutcome {
    pub sync_warning: Option<String>,
}

impl Engine {
    pub(super) fn role_for(&self, actor: &Ulid, sess: &SessionRecord) -> Result<Role, EngineError> {
        if *actor == sess.client_id {
            return Ok(Role::Client);
        }
        if *actor == sess.coach_id {
            return Ok(Role::Coach);
        }
        if self.user_of(actor)?.admin {
            return Ok(Role::Admin);
        }
        Err(EngineError::PermissionDenied("not a party to this session"))
    }

    pub(super) fn grace_ok(&self, start: Ms, now: Ms) -> bool {
        start - now > self.config.grace_window_ms
    }

    fn grace_hours(&self) -> i64 {
        self.config.grace_window_ms / 3_600_000
    }

    // ── Directory ────────────────────────────────────────

    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        tz: Option<String>,
        admin: bool,
    ) -> Result<(), EngineError> {
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::Invalid("name must be 1..=120 bytes"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let tz = match tz {
            Some(name) => crate::clock::resolve_zone(&name)
                .ok_or(EngineError::UnknownTimezone(name))?,
            None => self.config.default_tz,
        };

        let event = Event::UserRegistered { id, name, tz, admin };
        self.persist_and_apply(&event, &mut TxnGuards::none(), &[id]).await
    }

    pub async fn publish_service(
        &self,
        id: Ulid,
        coach_id: Ulid,
        name: String,
        duration_min: u32,
        price: rust_decimal::Decimal,
        currency: String,
        mode: DeliveryMode,
    ) -> Result<(), EngineError> {
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        self.user_of(&coach_id)?;
        if self.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        validate_service_fields(&name, duration_min, &price, Some(&currency))?;

        let event = Event::ServicePublished {
            id,
            coach_id,
            name,
            duration_min,
            price,
            currency,
            mode,
            active: true,
        };
        self.persist_and_apply(&event, &mut TxnGuards::none(), &[coach_id]).await
    }

    /// Owner or admin only. Existing sessions keep the duration/price
    /// they copied at booking time.
    pub async fn update_service(
        &self,
        id: Ulid,
        actor: Ulid,
        name: String,
        duration_min: u32,
        price: rust_decimal::Decimal,
        active: bool,
    ) -> Result<(), EngineError> {
        let svc = self.service_of(&id)?;
        if actor != svc.coach_id && !self.user_of(&actor)?.admin {
            return Err(EngineError::PermissionDenied("not the owner of this service"));
        }
        validate_service_fields(&name, duration_min, &price, None)?;

        let event = Event::ServiceUpdated { id, name, duration_min, price, active };
        self.persist_and_apply(&event, &mut TxnGuards::none(), &[svc.coach_id]).await
    }

    // ── State machine ────────────────────────────────────

    /// Create a PENDING session plus its payment obligation. The overlap
    /// check and the write happen under both calendar locks; calendar
    /// sync runs after the locks drop.
    pub async fn book_session(
        &self,
        id: Ulid,
        client_id: Ulid,
        service_id: Ulid,
        start: Ms,
        notes: String,
        method: PaymentMethod,
    ) -> Result<BookingOutcome, EngineError> {
        let svc = self.service_of(&service_id)?;
        if !svc.active {
            return Err(EngineError::Invalid("service is not active"));
        }
        let client = self.user_of(&client_id)?;
        let coach = self.user_of(&svc.coach_id)?;
        if client.id == coach.id {
            return Err(EngineError::Invalid("cannot book your own service"));
        }
        if self.sessions.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if notes.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let span = Span::new(start, start + minutes_ms(svc.duration_min));
        validate_span(&span)?;
        let now = self.clock.now_ms();
        if start < now + self.config.min_lead_ms {
            return Err(EngineError::Invalid("start is in the past"));
        }

        let (mut client_cal, mut coach_cal) =
            self.lock_calendar_pair(client.id, coach.id).await?;
        if client_cal.entries.len() >= MAX_SESSIONS_PER_CALENDAR
            || coach_cal.entries.len() >= MAX_SESSIONS_PER_CALENDAR
        {
            return Err(EngineError::LimitExceeded("calendar full"));
        }
        check_side_free(&coach_cal, &span, Party::Coach, None)?;
        check_side_free(&client_cal, &span, Party::Client, None)?;

        let notes_copy = notes.clone();
        let event = Event::SessionBooked {
            id,
            client_id: client.id,
            coach_id: coach.id,
            service_id,
            start,
            duration_min: svc.duration_min,
            mode: svc.mode,
            price: svc.price,
            currency: svc.currency.clone(),
            notes,
            method,
        };
        self.persist_and_apply(
            &event,
            &mut TxnGuards::calendars(&mut client_cal, &mut coach_cal),
            &[client.id, coach.id],
        )
        .await?;
        drop(client_cal);
        drop(coach_cal);

        let sync_warning = self.sync_create(id, &svc, &client, &coach, span, &notes_copy).await;
        Ok(BookingOutcome { session_id: id, sync_warning })
    }

    /// Client edit: start and/or notes. Guarded by the field table and
    /// the grace window against the *current* start; always lands in
    /// CHANGED.
    pub async fn reschedule_session(
        &self,
        session_id: Ulid,
        actor: Ulid,
        new_start: Option<Ms>,
        notes: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(n) = &notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let sess_arc = self.session_of(&session_id)?;
        // Party ids never change, so they can be read before the locks.
        let (client_id, coach_id) = {
            let s = sess_arc.read().await;
            (s.client_id, s.coach_id)
        };
        let (mut client_cal, mut coach_cal) =
            self.lock_calendar_pair(client_id, coach_id).await?;
        let mut sess = sess_arc.write().await;

        let role = self.role_for(&actor, &sess)?;
        if role != Role::Client {
            return Err(EngineError::PermissionDenied("only the booking client may reschedule"));
        }
        if !permitted_fields(role, sess.status).contains(&SessionField::Start) {
            return Err(EngineError::InvalidTransition { from: sess.status, action: "reschedule" });
        }
        let now = self.clock.now_ms();
        if !self.grace_ok(sess.start, now) {
            return Err(EngineError::OutsideGraceWindow { grace_hours: self.grace_hours() });
        }

        let start = new_start.unwrap_or(sess.start);
        let span = Span::new(start, start + minutes_ms(sess.duration_min));
        validate_span(&span)?;
        if start < now + self.config.min_lead_ms {
            return Err(EngineError::Invalid("start is in the past"));
        }
        check_side_free(&coach_cal, &span, Party::Coach, Some(session_id))?;
        check_side_free(&client_cal, &span, Party::Client, Some(session_id))?;

        let event = Event::SessionRescheduled { id: session_id, start, notes };
        self.persist_and_apply(
            &event,
            &mut TxnGuards::full(&mut client_cal, &mut coach_cal, &mut sess),
            &[client_id, coach_id],
        )
        .await
    }

    /// Coach edit: meeting URL and/or address, any status except
    /// CANCELLED. Present fields overwrite, absent fields stay.
    pub async fn set_meeting_details(
        &self,
        session_id: Ulid,
        actor: Ulid,
        meeting_url: Option<String>,
        meeting_address: Option<String>,
    ) -> Result<(), EngineError> {
        if meeting_url.is_none() && meeting_address.is_none() {
            return Err(EngineError::Invalid("no meeting detail supplied"));
        }
        if let Some(url) = &meeting_url
            && url.len() > MAX_URL_LEN
        {
            return Err(EngineError::LimitExceeded("meeting URL too long"));
        }
        if let Some(addr) = &meeting_address
            && addr.len() > MAX_ADDRESS_LEN
        {
            return Err(EngineError::LimitExceeded("meeting address too long"));
        }
        let sess_arc = self.session_of(&session_id)?;
        let mut sess = sess_arc.write().await;

        let role = self.role_for(&actor, &sess)?;
        if role != Role::Coach {
            return Err(EngineError::PermissionDenied("only the coach may set meeting details"));
        }
        if !permitted_fields(role, sess.status).contains(&SessionField::MeetingUrl) {
            return Err(EngineError::InvalidTransition { from: sess.status, action: "edit" });
        }

        let event = Event::MeetingDetailsSet { id: session_id, meeting_url, meeting_address };
        let (client_id, coach_id) = (sess.client_id, sess.coach_id);
        self.persist_and_apply(
            &event,
            &mut TxnGuards::session_only(&mut sess),
            &[client_id, coach_id],
        )
        .await
    }

    /// Coach-only. Requires the mode-appropriate contact detail and a
    /// settled payment; both checks run under the session lock.
    pub async fn confirm_session(&self, session_id: Ulid, actor: Ulid) -> Result<(), EngineError> {
        let sess_arc = self.session_of(&session_id)?;
        let mut sess = sess_arc.write().await;

        let role = self.role_for(&actor, &sess)?;
        if role != Role::Coach {
            return Err(EngineError::PermissionDenied("only the coach may confirm"));
        }
        match sess.status {
            SessionStatus::Pending | SessionStatus::Changed => {}
            from => return Err(EngineError::InvalidTransition { from, action: "confirm" }),
        }
        match sess.mode {
            DeliveryMode::Online if sess.meeting_url.is_none() => {
                return Err(EngineError::MissingMeetingDetail(DeliveryMode::Online));
            }
            DeliveryMode::InPerson if sess.meeting_address.is_none() => {
                return Err(EngineError::MissingMeetingDetail(DeliveryMode::InPerson));
            }
            _ => {}
        }
        // Settlement writes also hold the session lock, so this read
        // cannot race an in-flight settlement.
        if !self.payment_settled(&session_id) {
            return Err(EngineError::PaymentNotSettled(session_id));
        }

        let event = Event::SessionConfirmed { id: session_id };
        let (client_id, coach_id) = (sess.client_id, sess.coach_id);
        self.persist_and_apply(
            &event,
            &mut TxnGuards::session_only(&mut sess),
            &[client_id, coach_id],
        )
        .await
    }

    /// Clients cancel only outside the grace window; coach and admin any
    /// time. CANCELLED is terminal.
    pub async fn cancel_session(
        &self,
        session_id: Ulid,
        actor: Ulid,
    ) -> Result<CancelOutcome, EngineError> {
        let sess_arc = self.session_of(&session_id)?;
        let (client_id, coach_id) = {
            let s = sess_arc.read().await;
            (s.client_id, s.coach_id)
        };
        let (mut client_cal, mut coach_cal) =
            self.lock_calendar_pair(client_id, coach_id).await?;
        let mut sess = sess_arc.write().await;

        let role = self.role_for(&actor, &sess)?;
        if sess.status == SessionStatus::Cancelled {
            return Err(EngineError::InvalidTransition {
                from: SessionStatus::Cancelled,
                action: "cancel",
            });
        }
        let now = self.clock.now_ms();
        if role == Role::Client && !self.grace_ok(sess.start, now) {
            return Err(EngineError::OutsideGraceWindow { grace_hours: self.grace_hours() });
        }

        let handle = sess.calendar_event.clone();
        let event = Event::SessionCancelled { id: session_id };
        self.persist_and_apply(
            &event,
            &mut TxnGuards::full(&mut client_cal, &mut coach_cal, &mut sess),
            &[client_id, coach_id],
        )
        .await?;
        drop(sess);
        drop(client_cal);
        drop(coach_cal);

        let sync_warning = match handle {
            Some(h) => self.sync_delete(session_id, client_id, coach_id, h).await,
            None => None,
        };
        Ok(CancelOutcome { sync_warning })
    }

    /// Client feedback on a confirmed session, once.
    pub async fn leave_review(
        &self,
        session_id: Ulid,
        actor: Ulid,
        rating: u8,
        comment: String,
    ) -> Result<(), EngineError> {
        if !(1..=5).contains(&rating) {
            return Err(EngineError::Invalid("rating must be between 1 and 5"));
        }
        if comment.len() > MAX_COMMENT_LEN {
            return Err(EngineError::LimitExceeded("comment too long"));
        }
        let sess_arc = self.session_of(&session_id)?;
        let sess = sess_arc.write().await;

        if actor != sess.client_id {
            return Err(EngineError::PermissionDenied("only the client may review"));
        }
        if sess.status != SessionStatus::Confirmed {
            return Err(EngineError::InvalidTransition { from: sess.status, action: "review" });
        }
        if self.reviews.contains_key(&session_id) {
            return Err(EngineError::AlreadyExists(session_id));
        }

        let event = Event::ReviewLeft {
            session_id,
            rating,
            comment,
            at: self.clock.now_ms(),
        };
        let (client_id, coach_id) = (sess.client_id, sess.coach_id);
        self.persist_and_apply(&event, &mut TxnGuards::none(), &[client_id, coach_id]).await
    }

    // ── Calendar sync (soft-fail, outside the locks) ─────

    async fn sync_create(
        &self,
        session_id: Ulid,
        svc: &ServiceState,
        client: &UserProfile,
        coach: &UserProfile,
        span: Span,
        notes: &str,
    ) -> Option<String> {
        let summary = format!("{} with {}", svc.name, client.name);
        let result = self
            .calendar_sync
            .create_event(coach, &summary, notes, span, coach.tz)
            .await;
        match result {
            Ok(Some(handle)) => {
                // The handle gets its own record; a crash between the
                // booking and this append loses the link, never the
                // booking.
                let Ok(sess_arc) = self.session_of(&session_id) else { return None };
                let mut sess = sess_arc.write().await;
                // A cancel can land while the provider call is in
                // flight; CANCELLED is terminal, so a handle linked now
                // could never be deleted. Remove the event instead.
                if sess.status == SessionStatus::Cancelled {
                    drop(sess);
                    return match self.calendar_sync.delete_event(coach, &handle).await {
                        Ok(()) => None,
                        Err(e) => {
                            metrics::counter!(crate::observability::CALENDAR_SYNC_FAILURES_TOTAL)
                                .increment(1);
                            tracing::warn!(session = %session_id, error = %e, "calendar delete failed");
                            Some(format!("calendar sync failed: {e}"))
                        }
                    };
                }
                let event = Event::CalendarEventLinked { id: session_id, handle: handle.0 };
                match self
                    .persist_and_apply(
                        &event,
                        &mut TxnGuards::session_only(&mut sess),
                        &[client.id, coach.id],
                    )
                    .await
                {
                    Ok(()) => None,
                    Err(e) => Some(format!("calendar event created but not linked: {e}")),
                }
            }
            Ok(None) => None,
            Err(e) => {
                metrics::counter!(crate::observability::CALENDAR_SYNC_FAILURES_TOTAL)
                    .increment(1);
                tracing::warn!(session = %session_id, error = %e, "calendar create failed");
                Some(format!("calendar sync failed: {e}"))
            }
        }
    }

    async fn sync_delete(
        &self,
        session_id: Ulid,
        client_id: Ulid,
        coach_id: Ulid,
        handle: String,
    ) -> Option<String> {
        let Ok(coach) = self.user_of(&coach_id) else { return None };
        match self.calendar_sync.delete_event(&coach, &EventHandle(handle)).await {
            Ok(()) => {
                let Ok(sess_arc) = self.session_of(&session_id) else { return None };
                let mut sess = sess_arc.write().await;
                let event = Event::CalendarEventUnlinked { id: session_id };
                match self
                    .persist_and_apply(
                        &event,
                        &mut TxnGuards::session_only(&mut sess),
                        &[client_id, coach_id],
                    )
                    .await
                {
                    Ok(()) => None,
                    Err(e) => Some(format!("calendar event deleted but not unlinked: {e}")),
                }
            }
            Err(e) => {
                metrics::counter!(crate::observability::CALENDAR_SYNC_FAILURES_TOTAL)
                    .increment(1);
                tracing::warn!(session = %session_id, error = %e, "calendar delete failed");
                Some(format!("calendar sync failed: {e}"))
            }
        }
    }
}

fn validate_service_fields(
    name: &str,
    duration_min: u32,
    price: &rust_decimal::Decimal,
    currency: Option<&str>,
) -> Result<(), EngineError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EngineError::Invalid("name must be 1..=120 bytes"));
    }
    if duration_min == 0 {
        return Err(EngineError::Invalid("duration must be positive"));
    }
    if duration_min > MAX_SESSION_MINUTES {
        return Err(EngineError::LimitExceeded("session too long"));
    }
    if price.is_sign_negative() {
        return Err(EngineError::Invalid("price must not be negative"));
    }
    if let Some(cur) = currency
        && (cur.is_empty() || cur.len() > MAX_CURRENCY_LEN)
    {
        return Err(EngineError::Invalid("currency must be 1..=8 bytes"));
    }
    Ok(())
}
